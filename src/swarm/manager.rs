//! SwarmManager - owns the sandbox instance lifecycle.
//!
//! Spawn provisions sandboxes concurrently, sets up workspace content,
//! and launches the coding agent detached (the Launch phase). Completion
//! is only ever observed later through explicit reconciliation
//! (`check_instance`) - there are no push notifications from sandboxes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::instance::{GitOptions, InstanceStatus, SourceType, SwarmInstance};
use crate::sandbox::SandboxApi;
use crate::tasks::Task;
use crate::{hlog, hlog_debug, hlog_error, hlog_warn, Error, Result};

pub const WORKSPACE_DIR: &str = "/workspace";
pub const REPO_DIR: &str = "/workspace/repo";
pub const TASKS_DIR: &str = "/workspace/tasks";
pub const PROMPT_FILE: &str = "/workspace/PROMPT.md";
pub const OUTPUT_FILE: &str = "/workspace/agent-output.log";
pub const PID_FILE: &str = "/workspace/agent.pid";

/// Files larger than this are skipped during local uploads.
const MAX_UPLOAD_BYTES: u64 = 1024 * 1024;

/// Directory and file names always excluded from local uploads.
const DEFAULT_EXCLUDES: &[&str] = &[
    "node_modules",
    ".git",
    "target",
    "dist",
    "build",
    "__pycache__",
    ".next",
    ".cache",
];

/// Options for one spawn batch. `buckets.len()` is the instance count.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub source: String,
    pub source_type: SourceType,
    pub branch: Option<String>,
    pub new_branch: Option<String>,
    pub buckets: Vec<Vec<Task>>,
    pub exclude: Vec<String>,
    pub include: Vec<String>,
    pub git: GitOptions,
}

/// Read-only result bundle returned by `collect_results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectedResult {
    pub output: Option<String>,
    pub tasks: Vec<Task>,
    pub logs: Option<String>,
}

pub struct SwarmManager {
    api: Arc<dyn SandboxApi>,
    config: Config,
}

impl SwarmManager {
    pub fn new(api: Arc<dyn SandboxApi>, config: Config) -> Self {
        Self { api, config }
    }

    pub fn api(&self) -> &dyn SandboxApi {
        self.api.as_ref()
    }

    /// Launch phase: provision and set up one instance per task bucket,
    /// all concurrently. A failure in any instance's flow is recorded on
    /// that instance (`Failed` + error) and never aborts its siblings.
    /// Returns as soon as every agent is launched (or failed) - agent
    /// completion is observed later via `check_instance`.
    pub async fn spawn(&self, opts: &SpawnOptions) -> Result<Vec<SwarmInstance>> {
        let export_root = Config::exports_dir()?;
        let log_root = Config::logs_dir()?;

        let flows = opts.buckets.iter().map(|bucket| {
            let mut instance = SwarmInstance::new(
                &self.config.template,
                &opts.source,
                opts.source_type,
                opts.branch.clone(),
                opts.new_branch.clone(),
                bucket.clone(),
                build_prompt(bucket),
                &export_root,
                &log_root,
                opts.git.clone(),
            );
            async move {
                if let Err(e) = self.provision(&mut instance, opts).await {
                    hlog_error!(
                        "spawn: instance {} failed during setup: {}",
                        instance.short_id(),
                        e
                    );
                    self.log_instance(&instance, &format!("setup failed: {}", e));
                    instance.fail(e.to_string());
                }
                instance
            }
        });

        let instances = futures::future::join_all(flows).await;
        let ok = instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Running)
            .count();
        hlog!(
            "spawn: {} of {} instances running",
            ok,
            instances.len()
        );
        Ok(instances)
    }

    async fn provision(&self, instance: &mut SwarmInstance, opts: &SpawnOptions) -> Result<()> {
        self.log_instance(
            instance,
            &format!("provisioning sandbox (template={})", instance.template),
        );
        let sandbox_id = self
            .api
            .create(&instance.template, self.config.timeout())
            .await?;
        instance.sandbox_id = sandbox_id;
        hlog_debug!(
            "spawn: instance {} -> sandbox {}",
            instance.short_id(),
            instance.sandbox_id
        );

        match instance.source_type {
            SourceType::Local => {
                instance.transition(InstanceStatus::Uploading)?;
                self.upload_tree(instance, &opts.exclude, &opts.include)
                    .await?;
            }
            SourceType::Repo => {
                instance.transition(InstanceStatus::Cloning)?;
                self.clone_repo(instance).await?;
            }
        }

        self.finish_setup(instance).await
    }

    /// Walk the local tree and write surviving files into the sandbox
    /// workspace one by one. Per-file upload failures are logged and
    /// skipped; only a completely unreadable source is fatal.
    async fn upload_tree(
        &self,
        instance: &SwarmInstance,
        exclude: &[String],
        include: &[String],
    ) -> Result<()> {
        let root = PathBuf::from(&instance.source);
        if !root.is_dir() {
            return Err(Error::Source(format!(
                "local source is not a directory: {}",
                instance.source
            )));
        }

        let mut files = Vec::new();
        collect_files(&root, &root, exclude, include, &mut files)?;
        hlog_debug!(
            "upload: {} files from {} after excludes",
            files.len(),
            root.display()
        );

        let mut uploaded = 0usize;
        for rel in files {
            let abs = root.join(&rel);
            let remote = format!("{}/{}", WORKSPACE_DIR, rel.to_string_lossy());
            let bytes = match std::fs::read(&abs) {
                Ok(b) => b,
                Err(e) => {
                    hlog_warn!("upload: skipping unreadable {}: {}", abs.display(), e);
                    continue;
                }
            };
            if let Err(e) = self
                .api
                .write_file(&instance.sandbox_id, &remote, &bytes)
                .await
            {
                hlog_warn!("upload: skipping {}: {}", remote, e);
                continue;
            }
            uploaded += 1;
        }
        self.log_instance(instance, &format!("uploaded {} files", uploaded));
        Ok(())
    }

    /// Shallow clone of the given or default branch. Clone failure is
    /// fatal to this instance.
    async fn clone_repo(&self, instance: &SwarmInstance) -> Result<()> {
        let branch_arg = instance
            .branch
            .as_ref()
            .map(|b| format!("-b {} ", b))
            .unwrap_or_default();
        let cmd = format!(
            "git clone --depth 1 {}{} {}",
            branch_arg, instance.source, REPO_DIR
        );
        let out = self
            .api
            .run_command(&instance.sandbox_id, &cmd, None)
            .await?;
        if !out.success() {
            return Err(Error::Source(format!("clone failed: {}", out.detail())));
        }
        self.log_instance(instance, &format!("cloned {}", instance.source));
        Ok(())
    }

    /// Shared setup tail: task files, prompt, best-effort dependency
    /// install, then the detached agent launch. Returns immediately
    /// after launch without awaiting agent completion.
    async fn finish_setup(&self, instance: &mut SwarmInstance) -> Result<()> {
        instance.transition(InstanceStatus::SettingUp)?;
        let sandbox_id = instance.sandbox_id.clone();

        self.api
            .run_command(&sandbox_id, &format!("mkdir -p {}", TASKS_DIR), None)
            .await?;
        for task in &instance.tasks {
            let path = format!("{}/task-{}.json", TASKS_DIR, task.id);
            let body = serde_json::to_vec_pretty(task)?;
            self.api.write_file(&sandbox_id, &path, &body).await?;
        }
        self.api
            .write_file(&sandbox_id, PROMPT_FILE, instance.prompt.as_bytes())
            .await?;

        // Best-effort dependency install; a broken lockfile should not
        // stop the agent from being launched.
        let workdir = workdir_for(instance.source_type);
        let install = format!(
            "cd {} && if [ -f package.json ]; then npm install --no-audit --no-fund; fi; \
             if [ -f requirements.txt ]; then pip install -r requirements.txt; fi",
            workdir
        );
        match self.api.run_command(&sandbox_id, &install, None).await {
            Ok(out) if !out.success() => {
                hlog_warn!(
                    "setup: dependency install failed for {} (ignored): {}",
                    instance.short_id(),
                    out.detail()
                );
            }
            Err(e) => {
                hlog_warn!(
                    "setup: dependency install errored for {} (ignored): {}",
                    instance.short_id(),
                    e
                );
            }
            _ => {}
        }

        instance.transition(InstanceStatus::Running)?;
        let env = instance_agent_env(&self.config);
        let launch = format!(
            "cd {} && {}nohup {} {} > {} 2>&1 & echo $! > {}",
            workdir,
            env,
            self.config.effective_agent_command(),
            PROMPT_FILE,
            OUTPUT_FILE,
            PID_FILE
        );
        let out = self.api.run_command(&sandbox_id, &launch, None).await?;
        if !out.success() {
            return Err(Error::Sandbox(format!(
                "agent launch failed: {}",
                out.detail()
            )));
        }
        self.log_instance(instance, "agent launched (detached)");
        Ok(())
    }

    /// Reconcile phase: probe the detached agent's liveness and record
    /// an observed exit. Idempotent and safe to call repeatedly;
    /// terminal and never-provisioned instances are left untouched.
    pub async fn check_instance(&self, instance: &mut SwarmInstance) -> Result<()> {
        if instance.status.is_terminal() || instance.sandbox_id.is_empty() {
            return Ok(());
        }
        if instance.status != InstanceStatus::Running {
            return Ok(());
        }

        if let Err(e) = self.api.connect(&instance.sandbox_id).await {
            // Covers sandboxes expired or terminated out from under us.
            self.log_instance(instance, &format!("lost connectivity: {}", e));
            instance.fail(format!("lost connectivity to sandbox: {}", e));
            return Ok(());
        }

        let pid = match self.api.read_file(&instance.sandbox_id, PID_FILE).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                hlog_debug!(
                    "check: no pid marker yet for {}: {}",
                    instance.short_id(),
                    e
                );
                return Ok(());
            }
        };

        let probe = match self
            .api
            .run_command(
                &instance.sandbox_id,
                &format!("kill -0 {} 2>/dev/null", pid),
                None,
            )
            .await
        {
            Ok(out) => out,
            Err(e) => {
                self.log_instance(instance, &format!("lost connectivity: {}", e));
                instance.fail(format!("lost connectivity to sandbox: {}", e));
                return Ok(());
            }
        };

        if probe.success() {
            hlog_debug!("check: {} still running (pid {})", instance.short_id(), pid);
            return Ok(());
        }

        let output = self
            .api
            .read_file(&instance.sandbox_id, OUTPUT_FILE)
            .await
            .ok();
        instance.complete(output);
        self.log_instance(instance, "agent exited, marked completed");
        hlog!("check: instance {} completed", instance.short_id());
        Ok(())
    }

    /// Poll-loop watcher over the Reconcile phase: re-check at the
    /// given interval until the instance reaches a terminal state.
    pub async fn wait_until_terminal(
        &self,
        instance: &mut SwarmInstance,
        interval: Duration,
    ) -> Result<()> {
        loop {
            self.check_instance(instance).await?;
            if instance.status.is_terminal() {
                return Ok(());
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Pure read: re-read the output file and re-parse every per-task
    /// JSON file (the agent mutates them as it works). Files that fail
    /// to parse are skipped. Never mutates the stored instance.
    pub async fn collect_results(&self, instance: &SwarmInstance) -> Result<CollectedResult> {
        let logs = std::fs::read_to_string(&instance.log_file).ok();

        if instance.sandbox_id.is_empty() {
            return Ok(CollectedResult {
                output: instance.output.clone(),
                tasks: instance.tasks.clone(),
                logs,
            });
        }

        let output = self
            .api
            .read_file(&instance.sandbox_id, OUTPUT_FILE)
            .await
            .ok()
            .or_else(|| instance.output.clone());

        let mut tasks = Vec::new();
        match self
            .api
            .run_command(&instance.sandbox_id, &format!("ls {}", TASKS_DIR), None)
            .await
        {
            Ok(listing) if listing.success() => {
                for name in listing.stdout.split_whitespace() {
                    if !name.starts_with("task-") || !name.ends_with(".json") {
                        continue;
                    }
                    let path = format!("{}/{}", TASKS_DIR, name);
                    match self.api.read_file(&instance.sandbox_id, &path).await {
                        Ok(text) => match serde_json::from_str::<Task>(&text) {
                            Ok(task) => tasks.push(task),
                            Err(e) => {
                                hlog_warn!("collect: skipping unparsable {}: {}", path, e)
                            }
                        },
                        Err(e) => hlog_warn!("collect: skipping unreadable {}: {}", path, e),
                    }
                }
            }
            _ => {
                // Sandbox unreachable or tasks dir gone; fall back to
                // the task list recorded at spawn time.
                tasks = instance.tasks.clone();
            }
        }

        Ok(CollectedResult {
            output,
            tasks,
            logs,
        })
    }

    /// Force-terminate the sandbox. A user kill is modeled as a
    /// failure, not a distinct terminal state. No-op when the instance
    /// was never provisioned.
    pub async fn kill(&self, instance: &mut SwarmInstance) -> Result<()> {
        if instance.sandbox_id.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.api.kill(&instance.sandbox_id).await {
            // The sandbox may already be gone; record the kill anyway.
            hlog_warn!("kill: terminate call failed for {}: {}", instance.short_id(), e);
        }
        instance.fail("Killed by user");
        self.log_instance(instance, "killed by user");
        Ok(())
    }

    /// Append a timestamped line to the instance's local log file.
    /// Best-effort; logging never fails an operation.
    fn log_instance(&self, instance: &SwarmInstance, msg: &str) {
        use std::io::Write;
        if let Some(parent) = instance.log_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&instance.log_file)
        {
            let _ = writeln!(file, "[{}] {}", Utc::now().format("%Y-%m-%dT%H:%M:%S"), msg);
        }
    }
}

fn workdir_for(source_type: SourceType) -> &'static str {
    match source_type {
        SourceType::Repo => REPO_DIR,
        SourceType::Local => WORKSPACE_DIR,
    }
}

fn instance_agent_env(config: &Config) -> String {
    config
        .agent_api_key
        .as_deref()
        .map(|key| format!("AGENT_API_KEY={} ", key))
        .unwrap_or_default()
}

/// Combined prompt instructing the agent to process its task files
/// sequentially: read, mark in-progress, complete, advance.
pub fn build_prompt(tasks: &[Task]) -> String {
    let mut prompt = String::from(
        "You are working through a queue of task files in /workspace/tasks.\n\
         Process them strictly in the order listed below. For each task:\n\
         1. Read the task file.\n\
         2. Set its \"status\" field to \"in_progress\" and write the file back.\n\
         3. Do the work described by the subject and description.\n\
         4. Set its \"status\" field to \"completed\" and write the file back.\n\
         5. Move on to the next task.\n\n",
    );
    if tasks.is_empty() {
        prompt.push_str("No tasks are assigned. Exit immediately.\n");
        return prompt;
    }
    prompt.push_str("Tasks:\n");
    for task in tasks {
        let title = if task.subject.is_empty() {
            &task.description
        } else {
            &task.subject
        };
        prompt.push_str(&format!(
            "- task-{}.json: {}\n",
            task.id,
            title.lines().next().unwrap_or("")
        ));
    }
    prompt
}

/// Recursively gather files under `dir`, applying default excludes,
/// user excludes/includes, and the per-file size cap. Paths collected
/// are relative to `root`.
fn collect_files(
    root: &Path,
    dir: &Path,
    exclude: &[String],
    include: &[String],
    out: &mut Vec<PathBuf>,
) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.flatten().collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let excluded = is_excluded(&name, exclude) && !matches_any(&name, include);

        if path.is_dir() {
            if excluded {
                hlog_debug!("upload: pruning directory {}", path.display());
                continue;
            }
            collect_files(root, &path, exclude, include, out)?;
            continue;
        }

        if excluded {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > MAX_UPLOAD_BYTES {
            hlog_warn!(
                "upload: skipping {} ({} bytes, over the 1MB cap)",
                path.display(),
                size
            );
            continue;
        }
        if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}

fn is_excluded(name: &str, user_exclude: &[String]) -> bool {
    if DEFAULT_EXCLUDES.contains(&name) || name.starts_with(".env") {
        return true;
    }
    matches_any(name, user_exclude)
}

fn matches_any(name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| pattern_matches(p, name))
}

/// Exact-name or simple single-`*` wildcard matching.
fn pattern_matches(pattern: &str, name: &str) -> bool {
    match pattern.find('*') {
        None => pattern == name,
        Some(pos) => {
            let (prefix, suffix) = (&pattern[..pos], &pattern[pos + 1..]);
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
    }
}
