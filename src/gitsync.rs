//! Post-hoc git sync: commit, push, and pull-request workflow run
//! inside a repo-sourced instance's sandbox.
//!
//! Every step returns a `SyncStep` result instead of erroring so one
//! instance's failure never aborts a multi-instance batch. The sync
//! sub-chain `Committing -> Pushing -> CreatingPr` resolves to
//! `Completed` on full success or `Failed` at the first failing step.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::instance::{InstanceStatus, SourceType, SwarmInstance};
use crate::sandbox::SandboxApi;
use crate::swarm::manager::REPO_DIR;
use crate::{hlog, hlog_debug, hlog_warn, Error, Result};

/// Outcome of a single sync step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStep {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

impl SyncStep {
    fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(msg.into()),
            ..Default::default()
        }
    }
}

/// Which sync steps to run for an instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub commit: bool,
    pub push: bool,
    pub create_pr: bool,
}

impl SyncOptions {
    /// CLI flags win when any is set; otherwise fall back to the git
    /// options recorded on the instance at spawn time.
    pub fn for_instance(instance: &SwarmInstance, cli: SyncOptions) -> Self {
        if cli.commit || cli.push || cli.create_pr {
            cli
        } else {
            SyncOptions {
                commit: instance.git.auto_commit,
                push: instance.git.auto_push,
                create_pr: instance.git.create_pr,
            }
        }
    }
}

/// Working-tree status parsed from `git status --porcelain --branch`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitStatus {
    pub branch: Option<String>,
    pub modified: Vec<String>,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
}

impl GitStatus {
    pub fn is_clean(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.deleted.is_empty()
    }

    pub fn changed_paths(&self) -> impl Iterator<Item = &String> {
        self.modified.iter().chain(self.added.iter())
    }
}

/// Parse porcelain v1 output into modified/added/deleted sets plus the
/// current branch.
pub fn parse_porcelain(output: &str) -> GitStatus {
    let mut status = GitStatus::default();
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("## ") {
            // "## main...origin/main [ahead 1]" or "## HEAD (no branch)"
            let name = rest.split("...").next().unwrap_or(rest).trim();
            if !name.starts_with("HEAD") {
                status.branch = Some(name.to_string());
            }
            continue;
        }
        if line.len() < 3 {
            continue;
        }
        let code = &line[..2];
        let path = line[3..].trim().to_string();
        if code.contains('D') {
            status.deleted.push(path);
        } else if code.contains('A') || code == "??" {
            status.added.push(path);
        } else {
            status.modified.push(path);
        }
    }
    status
}

/// Git operations run inside a sandbox on behalf of one instance.
pub struct GitSync<'a> {
    api: &'a dyn SandboxApi,
}

impl<'a> GitSync<'a> {
    pub fn new(api: &'a dyn SandboxApi) -> Self {
        Self { api }
    }

    async fn git(&self, sandbox_id: &str, args: &str) -> Result<crate::sandbox::ExecOutput> {
        self.api
            .run_command(sandbox_id, &format!("cd {} && {}", REPO_DIR, args), None)
            .await
    }

    /// Authenticate pushes from inside the sandbox. Prefers a
    /// `GITHUB_TOKEN` from the operator's environment; falls back to
    /// copying a local SSH key (ed25519, then RSA); otherwise warns
    /// and proceeds unauthenticated.
    pub async fn setup_github_auth(&self, sandbox_id: &str) -> Result<()> {
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            hlog_debug!("gitsync: using GITHUB_TOKEN credential store");
            let creds = format!("https://x-access-token:{}@github.com\n", token);
            self.api
                .write_file(sandbox_id, "/root/.git-credentials", creds.as_bytes())
                .await?;
            self.api
                .run_command(
                    sandbox_id,
                    "git config --global credential.helper store",
                    None,
                )
                .await?;
            return Ok(());
        }

        for key_name in ["id_ed25519", "id_rsa"] {
            let local = dirs::home_dir()
                .ok_or(Error::NoHomeDir)?
                .join(".ssh")
                .join(key_name);
            let Ok(key) = std::fs::read(&local) else {
                continue;
            };
            hlog_debug!("gitsync: copying ssh key {}", key_name);
            let remote = format!("/root/.ssh/{}", key_name);
            self.api
                .run_command(sandbox_id, "mkdir -p /root/.ssh", None)
                .await?;
            self.api.write_file(sandbox_id, &remote, &key).await?;
            self.api
                .run_command(
                    sandbox_id,
                    &format!(
                        "chmod 600 {} && printf 'Host github.com\\n  StrictHostKeyChecking no\\n' >> /root/.ssh/config",
                        remote
                    ),
                    None,
                )
                .await?;
            return Ok(());
        }

        hlog_warn!("gitsync: no GITHUB_TOKEN or ssh key found, pushes may fail");
        Ok(())
    }

    /// Current working-tree status, used to short-circuit a sync with
    /// nothing to do.
    pub async fn get_git_status(&self, sandbox_id: &str) -> Result<GitStatus> {
        let out = self
            .git(sandbox_id, "git status --porcelain --branch")
            .await?;
        if !out.success() {
            return Err(Error::Sync(format!("git status failed: {}", out.detail())));
        }
        Ok(parse_porcelain(&out.stdout))
    }

    pub async fn create_branch(&self, sandbox_id: &str, name: &str) -> SyncStep {
        match self.git(sandbox_id, &format!("git checkout -b {}", name)).await {
            Ok(out) if out.success() => SyncStep::ok(),
            Ok(out) => SyncStep::err(format!("branch creation failed: {}", out.detail())),
            Err(e) => SyncStep::err(e.to_string()),
        }
    }

    pub async fn commit_changes(&self, sandbox_id: &str, message: &str) -> SyncStep {
        let cmd = format!(
            "git add -A && git -c user.name=hive -c user.email=hive@localhost commit -m '{}'",
            message.replace('\'', "'\\''")
        );
        match self.git(sandbox_id, &cmd).await {
            Ok(out) if out.success() => SyncStep::ok(),
            Ok(out) => SyncStep::err(format!("commit failed: {}", out.detail())),
            Err(e) => SyncStep::err(e.to_string()),
        }
    }

    pub async fn push_changes(&self, sandbox_id: &str) -> SyncStep {
        match self.git(sandbox_id, "git push -u origin HEAD").await {
            Ok(out) if out.success() => SyncStep::ok(),
            Ok(out) => SyncStep::err(format!("push failed: {}", out.detail())),
            Err(e) => SyncStep::err(e.to_string()),
        }
    }

    pub async fn create_pull_request(
        &self,
        sandbox_id: &str,
        title: &str,
        base: Option<&str>,
    ) -> SyncStep {
        let base_arg = base.map(|b| format!(" --base {}", b)).unwrap_or_default();
        let cmd = format!(
            "gh pr create --title '{}' --body 'Automated change set from a hive swarm instance.'{}",
            title.replace('\'', "'\\''"),
            base_arg
        );
        match self.git(sandbox_id, &cmd).await {
            Ok(out) if out.success() => {
                let url = out
                    .stdout
                    .lines()
                    .rev()
                    .find(|l| l.starts_with("https://"))
                    .map(|l| l.trim().to_string());
                SyncStep {
                    success: true,
                    error: None,
                    pr_url: url,
                }
            }
            Ok(out) => SyncStep::err(format!("pr creation failed: {}", out.detail())),
            Err(e) => SyncStep::err(e.to_string()),
        }
    }

    /// Best-effort mirror of changed remote files into the instance's
    /// local export directory for audit. Failures are logged, not fatal.
    pub async fn download_changed_files(
        &self,
        sandbox_id: &str,
        status: &GitStatus,
        export_dir: &Path,
    ) -> usize {
        let mut downloaded = 0usize;
        for path in status.changed_paths() {
            let remote = format!("{}/{}", REPO_DIR, path);
            match self.api.read_file(sandbox_id, &remote).await {
                Ok(content) => {
                    let local = export_dir.join(path);
                    if let Some(parent) = local.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    match std::fs::write(&local, content) {
                        Ok(()) => downloaded += 1,
                        Err(e) => hlog_warn!("sync: could not mirror {}: {}", path, e),
                    }
                }
                Err(e) => hlog_warn!("sync: could not read {}: {}", remote, e),
            }
        }
        downloaded
    }

    /// Drive the full sync sub-chain for one instance.
    ///
    /// Repo-sourced instances only. A clean working tree short-circuits
    /// without touching the instance status. The first failing step
    /// fails the instance; full success resolves back to `Completed`.
    pub async fn sync_instance(
        &self,
        instance: &mut SwarmInstance,
        opts: SyncOptions,
    ) -> Result<()> {
        if instance.source_type != SourceType::Repo {
            return Err(Error::Sync(format!(
                "instance {} is not repo-sourced",
                instance.short_id()
            )));
        }
        if instance.sandbox_id.is_empty() {
            return Err(Error::Sync(format!(
                "instance {} was never provisioned",
                instance.short_id()
            )));
        }

        let sandbox_id = instance.sandbox_id.clone();
        self.setup_github_auth(&sandbox_id).await?;

        let status = self.get_git_status(&sandbox_id).await?;
        if status.is_clean() {
            hlog!("sync: instance {} has no changes", instance.short_id());
            return Ok(());
        }
        if !opts.commit && !opts.push && !opts.create_pr {
            hlog!(
                "sync: instance {} has changes but no sync steps requested",
                instance.short_id()
            );
            return Ok(());
        }

        let mirrored = self
            .download_changed_files(&sandbox_id, &status, &instance.export_dir)
            .await;
        hlog_debug!(
            "sync: mirrored {} changed files for {}",
            mirrored,
            instance.short_id()
        );

        if let Some(branch) = instance.new_branch.clone() {
            let step = self.create_branch(&sandbox_id, &branch).await;
            if !step.success {
                // Branch creation runs before the first sub-chain
                // transition, so the instance is typically still
                // Completed here and `fail()` would ignore it. Record
                // the failure directly.
                instance.status = InstanceStatus::Failed;
                instance.error =
                    Some(step.error.unwrap_or_else(|| "branch creation failed".into()));
                instance.completed_at = Some(Utc::now());
                return Ok(());
            }
        }

        if opts.commit {
            instance.transition(InstanceStatus::Committing)?;
            let message = instance
                .git
                .pr_title
                .clone()
                .unwrap_or_else(|| format!("hive: changes from instance {}", instance.short_id()));
            let step = self.commit_changes(&sandbox_id, &message).await;
            if !step.success {
                instance.fail(step.error.unwrap_or_else(|| "commit failed".into()));
                return Ok(());
            }
            instance.committed = true;
        }

        if opts.push {
            instance.transition(InstanceStatus::Pushing)?;
            let step = self.push_changes(&sandbox_id).await;
            if !step.success {
                instance.fail(step.error.unwrap_or_else(|| "push failed".into()));
                return Ok(());
            }
            instance.pushed = true;
        }

        if opts.create_pr {
            instance.transition(InstanceStatus::CreatingPr)?;
            let title = instance
                .git
                .pr_title
                .clone()
                .unwrap_or_else(|| format!("hive swarm changes ({})", instance.short_id()));
            let step = self
                .create_pull_request(&sandbox_id, &title, instance.git.pr_base.as_deref())
                .await;
            if !step.success {
                instance.fail(step.error.unwrap_or_else(|| "pr creation failed".into()));
                return Ok(());
            }
            instance.pr_url = step.pr_url;
        }

        if instance.status != InstanceStatus::Completed {
            instance.transition(InstanceStatus::Completed)?;
        }
        hlog!("sync: instance {} synced", instance.short_id());
        Ok(())
    }
}
