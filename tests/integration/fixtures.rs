//! Test fixtures for integration tests.
//!
//! Provides an in-memory `SandboxApi` fake with scripted command
//! results, plus builders for configs, tasks, and spawn options.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use hive::config::Config;
use hive::instance::GitOptions;
use hive::sandbox::{ExecOutput, SandboxApi};
use hive::swarm::SpawnOptions;
use hive::tasks::{Task, TaskStatus};
use hive::{Error, Result, SourceType};

pub fn exec_ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

pub fn exec_fail(exit_code: i32, stderr: &str) -> ExecOutput {
    ExecOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code,
    }
}

/// In-memory sandbox service.
///
/// Files are held per sandbox. Commands are matched against scripted
/// (substring, output) pairs in registration order; unmatched commands
/// succeed with empty output. Every executed command is recorded for
/// assertions.
#[derive(Default)]
pub struct FakeSandbox {
    next_id: AtomicUsize,
    pub fail_connect: AtomicBool,
    files: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
    scripts: Mutex<Vec<(String, ExecOutput)>>,
    pub commands: Mutex<Vec<String>>,
    pub killed: Mutex<Vec<String>>,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the result for any command containing `pattern`.
    pub fn script(&self, pattern: &str, output: ExecOutput) {
        self.scripts
            .lock()
            .unwrap()
            .push((pattern.to_string(), output));
    }

    /// Pre-place a file inside a sandbox (e.g. agent output).
    pub fn seed_file(&self, sandbox_id: &str, path: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .entry(sandbox_id.to_string())
            .or_default()
            .insert(path.to_string(), content.as_bytes().to_vec());
    }

    /// Read back a file written into a sandbox, if any.
    pub fn file(&self, sandbox_id: &str, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(sandbox_id)
            .and_then(|m| m.get(path).cloned())
    }

    pub fn file_count(&self, sandbox_id: &str) -> usize {
        self.files
            .lock()
            .unwrap()
            .get(sandbox_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Whether any executed command contained `pattern`.
    pub fn ran(&self, pattern: &str) -> bool {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.contains(pattern))
    }
}

#[async_trait]
impl SandboxApi for FakeSandbox {
    async fn create(&self, _template: &str, _timeout: Duration) -> Result<String> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("sbx-{}", n);
        self.files
            .lock()
            .unwrap()
            .insert(id.clone(), HashMap::new());
        Ok(id)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Sandbox("connection refused".into()));
        }
        if self.files.lock().unwrap().contains_key(sandbox_id) {
            Ok(())
        } else {
            Err(Error::Sandbox(format!("unknown sandbox {}", sandbox_id)))
        }
    }

    async fn run_command(
        &self,
        _sandbox_id: &str,
        cmd: &str,
        _timeout: Option<Duration>,
    ) -> Result<ExecOutput> {
        self.commands.lock().unwrap().push(cmd.to_string());
        let scripts = self.scripts.lock().unwrap();
        for (pattern, output) in scripts.iter() {
            if cmd.contains(pattern.as_str()) {
                return Ok(output.clone());
            }
        }
        Ok(exec_ok(""))
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, contents: &[u8]) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .entry(sandbox_id.to_string())
            .or_default()
            .insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String> {
        let files = self.files.lock().unwrap();
        let content = files
            .get(sandbox_id)
            .and_then(|m| m.get(path))
            .ok_or_else(|| Error::Sandbox(format!("no such file: {}", path)))?;
        String::from_utf8(content.clone())
            .map_err(|e| Error::Sandbox(format!("not utf-8: {}", e)))
    }

    async fn kill(&self, sandbox_id: &str) -> Result<()> {
        self.killed.lock().unwrap().push(sandbox_id.to_string());
        self.files.lock().unwrap().remove(sandbox_id);
        Ok(())
    }
}

pub fn test_config() -> Config {
    Config {
        api_key: Some("sk-test".to_string()),
        timeout_secs: 60,
        ..Default::default()
    }
}

pub fn task(id: &str, subject: &str) -> Task {
    Task {
        id: id.to_string(),
        subject: subject.to_string(),
        description: String::new(),
        active_form: None,
        status: TaskStatus::Pending,
        blocks: vec![],
        blocked_by: vec![],
        metadata: None,
    }
}

pub fn repo_spawn_options(buckets: Vec<Vec<Task>>) -> SpawnOptions {
    SpawnOptions {
        source: "https://github.com/acme/widget.git".to_string(),
        source_type: SourceType::Repo,
        branch: None,
        new_branch: None,
        buckets,
        exclude: vec![],
        include: vec![],
        git: GitOptions::default(),
    }
}

pub fn local_spawn_options(source: &Path, buckets: Vec<Vec<Task>>) -> SpawnOptions {
    SpawnOptions {
        source: source.display().to_string(),
        source_type: SourceType::Local,
        branch: None,
        new_branch: None,
        buckets,
        exclude: vec![],
        include: vec![],
        git: GitOptions::default(),
    }
}
