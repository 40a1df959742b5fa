//! Swarm instance data model and lifecycle state machine.
//!
//! An instance is this system's record of one spawned sandbox: its
//! assigned tasks, git options, and current lifecycle status. Instances
//! are created by spawn, mutated by reconciliation/sync/kill, and only
//! removed by the retention cleanup pass.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tasks::Task;
use crate::{Error, Result};

/// Where the instance's workspace content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Shallow-cloned from a git remote.
    Repo,
    /// Uploaded file-by-file from a local directory tree.
    Local,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Repo => write!(f, "repo"),
            SourceType::Local => write!(f, "local"),
        }
    }
}

/// Instance lifecycle status.
///
/// Spawn drives `Starting → {Cloning | Uploading} → SettingUp → Running`.
/// Reconciliation observes `Running → Completed`. The git-sync sub-chain
/// `Committing → Pushing → CreatingPr` re-enters from a completed
/// instance and resolves back to `Completed`, or to `Failed` at the
/// first failing step. `Failed` is reachable from every non-terminal
/// state (and models user kills).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    Starting,
    Cloning,
    Uploading,
    SettingUp,
    Running,
    Committing,
    Pushing,
    CreatingPr,
    Completed,
    Failed,
}

impl InstanceStatus {
    /// Completed and Failed are terminal for reconciliation purposes.
    /// Git sync may still re-enter a Completed instance.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Failed)
    }

    /// Whether a direct transition to `target` is part of the lifecycle.
    pub fn can_transition(&self, target: InstanceStatus) -> bool {
        use InstanceStatus::*;
        if target == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, target),
            (Starting, Cloning)
                | (Starting, Uploading)
                | (Cloning, SettingUp)
                | (Uploading, SettingUp)
                | (SettingUp, Running)
                | (Running, Completed)
                | (Running, Committing)
                | (Completed, Committing)
                | (Completed, Pushing)
                | (Completed, CreatingPr)
                | (Committing, Pushing)
                | (Committing, Completed)
                | (Pushing, CreatingPr)
                | (Pushing, Completed)
                | (CreatingPr, Completed)
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Cloning => "cloning",
            InstanceStatus::Uploading => "uploading",
            InstanceStatus::SettingUp => "setting-up",
            InstanceStatus::Running => "running",
            InstanceStatus::Committing => "committing",
            InstanceStatus::Pushing => "pushing",
            InstanceStatus::CreatingPr => "creating-pr",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Git workflow options recorded on an instance at spawn time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitOptions {
    #[serde(default)]
    pub auto_commit: bool,
    #[serde(default)]
    pub auto_push: bool,
    #[serde(default)]
    pub create_pr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_base: Option<String>,
}

/// One spawned sandbox and everything we know about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmInstance {
    pub id: Uuid,
    /// Empty until remote provisioning succeeds.
    #[serde(default)]
    pub sandbox_id: String,
    pub template: String,
    pub status: InstanceStatus,
    pub source: String,
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_branch: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    pub prompt: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub export_dir: PathBuf,
    pub log_file: PathBuf,
    #[serde(flatten)]
    pub git: GitOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub committed: bool,
    #[serde(default)]
    pub pushed: bool,
}

impl SwarmInstance {
    /// Create a new instance record in `Starting` status.
    ///
    /// `sandbox_id` stays empty until provisioning succeeds; the export
    /// directory and log file paths are derived from the generated id.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        template: &str,
        source: &str,
        source_type: SourceType,
        branch: Option<String>,
        new_branch: Option<String>,
        tasks: Vec<Task>,
        prompt: String,
        export_root: &std::path::Path,
        log_root: &std::path::Path,
        git: GitOptions,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            sandbox_id: String::new(),
            template: template.to_string(),
            status: InstanceStatus::Starting,
            source: source.to_string(),
            source_type,
            branch,
            new_branch,
            tasks,
            prompt,
            started_at: Utc::now(),
            completed_at: None,
            output: None,
            error: None,
            export_dir: export_root.join(id.to_string()),
            log_file: log_root.join(format!("{}.log", id)),
            git,
            pr_url: None,
            committed: false,
            pushed: false,
        }
    }

    /// First 8 characters of the instance id, for display.
    pub fn short_id(&self) -> String {
        self.id.to_string()[..8].to_string()
    }

    /// Move to `target`, enforcing the lifecycle ordering.
    pub fn transition(&mut self, target: InstanceStatus) -> Result<()> {
        if !self.status.can_transition(target) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        Ok(())
    }

    /// Record a failure. Valid from any non-terminal state; failing an
    /// already-terminal instance is ignored.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = InstanceStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    /// Record observed completion with the agent's captured output.
    pub fn complete(&mut self, output: Option<String>) {
        self.status = InstanceStatus::Completed;
        self.completed_at = Some(Utc::now());
        if output.is_some() {
            self.output = output;
        }
    }
}
