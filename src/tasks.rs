//! Task data model, loading, and validation.
//!
//! Tasks are the atomic units of work handed to sandboxed agents. A task
//! source resolves to a raw list (inline JSON, file, directory, or named
//! list) which `validate_tasks` normalizes into well-formed records.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::{hlog_debug, Error, Result};

/// Task status in its lifecycle. The agent mutates the per-task file in
/// the sandbox as it works; the orchestrator only reads these back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
        }
    }
}

/// A validated unit of work with optional dependency links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A task record as loaded from a source, before normalization.
/// Everything is optional here; `validate_tasks` fills in the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTask {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub active_form: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub blocks: Option<Vec<String>>,
    #[serde(default)]
    pub blocked_by: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Resolve a task source into a raw task list.
///
/// Four source kinds are tried in order:
/// 1. inline JSON (array or single object),
/// 2. a JSON file path,
/// 3. a directory of `*.json` files (sorted by name),
/// 4. a named task list under `~/.hive/tasks/<name>.json`.
pub fn load_tasks(source: &str) -> Result<Vec<RawTask>> {
    load_tasks_from(source, &Config::tasks_dir()?)
}

/// `load_tasks` with an explicit named-list directory, for tests.
pub fn load_tasks_from(source: &str, tasks_dir: &Path) -> Result<Vec<RawTask>> {
    let trimmed = source.trim();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        hlog_debug!("load_tasks: inline JSON ({} bytes)", trimmed.len());
        let value: Value = serde_json::from_str(trimmed)?;
        return parse_entries(value);
    }

    let path = Path::new(source);
    if path.is_file() {
        hlog_debug!("load_tasks: file {}", path.display());
        let value: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
        return parse_entries(value);
    }

    if path.is_dir() {
        hlog_debug!("load_tasks: directory {}", path.display());
        return load_dir(path);
    }

    // Named task list under the well-known directory.
    let named = tasks_dir.join(format!("{}.json", source));
    if named.is_file() {
        hlog_debug!("load_tasks: named list {}", named.display());
        let value: Value = serde_json::from_str(&fs::read_to_string(&named)?)?;
        return parse_entries(value);
    }

    Err(Error::Source(format!("task source not found: {}", source)))
}

fn load_dir(dir: &Path) -> Result<Vec<RawTask>> {
    let mut files: Vec<_> = fs::read_dir(dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(Error::Source(format!(
            "task directory contains no .json files: {}",
            dir.display()
        )));
    }

    let mut tasks = Vec::new();
    for file in files {
        let value: Value = serde_json::from_str(&fs::read_to_string(&file)?)?;
        tasks.extend(parse_entries(value)?);
    }
    Ok(tasks)
}

/// Parse a JSON value that is either a task object or an array of them.
fn parse_entries(value: Value) -> Result<Vec<RawTask>> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(Error::from))
            .collect(),
        obj @ Value::Object(_) => Ok(vec![serde_json::from_value(obj)?]),
        other => Err(Error::Source(format!(
            "task source must be a JSON object or array, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Normalize raw task records into validated tasks.
///
/// Missing ids default to the stringified 1-based position, status to
/// `pending`, and dependency lists to empty. A record with neither
/// subject nor description is a validation error naming the offender.
pub fn validate_tasks(raw: Vec<RawTask>) -> Result<Vec<Task>> {
    let mut tasks = Vec::with_capacity(raw.len());
    for (index, entry) in raw.into_iter().enumerate() {
        let subject = entry.subject.unwrap_or_default();
        let description = entry.description.unwrap_or_default();
        if subject.trim().is_empty() && description.trim().is_empty() {
            let label = entry
                .id
                .clone()
                .unwrap_or_else(|| format!("index {}", index));
            return Err(Error::Validation(format!(
                "task {} has neither subject nor description",
                label
            )));
        }
        tasks.push(Task {
            id: entry.id.unwrap_or_else(|| (index + 1).to_string()),
            subject,
            description,
            active_form: entry.active_form,
            status: entry.status.unwrap_or_default(),
            blocks: entry.blocks.unwrap_or_default(),
            blocked_by: entry.blocked_by.unwrap_or_default(),
            metadata: entry.metadata,
        });
    }
    Ok(tasks)
}
