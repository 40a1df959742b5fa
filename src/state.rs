//! Durable swarm state: every instance ever spawned.
//!
//! The store is a best-effort cache, not a durability guarantee: a
//! missing or corrupt file yields a fresh empty state. Saves are
//! guarded by an optimistic version counter so concurrent CLI
//! invocations fail loudly instead of silently losing updates.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::instance::SwarmInstance;
use crate::{hlog_debug, hlog_warn, Error, Result};

/// The single persisted document. Append-only in normal operation;
/// only the retention cleanup pass removes instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmState {
    /// Optimistic concurrency counter, bumped on every save.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub instances: Vec<SwarmInstance>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SwarmState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: 0,
            instances: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Indices of instances matching an optional filter. A filter
    /// matches an instance id prefix or a status name; no filter
    /// matches everything. Order follows the stored order.
    pub fn matching_indices(&self, filter: Option<&str>) -> Vec<usize> {
        self.instances
            .iter()
            .enumerate()
            .filter(|(_, inst)| match filter {
                None => true,
                Some(f) => {
                    inst.id.to_string().starts_with(f) || inst.status.to_string() == f
                }
            })
            .map(|(i, _)| i)
            .collect()
    }
}

impl Default for SwarmState {
    fn default() -> Self {
        Self::new()
    }
}

/// File-backed state repository with an explicit load/save contract.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the fixed well-known path (`~/.hive/state.json`).
    pub fn at_default_path() -> Result<Self> {
        Ok(Self::new(Config::state_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state. Missing or corrupt files yield a fresh
    /// empty state rather than an error.
    pub fn load(&self) -> SwarmState {
        match self.read_disk() {
            Some(state) => state,
            None => SwarmState::new(),
        }
    }

    /// Persist the state, refreshing `updated_at` and bumping `version`.
    ///
    /// Compare-and-swap: if the on-disk version no longer matches the
    /// version this state was loaded with, another invocation saved in
    /// between and `Error::StateConflict` is returned. The caller should
    /// reload, reapply, and retry.
    pub fn save(&self, state: &mut SwarmState) -> Result<()> {
        if let Some(on_disk) = self.read_disk() {
            if on_disk.version != state.version {
                hlog_warn!(
                    "StateStore::save conflict: disk={} loaded={}",
                    on_disk.version,
                    state.version
                );
                return Err(Error::StateConflict {
                    loaded: state.version,
                    on_disk: on_disk.version,
                });
            }
        }

        state.version += 1;
        state.updated_at = Utc::now();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
        fs::rename(&tmp, &self.path)?;
        hlog_debug!(
            "StateStore::save path={} version={} instances={}",
            self.path.display(),
            state.version,
            state.instances.len()
        );
        Ok(())
    }

    fn read_disk(&self) -> Option<SwarmState> {
        let text = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&text) {
            Ok(state) => Some(state),
            Err(e) => {
                hlog_warn!(
                    "StateStore: corrupt state file {} ({}), starting fresh",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }
}
