//! Retention cleanup: prune terminal instances past a fixed age.
//!
//! The state document is append-only in normal operation; this is the
//! only path that removes instances.

use chrono::{Duration, Utc};

use crate::hlog;
use crate::state::SwarmState;

/// Terminal instances older than this are pruned by default.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// Summary of a retention pass.
#[derive(Debug, Default)]
pub struct PruneSummary {
    pub removed: usize,
    pub kept: usize,
    pub removed_ids: Vec<String>,
}

impl PruneSummary {
    pub fn is_empty(&self) -> bool {
        self.removed == 0
    }
}

/// Remove terminal instances whose completion time is older than
/// `max_age`. Non-terminal instances and terminal instances without a
/// completion timestamp are always kept.
pub fn prune_state(state: &mut SwarmState, max_age: Duration) -> PruneSummary {
    let cutoff = Utc::now() - max_age;
    let mut summary = PruneSummary::default();

    state.instances.retain(|inst| {
        let prune = inst.status.is_terminal()
            && inst.completed_at.map(|t| t < cutoff).unwrap_or(false);
        if prune {
            summary.removed += 1;
            summary.removed_ids.push(inst.short_id());
            false
        } else {
            summary.kept += 1;
            true
        }
    });

    hlog!(
        "cleanup: pruned {} instances, kept {}",
        summary.removed,
        summary.kept
    );
    summary
}
