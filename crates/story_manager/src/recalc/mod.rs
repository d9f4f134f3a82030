//! Rebuilding the world state at a target message by resetting to Genesis
//! and replaying the event range that leads to it.

mod engine;
pub mod integrity;
pub mod snapshots;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::reducer::DispatchReport;

pub use engine::StoryEngine;
pub use snapshots::{backfill_checkpoints, select_snapshot, ReplayStart, SnapshotCandidate};

/// Result of one `recalculate` call. Errors never escape as `Err`: they are
/// reported to the notifier and surface as `Failed`.
#[derive(Debug, Clone, PartialEq)]
pub enum RecalcOutcome {
    Completed(RecalcReport),
    Failed(String),
    /// Another recalculation was already running.
    Skipped,
}

impl RecalcOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RecalcOutcome::Completed(_))
    }

    pub fn report(&self) -> Option<&RecalcReport> {
        match self {
            RecalcOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecalcReport {
    pub target_message_id: String,
    pub branch_id: String,
    pub turn_index: usize,
    pub start: ReplayStart,
    pub events_replayed: usize,
    pub dispatch: DispatchReport,
    pub genesis_recovered: bool,
    pub schema_reconciled: bool,
    /// Message id of the exact snapshot written for the target, if any.
    pub snapshot_written: Option<String>,
    pub snapshots_backfilled: usize,
}

/// Holds the shared "recalculation in progress" flag; clears it on drop.
pub struct RecalcGuard {
    flag: Arc<AtomicBool>,
}

impl RecalcGuard {
    pub fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for RecalcGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_is_exclusive_and_released() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = RecalcGuard::try_acquire(&flag).unwrap();
        assert!(flag.load(Ordering::Acquire));
        assert!(RecalcGuard::try_acquire(&flag).is_none());
        drop(guard);
        assert!(!flag.load(Ordering::Acquire));
    }
}
