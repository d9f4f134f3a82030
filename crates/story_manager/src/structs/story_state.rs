use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::structs::event::GameEvent;
use crate::structs::world::WorldState;

/// Namespaces that belong to the engine's own bookkeeping and never go into
/// a branch snapshot.
pub const RESERVED_NAMESPACES: [&str; 4] = ["ledger", "genesis", "genesis_backup", "branch_snapshots"];

/// A cached, fully replayed world state at one message of one branch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BranchSnapshot {
    pub world_state: WorldState,
    pub schema_version: u32,
    pub turn_index: usize,

    /// Set on backfilled snapshots: the state is the latest known one, not the
    /// true state at this message.
    #[serde(default)]
    pub approximate: bool,

    pub created_at: DateTime<Utc>,
}

/// Message id -> snapshot, for one branch.
pub type SnapshotBucket = BTreeMap<String, BranchSnapshot>;

/// The persisted event log and the incremental dispatch watermark.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct EventLedger {
    #[serde(default)]
    pub events: Vec<GameEvent>,

    /// Number of leading `events` already applied to the live world state.
    #[serde(default)]
    pub processed_count: usize,
}

/// Everything stored at conversation scope besides the history tree.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct StoryState {
    #[serde(default)]
    pub world_state: WorldState,

    #[serde(default)]
    pub ledger: EventLedger,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis: Option<WorldState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis_backup: Option<WorldState>,

    /// Branch id -> bucket.
    #[serde(default)]
    pub branch_snapshots: BTreeMap<String, SnapshotBucket>,

    /// Last schema version the world state was reconciled against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
}

impl StoryState {
    /// The world state as it may be stored inside a snapshot.
    pub fn snapshot_view(&self) -> WorldState {
        self.world_state.stripped(&RESERVED_NAMESPACES)
    }

    /// Drop snapshots of `branch_id` taken at or after `turn_index`.
    /// Returns the number removed.
    pub fn purge_snapshots_from(&mut self, branch_id: &str, turn_index: usize) -> usize {
        let Some(bucket) = self.branch_snapshots.get_mut(branch_id) else {
            return 0;
        };
        let before = bucket.len();
        bucket.retain(|_, snapshot| snapshot.turn_index < turn_index);
        before - bucket.len()
    }
}

/// Variables stored at per-message scope.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MessageVariables {
    /// World state the story started from, kept on the first message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<WorldState>,
}
