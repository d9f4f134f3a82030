use serde::Serialize;

use crate::structs::story_state::{BranchSnapshot, SnapshotBucket};

/// Where a replay started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayStart {
    Genesis,
    Snapshot { message_id: String, turn_index: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct SnapshotCandidate<'a> {
    pub message_id: &'a str,
    pub snapshot: &'a BranchSnapshot,
}

/// The latest exact snapshot usable as a replay start for a target at
/// `target_turn`.
///
/// `path` is the target's timeline as `(turn_index, message_id)`; a snapshot
/// taken on a swipe that is no longer on that timeline does not qualify.
pub fn select_snapshot<'a>(
    bucket: Option<&'a SnapshotBucket>,
    path: &[(usize, String)],
    target_turn: usize,
    schema_version: u32,
) -> Option<SnapshotCandidate<'a>> {
    bucket?
        .iter()
        .filter(|(_, snapshot)| {
            !snapshot.approximate
                && snapshot.schema_version == schema_version
                && snapshot.turn_index <= target_turn
        })
        .filter(|(message_id, snapshot)| {
            path.iter()
                .any(|(turn, id)| id == *message_id && *turn == snapshot.turn_index)
        })
        .max_by_key(|(_, snapshot)| snapshot.turn_index)
        .map(|(message_id, snapshot)| SnapshotCandidate {
            message_id: message_id.as_str(),
            snapshot,
        })
}

/// Messages of `path` sitting on a positive multiple of `interval` before
/// `target_turn`.
pub fn backfill_checkpoints(
    path: &[(usize, String)],
    target_turn: usize,
    interval: usize,
) -> Vec<(usize, String)> {
    if interval == 0 {
        return Vec::new();
    }
    path.iter()
        .filter(|(turn, _)| *turn > 0 && *turn < target_turn && turn % interval == 0)
        .cloned()
        .collect()
}
