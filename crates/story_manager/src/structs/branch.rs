use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::structs::turn::Turn;

/// An independent line of the story. Turn indices are contiguous from 0.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Branch {
    pub turns: BTreeMap<usize, Turn>,
    pub created_at: DateTime<Utc>,

    /// Branch and turn this one was copied from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<(String, usize)>,
}

impl Branch {
    pub fn new() -> Self {
        Self {
            turns: BTreeMap::new(),
            created_at: Utc::now(),
            forked_from: None,
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn next_turn_index(&self) -> usize {
        self.turns.keys().next_back().map(|last| last + 1).unwrap_or(0)
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.turns.values().next_back()
    }

    /// Id of the active page of the last turn, used as the parent of new pages.
    pub fn tail_page_id(&self) -> Option<String> {
        self.turns
            .values()
            .rev()
            .find_map(|turn| turn.active_page())
            .map(|page| page.id.clone())
    }
}

impl Default for Branch {
    fn default() -> Self {
        Self::new()
    }
}
