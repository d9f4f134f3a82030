use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoryError};
use crate::structs::branch::Branch;
use crate::structs::page::Page;

/// Version marker written with every history. Data without it is v1.
pub const HISTORY_VERSION: u32 = 2;

pub const DEFAULT_BRANCH_ID: &str = "main";

/// Where a page lives in the tree.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageCoordinate {
    pub branch_id: String,
    pub turn_index: usize,
    pub page_index: usize,
}

/// The whole branching history of one conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct History {
    pub version: u32,
    pub branches: BTreeMap<String, Branch>,
    pub active_branch_id: String,

    /// Page id -> coordinate. Derived from `branches` and `active_branch_id`;
    /// rebuilt on every load and after every structural change.
    #[serde(default)]
    pub metadata_index: HashMap<String, MessageCoordinate>,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    pub fn new() -> Self {
        let mut branches = BTreeMap::new();
        branches.insert(DEFAULT_BRANCH_ID.to_string(), Branch::new());
        Self {
            version: HISTORY_VERSION,
            branches,
            active_branch_id: DEFAULT_BRANCH_ID.to_string(),
            metadata_index: HashMap::new(),
        }
    }

    /// Compute the page index from the tree and the active branch id.
    ///
    /// Branches created by copying keep the page ids of their source, so a
    /// shared id has one coordinate per branch holding it. The index is a pure
    /// function of `(branches, active_branch_id)`: a shared id resolves to the
    /// active branch when that branch holds it, otherwise to the first branch
    /// in id order that does. Ids held by a single branch do not depend on the
    /// active branch at all.
    pub fn build_index(&self) -> HashMap<String, MessageCoordinate> {
        let mut index = HashMap::new();

        let ordered = self
            .branches
            .iter()
            .filter(|(id, _)| **id == self.active_branch_id)
            .chain(
                self.branches
                    .iter()
                    .filter(|(id, _)| **id != self.active_branch_id),
            );

        for (branch_id, branch) in ordered {
            for (turn_index, turn) in &branch.turns {
                for (page_index, page) in &turn.pages {
                    index.entry(page.id.clone()).or_insert_with(|| MessageCoordinate {
                        branch_id: branch_id.clone(),
                        turn_index: *turn_index,
                        page_index: *page_index,
                    });
                }
            }
        }

        index
    }

    pub fn rebuild_index(&mut self) {
        self.metadata_index = self.build_index();
        tracing::debug!(
            branch_count = self.branches.len(),
            indexed_pages = self.metadata_index.len(),
            "History: Metadata index rebuilt"
        );
    }

    pub fn resolve(&self, message_id: &str) -> Result<&MessageCoordinate> {
        self.metadata_index
            .get(message_id)
            .ok_or_else(|| StoryError::not_found(format!("message '{}'", message_id)))
    }

    pub fn active_branch(&self) -> Result<&Branch> {
        self.branches
            .get(&self.active_branch_id)
            .ok_or_else(|| StoryError::not_found(format!("branch '{}'", self.active_branch_id)))
    }

    pub fn active_branch_mut(&mut self) -> Result<&mut Branch> {
        let id = self.active_branch_id.clone();
        self.branches
            .get_mut(&id)
            .ok_or_else(|| StoryError::not_found(format!("branch '{}'", id)))
    }

    pub fn get_message(&self, message_id: &str) -> Result<&Page> {
        let coord = self.resolve(message_id)?;
        self.branches
            .get(&coord.branch_id)
            .and_then(|branch| branch.turns.get(&coord.turn_index))
            .and_then(|turn| turn.pages.get(&coord.page_index))
            .ok_or_else(|| StoryError::not_found(format!("message '{}'", message_id)))
    }

    pub fn get_message_index(&self, message_id: &str) -> Result<usize> {
        Ok(self.resolve(message_id)?.turn_index)
    }

    /// The current timeline: the active page of every turn of the active branch.
    pub fn messages_for_prompt(&self) -> Vec<&Page> {
        match self.branches.get(&self.active_branch_id) {
            Some(branch) => branch.turns.values().filter_map(|t| t.active_page()).collect(),
            None => Vec::new(),
        }
    }

    /// Active page of the turn before the one holding `message_id`.
    pub fn previous_turn_message(&self, message_id: &str) -> Result<Option<&Page>> {
        let coord = self.resolve(message_id)?;
        if coord.turn_index == 0 {
            return Ok(None);
        }
        Ok(self
            .branches
            .get(&coord.branch_id)
            .and_then(|branch| branch.turns.get(&(coord.turn_index - 1)))
            .and_then(|turn| turn.active_page()))
    }

    /// Pages of the target's branch for turns in `(start, target]`.
    ///
    /// Every turn contributes its active page except the target turn, which
    /// contributes the target page itself even when another swipe is selected.
    pub fn active_messages_until(
        &self,
        target_id: &str,
        start_id: Option<&str>,
    ) -> Result<Vec<&Page>> {
        Ok(self
            .timeline_until(target_id, start_id)?
            .into_iter()
            .map(|(_, page)| page)
            .collect())
    }

    /// Same walk as [`History::active_messages_until`], keeping each page's
    /// turn index.
    pub fn timeline_until(
        &self,
        target_id: &str,
        start_id: Option<&str>,
    ) -> Result<Vec<(usize, &Page)>> {
        let target = self.resolve(target_id)?;
        let first_turn = match start_id {
            Some(start_id) => self.resolve(start_id)?.turn_index + 1,
            None => 0,
        };

        let branch = self
            .branches
            .get(&target.branch_id)
            .ok_or_else(|| StoryError::not_found(format!("branch '{}'", target.branch_id)))?;

        let mut pages = Vec::new();
        if first_turn > target.turn_index {
            return Ok(pages);
        }
        for (turn_index, turn) in branch.turns.range(first_turn..=target.turn_index) {
            let page = if *turn_index == target.turn_index {
                turn.pages.get(&target.page_index)
            } else {
                turn.active_page()
            };
            if let Some(page) = page {
                pages.push((*turn_index, page));
            }
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::page::Role;
    use crate::structs::turn::Turn;

    fn two_turn_history() -> History {
        let mut history = History::new();
        let branch = history.active_branch_mut().unwrap();
        branch
            .turns
            .insert(0, Turn::user(Page::new(Role::User, "look", None).with_id("u0")));
        let mut reply = Turn::assistant();
        reply.push_page(Page::new(Role::Assistant, "first", None).with_id("a0"));
        reply.push_page(Page::new(Role::Assistant, "second", None).with_id("a1"));
        branch.turns.insert(1, reply);
        history.rebuild_index();
        history
    }

    #[test]
    fn index_is_pure_function_of_tree() {
        let history = two_turn_history();
        assert_eq!(history.build_index(), history.build_index());
        assert_eq!(history.metadata_index, history.build_index());
        assert_eq!(history.metadata_index.len(), 3);
    }

    #[test]
    fn index_prefers_active_branch_for_shared_ids() {
        let mut history = two_turn_history();
        let copy = history.active_branch().unwrap().clone();
        history.branches.insert("alt".to_string(), copy);
        history.active_branch_id = "alt".to_string();
        history.rebuild_index();

        assert_eq!(history.resolve("a1").unwrap().branch_id, "alt");
    }

    #[test]
    fn switching_branch_only_moves_shared_ids() {
        let mut history = two_turn_history();
        let mut copy = history.active_branch().unwrap().clone();
        copy.turns
            .insert(2, Turn::user(Page::new(Role::User, "onward", None).with_id("u2")));
        history.branches.insert("alt".to_string(), copy);

        let on_main = history.build_index();
        history.active_branch_id = "alt".to_string();
        let on_alt = history.build_index();
        assert_eq!(on_alt, history.build_index());

        assert_eq!(on_main["u2"], on_alt["u2"]);
        assert_eq!(on_main["a0"].branch_id, "main");
        assert_eq!(on_alt["a0"].branch_id, "alt");
        assert_eq!(on_main["a0"].turn_index, on_alt["a0"].turn_index);
        assert_eq!(on_main.len(), on_alt.len());
    }

    #[test]
    fn active_messages_until_uses_target_swipe() {
        let history = two_turn_history();
        let pages = history.active_messages_until("a0", None).unwrap();
        let ids: Vec<_> = pages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["u0", "a0"]);

        let after_user = history.active_messages_until("a1", Some("u0")).unwrap();
        assert_eq!(after_user.len(), 1);
        assert_eq!(after_user[0].id, "a1");
    }

    #[test]
    fn previous_turn_message_is_none_at_first_turn() {
        let history = two_turn_history();
        assert!(history.previous_turn_message("u0").unwrap().is_none());
        assert_eq!(history.previous_turn_message("a0").unwrap().unwrap().id, "u0");
        assert!(matches!(
            history.previous_turn_message("missing"),
            Err(StoryError::NotFound(_))
        ));
    }
}
