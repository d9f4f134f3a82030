use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::structs::page::Page;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One step of the conversation.
///
/// A user turn holds a single page at index 0 and its active index never
/// moves. An assistant turn only ever gains pages, and the active index
/// points at the newest page right after one is added.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Turn {
    pub role: TurnRole,
    pub pages: BTreeMap<usize, Page>,
    pub active_page_index: usize,
}

impl Turn {
    pub fn user(page: Page) -> Self {
        let mut pages = BTreeMap::new();
        pages.insert(0, page);
        Self {
            role: TurnRole::User,
            pages,
            active_page_index: 0,
        }
    }

    /// An assistant turn with no pages yet.
    pub fn assistant() -> Self {
        Self {
            role: TurnRole::Assistant,
            pages: BTreeMap::new(),
            active_page_index: 0,
        }
    }

    pub fn active_page(&self) -> Option<&Page> {
        self.pages.get(&self.active_page_index)
    }

    pub fn next_page_index(&self) -> usize {
        self.pages.keys().next_back().map(|last| last + 1).unwrap_or(0)
    }

    /// Append a swipe and select it. Returns the new page index.
    pub fn push_page(&mut self, page: Page) -> usize {
        let index = self.next_page_index();
        self.pages.insert(index, page);
        self.active_page_index = index;
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::page::Role;

    #[test]
    fn push_page_selects_newest_swipe() {
        let mut turn = Turn::assistant();
        assert!(turn.active_page().is_none());

        assert_eq!(turn.push_page(Page::new(Role::Assistant, "a", None)), 0);
        assert_eq!(turn.push_page(Page::new(Role::Assistant, "b", None)), 1);
        assert_eq!(turn.active_page_index, 1);
        assert_eq!(turn.active_page().unwrap().content, "b");
    }

    #[test]
    fn turn_serializes_page_indices_as_map_keys() {
        let turn = Turn::user(Page::new(Role::User, "hi", None).with_id("u1"));
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["pages"]["0"]["id"], "u1");

        let back: Turn = serde_json::from_value(json).unwrap();
        assert_eq!(back, turn);
    }
}
