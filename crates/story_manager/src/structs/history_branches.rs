use uuid::Uuid;

use crate::error::{Result, StoryError};
use crate::notify::ActivePageChanged;
use crate::structs::branch::Branch;
use crate::structs::history::History;
use crate::structs::page::{Page, Role};
use crate::structs::turn::{Turn, TurnRole};

impl History {
    /// Append a user turn to the active branch. Returns the new page id.
    pub fn add_user_turn(&mut self, text: &str) -> Result<String> {
        let branch_id = self.active_branch_id.clone();
        let branch = self.active_branch_mut()?;
        let turn_index = branch.next_turn_index();
        let page = Page::new(Role::User, text, branch.tail_page_id());
        let page_id = page.id.clone();
        branch.turns.insert(turn_index, Turn::user(page));

        tracing::info!(
            branch = %branch_id,
            turn_index = turn_index,
            content_len = text.len(),
            "History: Added user turn"
        );

        self.rebuild_index();
        Ok(page_id)
    }

    /// Add an empty assistant turn at index 0. Returns false, leaving the
    /// branch untouched, when the branch already has turns.
    pub fn start_genesis_turn(&mut self) -> Result<bool> {
        let branch_id = self.active_branch_id.clone();
        let branch = self.active_branch_mut()?;
        if !branch.is_empty() {
            tracing::warn!(
                branch = %branch_id,
                turn_count = branch.len(),
                "History: Genesis turn requested on a non-empty branch, ignoring"
            );
            return Ok(false);
        }
        branch.turns.insert(0, Turn::assistant());
        Ok(true)
    }

    /// Append a swipe to the current assistant turn, opening a new assistant
    /// turn when the branch is empty or ends with a user turn.
    pub fn add_assistant_page(&mut self, text: &str) -> Result<String> {
        let branch_id = self.active_branch_id.clone();
        let branch = self.active_branch_mut()?;

        let needs_new_turn = !matches!(
            branch.last_turn(),
            Some(turn) if turn.role == TurnRole::Assistant
        );
        if needs_new_turn {
            let index = branch.next_turn_index();
            branch.turns.insert(index, Turn::assistant());
        }

        let turn_index = branch.next_turn_index() - 1;
        let parent_id = turn_index
            .checked_sub(1)
            .and_then(|prev| branch.turns.get(&prev))
            .and_then(|turn| turn.active_page())
            .map(|page| page.id.clone());

        let page = Page::new(Role::Assistant, text, parent_id);
        let page_id = page.id.clone();
        let turn = branch
            .turns
            .get_mut(&turn_index)
            .ok_or_else(|| StoryError::not_found(format!("turn {}", turn_index)))?;
        let page_index = turn.push_page(page);

        tracing::info!(
            branch = %branch_id,
            turn_index = turn_index,
            page_index = page_index,
            new_turn = needs_new_turn,
            "History: Added assistant page"
        );

        self.rebuild_index();
        Ok(page_id)
    }

    /// Attach a side-channel event to a page. Returns false when the id is unknown.
    pub fn add_plugin_event(&mut self, message_id: &str, event: serde_json::Value) -> bool {
        let coord = match self.metadata_index.get(message_id) {
            Some(coord) => coord.clone(),
            None => {
                tracing::warn!(
                    message_id = %message_id,
                    "History: Plugin event targets an unknown message, dropping"
                );
                return false;
            }
        };

        match self
            .branches
            .get_mut(&coord.branch_id)
            .and_then(|b| b.turns.get_mut(&coord.turn_index))
            .and_then(|t| t.pages.get_mut(&coord.page_index))
        {
            Some(page) => {
                page.local_events.push(event);
                true
            }
            None => {
                tracing::warn!(
                    message_id = %message_id,
                    "History: Index points at a missing page, dropping plugin event"
                );
                false
            }
        }
    }

    /// Select a swipe on the active branch. Returns the change when the
    /// selection actually moved.
    pub fn set_active_page(
        &mut self,
        turn_index: usize,
        page_index: usize,
    ) -> Result<Option<ActivePageChanged>> {
        let branch = self.active_branch_mut()?;
        let turn = branch
            .turns
            .get_mut(&turn_index)
            .ok_or_else(|| StoryError::invalid(format!("turn {} does not exist", turn_index)))?;
        let target_id = turn
            .pages
            .get(&page_index)
            .map(|page| page.id.clone())
            .ok_or_else(|| {
                StoryError::invalid(format!(
                    "page {} does not exist on turn {}",
                    page_index, turn_index
                ))
            })?;

        if turn.role == TurnRole::User {
            tracing::debug!(turn_index = turn_index, "History: Ignoring swipe on a user turn");
            return Ok(None);
        }

        let previous_id = turn.active_page().map(|page| page.id.clone());
        if previous_id.as_deref() == Some(target_id.as_str()) {
            return Ok(None);
        }

        turn.active_page_index = page_index;
        tracing::info!(
            turn_index = turn_index,
            page_index = page_index,
            "History: Active page changed"
        );

        Ok(Some(ActivePageChanged {
            new_message_id: target_id,
            previous_message_id: previous_id,
        }))
    }

    pub fn update_page_content(&mut self, message_id: &str, text: &str) -> Result<()> {
        let coord = self.resolve(message_id)?.clone();
        let page = self
            .branches
            .get_mut(&coord.branch_id)
            .and_then(|b| b.turns.get_mut(&coord.turn_index))
            .and_then(|t| t.pages.get_mut(&coord.page_index))
            .ok_or_else(|| StoryError::not_found(format!("message '{}'", message_id)))?;
        page.content = text.to_string();
        Ok(())
    }

    /// Copy turns `0..=from_turn_index` of the active branch into a new branch
    /// and make it active.
    pub fn create_branch(&mut self, from_turn_index: usize) -> Result<String> {
        let source_id = self.active_branch_id.clone();
        let source = self.active_branch()?;
        if from_turn_index >= source.len() {
            return Err(StoryError::invalid(format!(
                "cannot branch from turn {} of a {}-turn branch",
                from_turn_index,
                source.len()
            )));
        }

        let mut branch = Branch::new();
        branch.turns = source
            .turns
            .range(..=from_turn_index)
            .map(|(index, turn)| (*index, turn.clone()))
            .collect();
        branch.forked_from = Some((source_id.clone(), from_turn_index));

        let branch_id = format!("branch-{}", Uuid::new_v4());
        self.branches.insert(branch_id.clone(), branch);
        self.active_branch_id = branch_id.clone();
        self.rebuild_index();

        tracing::info!(
            source = %source_id,
            branch = %branch_id,
            from_turn_index = from_turn_index,
            "History: Branch created"
        );
        Ok(branch_id)
    }

    pub fn switch_branch(&mut self, branch_id: &str) -> Result<()> {
        if !self.branches.contains_key(branch_id) {
            return Err(StoryError::not_found(format!("branch '{}'", branch_id)));
        }
        self.active_branch_id = branch_id.to_string();
        self.rebuild_index();
        Ok(())
    }

    /// Remove a turn from the active branch, shifting later turns down by one.
    pub fn delete_turn(&mut self, turn_index: usize) -> Result<Turn> {
        let branch = self.active_branch_mut()?;
        if !branch.turns.contains_key(&turn_index) {
            return Err(StoryError::not_found(format!("turn {}", turn_index)));
        }

        let last = branch.next_turn_index() - 1;
        let removed = branch
            .turns
            .remove(&turn_index)
            .ok_or_else(|| StoryError::not_found(format!("turn {}", turn_index)))?;
        for index in turn_index..last {
            if let Some(turn) = branch.turns.remove(&(index + 1)) {
                branch.turns.insert(index, turn);
            }
        }

        tracing::info!(
            turn_index = turn_index,
            remaining = branch.len(),
            "History: Turn deleted"
        );

        self.rebuild_index();
        Ok(removed)
    }

    pub fn rename_branch(&mut self, old_id: &str, new_id: &str) -> Result<()> {
        if self.branches.contains_key(new_id) {
            return Err(StoryError::invalid(format!("branch '{}' already exists", new_id)));
        }
        let branch = self
            .branches
            .remove(old_id)
            .ok_or_else(|| StoryError::not_found(format!("branch '{}'", old_id)))?;
        self.branches.insert(new_id.to_string(), branch);
        if self.active_branch_id == old_id {
            self.active_branch_id = new_id.to_string();
        }
        self.rebuild_index();
        Ok(())
    }

    pub fn delete_branch(&mut self, branch_id: &str) -> Result<()> {
        if !self.branches.contains_key(branch_id) {
            return Err(StoryError::not_found(format!("branch '{}'", branch_id)));
        }
        if self.branches.len() == 1 {
            return Err(StoryError::invalid("cannot delete the only branch"));
        }
        self.branches.remove(branch_id);
        if self.active_branch_id == branch_id {
            if let Some(first) = self.branches.keys().next() {
                self.active_branch_id = first.clone();
            }
        }
        self.rebuild_index();
        Ok(())
    }

    pub fn list_branches(&self) -> Vec<String> {
        self.branches.keys().cloned().collect()
    }
}
