//! Persistent access to the branching history.
//!
//! Every mutation re-reads the whole tree from the store, applies the change
//! and replaces the whole document. Mutations are serialized by a write lock.
//! Writers of the conversation-level story state share a second lock, handed
//! out by [`HistoryStore::variables_lock`].

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::error::Result;
use crate::migration::{is_legacy, migrate_v1_to_v2};
use crate::notify::ActivePageChanged;
use crate::storage::{load_typed, save_typed, Scope, StateStore};
use crate::structs::history::History;
use crate::structs::page::Page;
use crate::structs::story_state::StoryState;

pub struct HistoryStore {
    store: Arc<dyn StateStore>,
    write_lock: Mutex<()>,
    variables_lock: Arc<Mutex<()>>,
    change_tx: Option<mpsc::Sender<ActivePageChanged>>,
}

impl HistoryStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
            variables_lock: Arc::new(Mutex::new(())),
            change_tx: None,
        }
    }

    /// Receive an [`ActivePageChanged`] every time a swipe selection moves.
    pub fn with_change_channel(mut self, tx: mpsc::Sender<ActivePageChanged>) -> Self {
        self.change_tx = Some(tx);
        self
    }

    pub fn state_store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    /// Lock held across every read-modify-replace of [`Scope::Variables`].
    pub fn variables_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.variables_lock)
    }

    /// Read the current history, migrating v1 data on first sight.
    pub async fn load(&self) -> Result<History> {
        let document = match self.store.read(&Scope::History).await? {
            Some(Value::Null) | None => {
                tracing::debug!("HistoryStore: No stored history, starting empty");
                return Ok(History::new());
            }
            Some(document) => document,
        };

        if is_legacy(&document) {
            tracing::info!("HistoryStore: Legacy history detected, migrating");
            let history = migrate_v1_to_v2(&document)?;
            save_typed(self.store.as_ref(), &Scope::History, &history).await?;
            return Ok(history);
        }

        let mut history: History = serde_json::from_value(document)?;
        history.rebuild_index();
        Ok(history)
    }

    async fn mutate<R>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut History) -> Result<R>,
    ) -> Result<R> {
        let _guard = self.write_lock.lock().await;
        let mut history = self.load().await?;
        let result = f(&mut history)?;
        save_typed(self.store.as_ref(), &Scope::History, &history).await?;
        tracing::debug!(operation = operation, "HistoryStore: History persisted");
        Ok(result)
    }

    pub async fn add_user_turn(&self, text: &str) -> Result<String> {
        self.mutate("add_user_turn", |h| h.add_user_turn(text)).await
    }

    pub async fn start_genesis_turn(&self) -> Result<bool> {
        self.mutate("start_genesis_turn", |h| h.start_genesis_turn()).await
    }

    pub async fn add_assistant_message_page(&self, text: &str) -> Result<String> {
        self.mutate("add_assistant_message_page", |h| h.add_assistant_page(text))
            .await
    }

    /// Attach a side-channel event to a page. An unknown id is logged and
    /// reported as `false`, not as an error.
    pub async fn add_plugin_event(&self, message_id: &str, event: Value) -> Result<bool> {
        self.mutate("add_plugin_event", |h| Ok(h.add_plugin_event(message_id, event)))
            .await
    }

    pub async fn set_active_page(
        &self,
        turn_index: usize,
        page_index: usize,
    ) -> Result<Option<ActivePageChanged>> {
        let change = {
            let _guard = self.write_lock.lock().await;
            let mut history = self.load().await?;
            let change = history.set_active_page(turn_index, page_index)?;
            if change.is_some() {
                save_typed(self.store.as_ref(), &Scope::History, &history).await?;
            }
            change
        };

        // Sent with the write lock released; receivers may mutate history.
        if let (Some(change), Some(tx)) = (&change, &self.change_tx) {
            let _ = tx.send(change.clone()).await;
        }
        Ok(change)
    }

    pub async fn update_message_page_content(&self, message_id: &str, text: &str) -> Result<()> {
        self.mutate("update_message_page_content", |h| {
            h.update_page_content(message_id, text)
        })
        .await
    }

    pub async fn create_branch(&self, from_turn_index: usize) -> Result<String> {
        self.mutate("create_branch", |h| h.create_branch(from_turn_index))
            .await
    }

    pub async fn switch_branch(&self, branch_id: &str) -> Result<()> {
        self.mutate("switch_branch", |h| h.switch_branch(branch_id)).await
    }

    /// Remove a turn of the active branch. Snapshots of that branch taken at
    /// or after the turn are purged afterwards on a best-effort basis.
    pub async fn delete_turn(&self, turn_index: usize) -> Result<()> {
        let branch_id = self
            .mutate("delete_turn", |h| {
                h.delete_turn(turn_index)?;
                Ok(h.active_branch_id.clone())
            })
            .await?;

        self.edit_story_state_best_effort("purge_snapshots", |state| {
            let purged = state.purge_snapshots_from(&branch_id, turn_index);
            if purged > 0 {
                tracing::info!(
                    branch = %branch_id,
                    from_turn = turn_index,
                    purged = purged,
                    "HistoryStore: Purged stale snapshots"
                );
            }
            purged > 0
        })
        .await;
        Ok(())
    }

    pub async fn rename_branch(&self, old_id: &str, new_id: &str) -> Result<()> {
        self.mutate("rename_branch", |h| h.rename_branch(old_id, new_id))
            .await?;
        self.edit_story_state_best_effort("rename_snapshot_bucket", |state| {
            match state.branch_snapshots.remove(old_id) {
                Some(bucket) => {
                    state.branch_snapshots.insert(new_id.to_string(), bucket);
                    true
                }
                None => false,
            }
        })
        .await;
        Ok(())
    }

    pub async fn delete_branch(&self, branch_id: &str) -> Result<()> {
        self.mutate("delete_branch", |h| h.delete_branch(branch_id))
            .await?;
        self.edit_story_state_best_effort("drop_snapshot_bucket", |state| {
            state.branch_snapshots.remove(branch_id).is_some()
        })
        .await;
        Ok(())
    }

    /// Replace the stored history with the migration of a v1 array.
    pub async fn import_legacy(&self, legacy: &Value) -> Result<History> {
        let _guard = self.write_lock.lock().await;
        let history = migrate_v1_to_v2(legacy)?;
        save_typed(self.store.as_ref(), &Scope::History, &history).await?;
        Ok(history)
    }

    pub async fn list_branches(&self) -> Result<Vec<String>> {
        Ok(self.load().await?.list_branches())
    }

    pub async fn active_branch_id(&self) -> Result<String> {
        Ok(self.load().await?.active_branch_id)
    }

    pub async fn get_messages_for_prompt(&self) -> Result<Vec<Page>> {
        let history = self.load().await?;
        Ok(history.messages_for_prompt().into_iter().cloned().collect())
    }

    pub async fn get_previous_turn_message(&self, message_id: &str) -> Result<Option<Page>> {
        let history = self.load().await?;
        Ok(history.previous_turn_message(message_id)?.cloned())
    }

    pub async fn get_active_messages_until(
        &self,
        target_id: &str,
        start_id: Option<&str>,
    ) -> Result<Vec<Page>> {
        let history = self.load().await?;
        Ok(history
            .active_messages_until(target_id, start_id)?
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn get_message_index(&self, message_id: &str) -> Result<usize> {
        self.load().await?.get_message_index(message_id)
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Page> {
        Ok(self.load().await?.get_message(message_id)?.clone())
    }

    async fn edit_story_state_best_effort(
        &self,
        operation: &str,
        f: impl FnOnce(&mut StoryState) -> bool,
    ) {
        let outcome: Result<()> = async move {
            let _lock = self.variables_lock.lock().await;
            let Some(mut state) =
                load_typed::<StoryState>(self.store.as_ref(), &Scope::Variables).await?
            else {
                return Ok(());
            };
            if f(&mut state) {
                save_typed(self.store.as_ref(), &Scope::Variables, &state).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = outcome {
            tracing::warn!(
                operation = operation,
                error = %e,
                "HistoryStore: Snapshot bookkeeping failed, continuing"
            );
        }
    }
}
