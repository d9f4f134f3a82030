use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::extraction::EventExtractor;
use crate::error::Result;
use crate::history_store::HistoryStore;
use crate::storage::{load_typed, save_typed, Scope, StateStore};
use crate::structs::event::GameEvent;
use crate::structs::story_state::StoryState;

/// Append-only, id de-duplicated stream of game events.
///
/// The persisted ledger is the source of truth; the in-memory copy is a cache
/// refreshed after every write.
pub struct EventLog {
    store: Arc<dyn StateStore>,
    history: Arc<HistoryStore>,
    extractor: EventExtractor,
    cache: RwLock<Vec<GameEvent>>,
    variables_lock: Arc<Mutex<()>>,
}

impl EventLog {
    pub fn new(history: Arc<HistoryStore>, extractor: EventExtractor) -> Self {
        Self {
            store: history.state_store(),
            variables_lock: history.variables_lock(),
            history,
            extractor,
            cache: RwLock::new(Vec::new()),
        }
    }

    pub fn extractor(&self) -> &EventExtractor {
        &self.extractor
    }

    async fn load_state(&self) -> Result<StoryState> {
        Ok(load_typed::<StoryState>(self.store.as_ref(), &Scope::Variables)
            .await?
            .unwrap_or_default())
    }

    /// Cached events, in log order.
    pub async fn events(&self) -> Vec<GameEvent> {
        self.cache.read().await.clone()
    }

    /// Refresh the cache from the store.
    pub async fn reload(&self) -> Result<Vec<GameEvent>> {
        let events = self.load_state().await?.ledger.events;
        *self.cache.write().await = events.clone();
        Ok(events)
    }

    /// Append the events whose ids are not in the persisted log yet.
    /// Returns how many were appended.
    pub async fn add_events(&self, new_events: Vec<GameEvent>) -> Result<usize> {
        let _lock = self.variables_lock.lock().await;
        let mut state = self.load_state().await?;

        let mut known: HashSet<String> = state
            .ledger
            .events
            .iter()
            .map(|e| e.event_id.clone())
            .collect();
        let offered = new_events.len();
        let mut added = 0usize;
        for event in new_events {
            if known.insert(event.event_id.clone()) {
                state.ledger.events.push(event);
                added += 1;
            }
        }

        if added > 0 {
            save_typed(self.store.as_ref(), &Scope::Variables, &state).await?;
        }
        *self.cache.write().await = state.ledger.events;

        tracing::debug!(
            offered = offered,
            added = added,
            "EventLog: Events appended"
        );
        Ok(added)
    }

    /// Replace the whole log with events that are already reflected in the
    /// world state, as after a recalculation.
    pub async fn set_events(&self, events: Vec<GameEvent>) -> Result<()> {
        let _lock = self.variables_lock.lock().await;
        let mut state = self.load_state().await?;
        state.ledger.processed_count = events.len();
        state.ledger.events = events;
        save_typed(self.store.as_ref(), &Scope::Variables, &state).await?;

        tracing::info!(
            event_count = state.ledger.events.len(),
            "EventLog: Log replaced"
        );
        *self.cache.write().await = state.ledger.events;
        Ok(())
    }

    /// Events of the target's timeline for turns in `(start, target]`, in
    /// page order.
    pub async fn get_events_until(
        &self,
        target_id: &str,
        start_id: Option<&str>,
    ) -> Result<Vec<GameEvent>> {
        let pages = self
            .history
            .get_active_messages_until(target_id, start_id)
            .await?;
        let events: Vec<GameEvent> = pages
            .iter()
            .flat_map(|page| self.extractor.extract(page))
            .collect();

        tracing::debug!(
            target_id = %target_id,
            start_id = ?start_id,
            page_count = pages.len(),
            event_count = events.len(),
            "EventLog: Collected events for replay"
        );
        Ok(events)
    }

    /// Scan a finished page and append its events. Returns how many were new.
    pub async fn ingest_message(&self, message_id: &str) -> Result<usize> {
        let page = self.history.get_message(message_id).await?;
        let events = self.extractor.extract(&page);
        if events.is_empty() {
            return Ok(0);
        }
        self.add_events(events).await
    }
}
