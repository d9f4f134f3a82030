//! Per-event-type handlers and the dispatch loop that drives them.
//!
//! The handler set is open: an event whose type has no handler is logged and
//! skipped, so older engines tolerate newer event vocabularies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::event_log::{unwrap_inner, WRAPPER_EVENT_TYPE};
use crate::structs::event::GameEvent;
use crate::structs::story_state::EventLedger;
use crate::structs::world::WorldState;

/// Applies one event type to the world state.
pub trait EventHandler: Send + Sync {
    fn apply(&self, state: &mut WorldState, event: &GameEvent) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&mut WorldState, &GameEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn apply(&self, state: &mut WorldState, event: &GameEvent) -> anyhow::Result<()> {
        self(state, event)
    }
}

pub type SharedHandler = Arc<dyn EventHandler>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    Unhandled,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub applied: usize,
    pub unhandled: usize,
    pub failed: usize,
    /// Inner events expanded from wrapper events.
    pub expanded: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: EventOutcome) {
        match outcome {
            EventOutcome::Applied => self.applied += 1,
            EventOutcome::Unhandled => self.unhandled += 1,
            EventOutcome::Failed => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: DispatchReport) {
        self.applied += other.applied;
        self.unhandled += other.unhandled;
        self.failed += other.failed;
        self.expanded += other.expanded;
    }
}

/// Held for the duration of one watermark pass; releases the lock on drop.
pub struct DispatchGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct WorldReducer {
    handlers: DashMap<String, SharedHandler>,
    dispatching: AtomicBool,
    verbose: bool,
}

impl Default for WorldReducer {
    fn default() -> Self {
        Self::new(false)
    }
}

impl WorldReducer {
    pub fn new(verbose: bool) -> Self {
        Self {
            handlers: DashMap::new(),
            dispatching: AtomicBool::new(false),
            verbose,
        }
    }

    /// Register `handler` for `event_type`, replacing any previous one.
    pub fn register_event_handler<H>(&self, event_type: &str, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.register_shared(event_type, Arc::new(handler));
    }

    pub fn register_shared(&self, event_type: &str, handler: SharedHandler) {
        if self
            .handlers
            .insert(event_type.to_string(), handler)
            .is_some()
        {
            tracing::debug!(event_type = %event_type, "WorldReducer: Handler replaced");
        }
    }

    pub fn unregister_event_handler(&self, event_type: &str) -> bool {
        self.handlers.remove(event_type).is_some()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    /// Apply a single event. Handler errors are logged, never propagated.
    pub fn process_event(&self, state: &mut WorldState, event: &GameEvent) -> EventOutcome {
        let Some(handler) = self
            .handlers
            .get(&event.event_type)
            .map(|entry| Arc::clone(entry.value()))
        else {
            tracing::debug!(
                event_type = %event.event_type,
                event_id = %event.event_id,
                "WorldReducer: No handler registered, skipping"
            );
            return EventOutcome::Unhandled;
        };

        if self.verbose {
            tracing::info!(
                event_type = %event.event_type,
                event_id = %event.event_id,
                payload = %event.payload,
                "WorldReducer: Dispatching event"
            );
        } else {
            tracing::debug!(
                event_type = %event.event_type,
                event_id = %event.event_id,
                "WorldReducer: Dispatching event"
            );
        }

        match handler.apply(state, event) {
            Ok(()) => EventOutcome::Applied,
            Err(e) => {
                tracing::error!(
                    event_type = %event.event_type,
                    event_id = %event.event_id,
                    error = %e,
                    "WorldReducer: Handler failed, continuing with next event"
                );
                EventOutcome::Failed
            }
        }
    }

    /// Record `events` in the state's audit trail and apply them in order.
    /// Wrapper events are replaced by their inner event, which runs next.
    pub fn dispatch_events(&self, state: &mut WorldState, events: &[GameEvent]) -> DispatchReport {
        state.event_history.extend_from_slice(events);

        let mut report = DispatchReport::default();
        let mut queue: VecDeque<GameEvent> = events.iter().cloned().collect();

        while let Some(event) = queue.pop_front() {
            if event.event_type == WRAPPER_EVENT_TYPE {
                match unwrap_inner(&event) {
                    Some(inner) => {
                        report.expanded += 1;
                        queue.push_front(inner);
                    }
                    None => {
                        tracing::warn!(
                            event_id = %event.event_id,
                            "WorldReducer: Wrapper event without a readable inner event"
                        );
                        report.failed += 1;
                    }
                }
                continue;
            }
            report.record(self.process_event(state, &event));
        }

        report
    }

    /// Claim the pass lock. `None` while another pass holds it.
    pub fn try_begin_pass(&self) -> Option<DispatchGuard<'_>> {
        self.dispatching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DispatchGuard {
                flag: &self.dispatching,
            })
    }

    pub fn is_dispatching(&self) -> bool {
        self.dispatching.load(Ordering::Acquire)
    }

    /// Apply the ledger events past the watermark and advance it.
    pub fn dispatch_pending(&self, state: &mut WorldState, ledger: &mut EventLedger) -> DispatchReport {
        let total = ledger.events.len();
        let start = ledger.processed_count.min(total);
        if start == total {
            return DispatchReport::default();
        }
        let report = self.dispatch_events(state, &ledger.events[start..]);
        ledger.processed_count = total;
        report
    }

    /// Incremental pass under the pass lock. `None` when another pass is
    /// running; its watermark will cover whatever is pending here.
    pub fn sync_pending(
        &self,
        state: &mut WorldState,
        ledger: &mut EventLedger,
    ) -> Option<DispatchReport> {
        let _pass = self.try_begin_pass()?;
        let mut report = DispatchReport::default();
        while ledger.processed_count < ledger.events.len() {
            report.merge(self.dispatch_pending(state, ledger));
        }
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counter_reducer() -> WorldReducer {
        let reducer = WorldReducer::new(false);
        reducer.register_event_handler("add", |state: &mut WorldState, event: &GameEvent| {
            let world = state.namespace_mut("world");
            let current = world["count"].as_i64().unwrap_or(0);
            let delta = event.payload["n"].as_i64().unwrap_or(0);
            world["count"] = json!(current + delta);
            Ok(())
        });
        reducer
    }

    fn add(id: &str, n: i64) -> GameEvent {
        GameEvent::new("add", json!({"n": n}), None, id)
    }

    #[test]
    fn unknown_type_is_skipped() {
        let reducer = counter_reducer();
        let mut state = WorldState::default();
        let report = reducer.dispatch_events(
            &mut state,
            &[add("1", 2), GameEvent::new("teleport", json!({}), None, "2")],
        );
        assert_eq!(report.applied, 1);
        assert_eq!(report.unhandled, 1);
        assert_eq!(state.get("world").unwrap()["count"], 2);
        assert_eq!(state.event_history.len(), 2);
    }

    #[test]
    fn failing_handler_does_not_abort_batch() {
        let reducer = counter_reducer();
        reducer.register_event_handler("boom", |_: &mut WorldState, _: &GameEvent| {
            anyhow::bail!("handler exploded")
        });
        let mut state = WorldState::default();
        let report = reducer.dispatch_events(
            &mut state,
            &[add("1", 1), GameEvent::new("boom", json!({}), None, "2"), add("3", 1)],
        );
        assert_eq!(report.failed, 1);
        assert_eq!(state.get("world").unwrap()["count"], 2);
    }

    #[test]
    fn re_registration_replaces_handler() {
        let reducer = counter_reducer();
        reducer.register_event_handler("add", |state: &mut WorldState, _: &GameEvent| {
            state.namespace_mut("world")["count"] = json!(-1);
            Ok(())
        });
        let mut state = WorldState::default();
        reducer.dispatch_events(&mut state, &[add("1", 5)]);
        assert_eq!(state.get("world").unwrap()["count"], -1);
        assert_eq!(reducer.registered_types(), vec!["add".to_string()]);

        assert!(reducer.unregister_event_handler("add"));
        assert!(!reducer.unregister_event_handler("add"));
        assert!(reducer.registered_types().is_empty());
    }

    #[test]
    fn wrapped_event_runs_before_following_events() {
        let reducer = WorldReducer::new(false);
        reducer.register_event_handler("log", |state: &mut WorldState, event: &GameEvent| {
            let world = state.namespace_mut("world");
            if !world["order"].is_array() {
                world["order"] = json!([]);
            }
            if let Some(order) = world["order"].as_array_mut() {
                order.push(event.payload["tag"].clone());
            }
            Ok(())
        });

        let wrapper = GameEvent::new(
            WRAPPER_EVENT_TYPE,
            json!({"event": {"type": "log", "payload": {"tag": "inner"}}}),
            None,
            "w",
        );
        let after = GameEvent::new("log", json!({"tag": "after"}), None, "a");

        let mut state = WorldState::default();
        let report = reducer.dispatch_events(&mut state, &[wrapper, after]);
        assert_eq!(report.expanded, 1);
        assert_eq!(state.get("world").unwrap()["order"], json!(["inner", "after"]));
        assert_eq!(state.event_history.len(), 2);
    }

    #[test]
    fn pass_lock_is_exclusive_and_released_on_drop() {
        let reducer = WorldReducer::default();
        let guard = reducer.try_begin_pass();
        assert!(guard.is_some());
        assert!(reducer.try_begin_pass().is_none());
        drop(guard);
        assert!(!reducer.is_dispatching());
        assert!(reducer.try_begin_pass().is_some());
    }

    #[test]
    fn watermark_prevents_double_processing() {
        let reducer = counter_reducer();
        let mut state = WorldState::default();
        let mut ledger = EventLedger {
            events: vec![add("1", 1), add("2", 1)],
            processed_count: 0,
        };

        reducer.dispatch_pending(&mut state, &mut ledger);
        assert_eq!(ledger.processed_count, 2);

        ledger.events.push(add("3", 10));
        reducer.dispatch_pending(&mut state, &mut ledger);
        reducer.dispatch_pending(&mut state, &mut ledger);

        assert_eq!(state.get("world").unwrap()["count"], 12);
        assert_eq!(ledger.processed_count, 3);
    }

    #[test]
    fn sync_pending_yields_to_running_pass() {
        let reducer = counter_reducer();
        let mut state = WorldState::default();
        let mut ledger = EventLedger {
            events: vec![add("1", 4)],
            processed_count: 0,
        };

        {
            let _running = reducer.try_begin_pass();
            assert!(reducer.sync_pending(&mut state, &mut ledger).is_none());
            assert_eq!(ledger.processed_count, 0);
        }

        let report = reducer.sync_pending(&mut state, &mut ledger).unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(ledger.processed_count, 1);
        assert_eq!(state.get("world").unwrap()["count"], 4);
    }
}
