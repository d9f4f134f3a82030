use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::integrity::{ensure_genesis, first_message_ids, reconcile_schema};
use super::snapshots::{backfill_checkpoints, select_snapshot, ReplayStart};
use super::{RecalcGuard, RecalcOutcome, RecalcReport};
use crate::config::{EngineConfig, ReplayPolicy};
use crate::error::{Result, StoryError};
use crate::event_log::{EventExtractor, EventLog};
use crate::history_store::HistoryStore;
use crate::notify::{ActivePageChanged, Notifier, NotifyLevel, TracingNotifier};
use crate::reducer::{DispatchReport, EventHandler, WorldReducer};
use crate::storage::{load_typed, save_typed, Scope, StateStore};
use crate::structs::event::GameEvent;
use crate::structs::story_state::{BranchSnapshot, EventLedger, MessageVariables, StoryState};
use crate::structs::world::WorldState;

/// Ties the history, the event log and the reducer together.
pub struct StoryEngine {
    store: Arc<dyn StateStore>,
    history: Arc<HistoryStore>,
    event_log: Arc<EventLog>,
    reducer: Arc<WorldReducer>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    recalculating: Arc<AtomicBool>,
    variables_lock: Arc<Mutex<()>>,
}

impl StoryEngine {
    pub fn new(store: Arc<dyn StateStore>, config: EngineConfig) -> Result<Self> {
        let history = Arc::new(HistoryStore::new(store));
        Self::from_parts(history, config, Arc::new(TracingNotifier))
    }

    /// Build around an existing history store, e.g. one with a change
    /// channel installed.
    pub fn from_parts(
        history: Arc<HistoryStore>,
        config: EngineConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;
        let extractor = EventExtractor::from_config(&config)?;
        let event_log = Arc::new(EventLog::new(Arc::clone(&history), extractor));
        let reducer = Arc::new(WorldReducer::new(config.verbose_dispatch));

        tracing::debug!(
            snapshot_interval = config.snapshot_interval,
            schema_version = config.schema_version,
            replay_policy = ?config.replay_policy,
            "StoryEngine: Initialized"
        );

        Ok(Self {
            store: history.state_store(),
            variables_lock: history.variables_lock(),
            history,
            event_log,
            reducer,
            notifier,
            config,
            recalculating: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.event_log
    }

    pub fn reducer(&self) -> &Arc<WorldReducer> {
        &self.reducer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shared "recalculation in progress" flag.
    pub fn recalculation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.recalculating)
    }

    pub fn is_recalculating(&self) -> bool {
        self.recalculating.load(Ordering::Acquire)
    }

    pub fn register_event_handler<H>(&self, event_type: &str, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.reducer.register_event_handler(event_type, handler);
    }

    async fn load_state(&self) -> Result<StoryState> {
        Ok(load_typed::<StoryState>(self.store.as_ref(), &Scope::Variables)
            .await?
            .unwrap_or_default())
    }

    async fn save_state(&self, state: &StoryState) -> Result<()> {
        save_typed(self.store.as_ref(), &Scope::Variables, state).await
    }

    pub async fn story_state(&self) -> Result<StoryState> {
        self.load_state().await
    }

    pub async fn world_state(&self) -> Result<WorldState> {
        Ok(self.load_state().await?.world_state)
    }

    /// Capture the story's starting world state.
    ///
    /// Writes it as the live state, as Genesis and as the Genesis backup, and
    /// attaches it to the first message so Genesis can be recovered later.
    pub async fn initialize_genesis(&self, initial: WorldState) -> Result<()> {
        let history = self.history.load().await?;
        let branch_id = history.active_branch_id.clone();
        if !history.active_branch()?.turns.contains_key(&0) {
            return Err(StoryError::invalid(
                "Genesis needs the first turn of the active branch to exist",
            ));
        }

        let genesis = initial.stripped(&[]);

        match first_message_ids(&history, &branch_id).into_iter().next() {
            Some(first_id) => {
                let scope = Scope::Message(first_id);
                let mut vars = load_typed::<MessageVariables>(self.store.as_ref(), &scope)
                    .await?
                    .unwrap_or_default();
                vars.initial_state = Some(genesis.clone());
                save_typed(self.store.as_ref(), &scope, &vars).await?;
            }
            None => tracing::warn!(
                branch = %branch_id,
                "StoryEngine: First turn has no page yet, initial state not attached"
            ),
        }

        let _lock = self.variables_lock.lock().await;
        let mut state = self.load_state().await?;
        state.world_state = genesis.clone();
        state.genesis_backup = Some(genesis.clone());
        state.genesis = Some(genesis);
        state.schema_version = Some(self.config.schema_version);
        self.save_state(&state).await?;

        tracing::info!(
            branch = %branch_id,
            namespaces = state.world_state.namespaces.len(),
            "StoryEngine: Genesis initialized"
        );
        Ok(())
    }

    /// Rebuild the world state as of `target_id`.
    ///
    /// Any failure aborts the whole call, is reported to the notifier and
    /// comes back as [`RecalcOutcome::Failed`]. The in-progress flag is
    /// released on every path.
    pub async fn recalculate(&self, target_id: &str) -> RecalcOutcome {
        let Some(_guard) = RecalcGuard::try_acquire(&self.recalculating) else {
            tracing::warn!(
                target_id = %target_id,
                "StoryEngine: Recalculation already running, skipping"
            );
            return RecalcOutcome::Skipped;
        };

        match self.run_recalculation(target_id).await {
            Ok(report) => {
                self.notifier.notify(
                    NotifyLevel::Success,
                    &format!(
                        "World state rebuilt at turn {} ({} events)",
                        report.turn_index, report.events_replayed
                    ),
                );
                RecalcOutcome::Completed(report)
            }
            Err(e) => {
                tracing::error!(
                    target_id = %target_id,
                    error = %e,
                    "StoryEngine: Recalculation failed"
                );
                self.notifier
                    .notify(NotifyLevel::Error, &format!("Recalculation failed: {}", e));
                RecalcOutcome::Failed(e.to_string())
            }
        }
    }

    async fn run_recalculation(&self, target_id: &str) -> Result<RecalcReport> {
        let history = self.history.load().await?;
        let target = history.resolve(target_id)?.clone();
        let branch_id = target.branch_id.clone();
        let turn_index = target.turn_index;
        let replayed = &self.config.replayed_namespaces;

        let mut state = self.load_state().await?;

        // 1. Genesis and backup must both exist.
        let genesis_recovered =
            ensure_genesis(self.store.as_ref(), &history, &branch_id, &mut state).await?;
        let (Some(genesis), Some(backup)) = (state.genesis.clone(), state.genesis_backup.clone())
        else {
            return Err(StoryError::DataIntegrity(
                "Genesis unavailable after recovery".to_string(),
            ));
        };

        // 2. Schema drift.
        let schema_reconciled =
            reconcile_schema(&mut state, &genesis, self.config.schema_version);

        // 3. Inputs.
        let path: Vec<(usize, String)> = history
            .timeline_until(target_id, None)?
            .into_iter()
            .map(|(turn, page)| (turn, page.id.clone()))
            .collect();

        let candidate = select_snapshot(
            state.branch_snapshots.get(&branch_id),
            &path,
            turn_index,
            self.config.schema_version,
        );
        let resume_from = match (candidate, self.config.replay_policy) {
            (Some(candidate), ReplayPolicy::NearestSnapshot) => Some((
                candidate.message_id.to_string(),
                candidate.snapshot.turn_index,
                candidate.snapshot.world_state.subset(replayed),
            )),
            (Some(candidate), ReplayPolicy::AlwaysGenesis) => {
                tracing::info!(
                    snapshot_message_id = %candidate.message_id,
                    snapshot_turn = candidate.snapshot.turn_index,
                    "StoryEngine: Snapshot available, replaying from Genesis by policy"
                );
                None
            }
            (None, _) => None,
        };

        let all_events = self.event_log.get_events_until(target_id, None).await?;
        let (start, mut working, to_replay) = match resume_from {
            Some((message_id, snapshot_turn, world)) => {
                let tail = self
                    .event_log
                    .get_events_until(target_id, Some(&message_id))
                    .await?;
                (
                    ReplayStart::Snapshot {
                        message_id,
                        turn_index: snapshot_turn,
                    },
                    world,
                    tail,
                )
            }
            // 4. Reset.
            None => (ReplayStart::Genesis, genesis.subset(replayed), all_events.clone()),
        };

        // 5. Replay.
        let dispatch = self.reducer.dispatch_events(&mut working, &to_replay);

        // 6-8. Persist onto a fresh read, keeping whatever other writers
        // stored since the inputs were read.
        let interval = self.config.snapshot_interval;
        let event_count = all_events.len();
        let lock = self.variables_lock.lock().await;
        let mut fresh = self.load_state().await?;
        reconcile_schema(&mut fresh, &genesis, self.config.schema_version);

        for namespace in replayed {
            match working.namespaces.remove(namespace) {
                Some(value) => fresh.world_state.insert(namespace.clone(), value),
                None => {
                    fresh.world_state.namespaces.remove(namespace);
                }
            }
        }
        fresh.world_state.event_history = working.event_history;

        // 7. Structures replay never derives.
        fresh.genesis = Some(genesis);
        fresh.genesis_backup = Some(backup);
        let stale = fresh
            .branch_snapshots
            .remove(&branch_id)
            .map(|bucket| bucket.len())
            .unwrap_or(0);

        // 8. The log now holds exactly the replayed timeline.
        fresh.ledger = EventLedger {
            events: all_events,
            processed_count: event_count,
        };
        self.save_state(&fresh).await?;

        // 9-10. Snapshot maintenance on a fresh read.
        let mut fresh = self.load_state().await?;
        let view = fresh.snapshot_view();
        let mut written = Vec::new();

        let snapshot_written = if turn_index > 0 && turn_index % interval == 0 {
            written.push((target_id.to_string(), self.snapshot(&view, turn_index, false)));
            Some(target_id.to_string())
        } else {
            None
        };

        let bucket_empty = fresh
            .branch_snapshots
            .get(&branch_id)
            .map_or(true, |bucket| bucket.is_empty());
        let mut snapshots_backfilled = 0;
        if snapshot_written.is_none() && bucket_empty && turn_index > interval {
            for (turn, message_id) in backfill_checkpoints(&path, turn_index, interval) {
                written.push((message_id, self.snapshot(&view, turn, true)));
                snapshots_backfilled += 1;
            }
            if snapshots_backfilled > 0 {
                tracing::warn!(
                    branch = %branch_id,
                    count = snapshots_backfilled,
                    "StoryEngine: Backfilled approximate snapshots from the current state"
                );
            }
        }

        if !written.is_empty() {
            fresh
                .branch_snapshots
                .entry(branch_id.clone())
                .or_default()
                .extend(written);
            self.save_state(&fresh).await?;
        }
        drop(lock);
        self.event_log.reload().await?;

        tracing::info!(
            target_id = %target_id,
            branch = %branch_id,
            turn_index = turn_index,
            start = ?start,
            events_replayed = to_replay.len(),
            stale_snapshots = stale,
            "StoryEngine: Recalculation complete"
        );

        Ok(RecalcReport {
            target_message_id: target_id.to_string(),
            branch_id,
            turn_index,
            start,
            events_replayed: to_replay.len(),
            dispatch,
            genesis_recovered,
            schema_reconciled,
            snapshot_written,
            snapshots_backfilled,
        })
    }

    fn snapshot(&self, view: &WorldState, turn_index: usize, approximate: bool) -> BranchSnapshot {
        BranchSnapshot {
            world_state: view.clone(),
            schema_version: self.config.schema_version,
            turn_index,
            approximate,
            created_at: Utc::now(),
        }
    }

    /// Apply logged events past the watermark to the live world state.
    ///
    /// Loops until nothing is pending. Each round reads and writes under the
    /// story state lock. While a recalculation is running the write is
    /// skipped and the watermark stays where it was.
    pub async fn sync_live_state(&self) -> Result<DispatchReport> {
        let mut total = DispatchReport::default();
        let Some(_pass) = self.reducer.try_begin_pass() else {
            tracing::debug!("StoryEngine: Dispatch pass already running, leaving events to it");
            return Ok(total);
        };

        loop {
            if self.is_recalculating() {
                tracing::debug!("StoryEngine: Recalculation in progress, skipping live write");
                break;
            }
            let _lock = self.variables_lock.lock().await;
            let mut state = self.load_state().await?;
            if state.ledger.processed_count >= state.ledger.events.len() {
                break;
            }
            let report = self
                .reducer
                .dispatch_pending(&mut state.world_state, &mut state.ledger);
            if self.is_recalculating() {
                tracing::debug!("StoryEngine: Recalculation started mid-pass, dropping live write");
                break;
            }
            self.save_state(&state).await?;
            total.merge(report);
        }

        if total.applied + total.unhandled + total.failed > 0 {
            tracing::debug!(
                applied = total.applied,
                unhandled = total.unhandled,
                failed = total.failed,
                "StoryEngine: Live state synced"
            );
        }
        Ok(total)
    }

    /// Scan a finished page, log its events and fold them into the live state.
    /// Returns how many events were new.
    pub async fn ingest_message(&self, message_id: &str) -> Result<usize> {
        let added = self.event_log.ingest_message(message_id).await?;
        if added > 0 {
            self.sync_live_state().await?;
        }
        Ok(added)
    }

    /// Log events injected directly and fold them into the live state.
    pub async fn inject_events(&self, events: Vec<GameEvent>) -> Result<usize> {
        let added = self.event_log.add_events(events).await?;
        if added > 0 {
            self.sync_live_state().await?;
        }
        Ok(added)
    }

    pub async fn on_active_page_changed(&self, change: &ActivePageChanged) -> RecalcOutcome {
        tracing::debug!(
            new_message_id = %change.new_message_id,
            previous_message_id = ?change.previous_message_id,
            "StoryEngine: Active page changed"
        );
        self.recalculate(&change.new_message_id).await
    }

    /// Recalculate on every signal received from a history change channel.
    pub fn spawn_change_listener(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<ActivePageChanged>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                if let RecalcOutcome::Failed(reason) = self.on_active_page_changed(&change).await {
                    tracing::warn!(
                        new_message_id = %change.new_message_id,
                        reason = %reason,
                        "StoryEngine: Recalculation after page change failed"
                    );
                }
            }
            tracing::debug!("StoryEngine: Change channel closed");
        })
    }
}
