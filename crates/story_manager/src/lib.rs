//! # Story Manager
//!
//! Keeps the branching history of an interactive story and rebuilds the
//! derived world state from the events embedded in it.

pub mod config;
pub mod error;
pub mod event_log;
pub mod history_store;
pub mod migration;
pub mod notify;
pub mod recalc;
pub mod reducer;
pub mod storage;
pub mod structs;

// Re-exports
pub use config::{EngineConfig, ReplayPolicy};
pub use error::{Result, StoryError};
pub use event_log::{EventExtractor, EventLog};
pub use history_store::HistoryStore;
pub use notify::{ActivePageChanged, Notifier, NotifyLevel, TracingNotifier};
pub use recalc::{RecalcOutcome, RecalcReport, ReplayStart, StoryEngine};
pub use reducer::{DispatchReport, EventHandler, WorldReducer};
pub use storage::{FileStateStore, MemoryStateStore, Scope, StateStore};
pub use structs::event::GameEvent;
pub use structs::history::{History, MessageCoordinate};
pub use structs::page::{Page, Role};
pub use structs::story_state::{BranchSnapshot, StoryState};
pub use structs::turn::{Turn, TurnRole};
pub use structs::world::WorldState;
