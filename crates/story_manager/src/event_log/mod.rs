pub mod extraction;
pub mod ledger;
pub mod normalize;

pub use extraction::EventExtractor;
pub use ledger::EventLog;
pub use normalize::{normalize_event, unwrap_inner, WRAPPER_EVENT_TYPE};
