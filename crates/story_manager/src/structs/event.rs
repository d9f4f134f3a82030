use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A typed fact extracted from generated text or injected directly.
/// Never mutated once created.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GameEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    /// Opaque to the log; only handlers interpret it.
    #[serde(default)]
    pub payload: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_message_id: Option<String>,

    pub event_id: String,
}

impl GameEvent {
    pub fn new(
        event_type: impl Into<String>,
        payload: Value,
        source_message_id: Option<String>,
        event_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            source_message_id,
            event_id: event_id.into(),
        }
    }
}
