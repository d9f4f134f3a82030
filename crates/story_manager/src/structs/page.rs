use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author of a single page.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Summary,
}

/// One concrete message variant. A user turn owns exactly one page, an
/// assistant turn owns one page per swipe.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Page {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,

    /// Active page of the previous turn at the time this page was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Side-channel events attached by plugins, replayed for non-gameplay effects.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_events: Vec<serde_json::Value>,
}

impl Page {
    pub fn new(role: Role, content: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: new_page_id(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            parent_id,
            local_events: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

pub fn new_page_id() -> String {
    format!("msg-{}", Uuid::new_v4())
}
