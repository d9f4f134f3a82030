//! Fire-and-forget notifications and the active-page change signal.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyLevel {
    Success,
    Warning,
    Error,
}

/// Receives user-facing status messages. Never consulted for control flow.
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NotifyLevel, message: &str);
}

/// Routes notifications into the tracing log.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, level: NotifyLevel, message: &str) {
        match level {
            NotifyLevel::Success => tracing::info!(notification = %message, "Notifier: success"),
            NotifyLevel::Warning => tracing::warn!(notification = %message, "Notifier: warning"),
            NotifyLevel::Error => tracing::error!(notification = %message, "Notifier: error"),
        }
    }
}

/// Pushed whenever a swipe selection actually changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePageChanged {
    pub new_message_id: String,
    pub previous_message_id: Option<String>,
}
