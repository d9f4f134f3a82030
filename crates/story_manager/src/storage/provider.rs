use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Addressable documents of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The branching history tree.
    History,
    /// Conversation-level story state: world state, event log, genesis, snapshots.
    Variables,
    /// Variables attached to a single message.
    Message(String),
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::History => write!(f, "history"),
            Scope::Variables => write!(f, "variables"),
            Scope::Message(id) => write!(f, "message:{}", id),
        }
    }
}

/// Whole-document persistence. There is no partial update: callers read,
/// modify and replace the entire document.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read(&self, scope: &Scope) -> Result<Option<Value>>;
    async fn replace(&self, scope: &Scope, value: Value) -> Result<()>;
}

/// Read a scope and deserialize it, `None` when nothing is stored.
pub async fn load_typed<T: DeserializeOwned>(
    store: &dyn StateStore,
    scope: &Scope,
) -> Result<Option<T>> {
    match store.read(scope).await? {
        Some(Value::Null) | None => Ok(None),
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
    }
}

pub async fn save_typed<T: Serialize + Sync>(
    store: &dyn StateStore,
    scope: &Scope,
    value: &T,
) -> Result<()> {
    store.replace(scope, serde_json::to_value(value)?).await
}
