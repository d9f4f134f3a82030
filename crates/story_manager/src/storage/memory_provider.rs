use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::provider::{Scope, StateStore};
use crate::error::Result;

/// In-process store, for tests and hosts that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    documents: RwLock<HashMap<Scope, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read(&self, scope: &Scope) -> Result<Option<Value>> {
        Ok(self.documents.read().await.get(scope).cloned())
    }

    async fn replace(&self, scope: &Scope, value: Value) -> Result<()> {
        tracing::trace!(scope = %scope, "MemoryStore: replace");
        self.documents.write().await.insert(scope.clone(), value);
        Ok(())
    }
}
