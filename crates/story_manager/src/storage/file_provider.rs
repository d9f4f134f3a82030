use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;

use super::provider::{Scope, StateStore};
use crate::error::{Result, StoryError};

/// One pretty-printed JSON file per scope:
///
/// ```text
/// {base_dir}/
///   history.json
///   variables.json
///   messages/
///     {readable-id}-{sha256(message-id)}.json
/// ```
#[derive(Debug, Clone)]
pub struct FileStateStore {
    base_dir: PathBuf,
}

impl FileStateStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn get_path(&self, scope: &Scope) -> PathBuf {
        match scope {
            Scope::History => self.base_dir.join("history.json"),
            Scope::Variables => self.base_dir.join("variables.json"),
            Scope::Message(id) => self
                .base_dir
                .join("messages")
                .join(format!("{}.json", message_file_stem(id))),
        }
    }
}

/// File stem for a message id. The readable part is lossy, the digest keeps
/// distinct ids in distinct files.
fn message_file_stem(id: &str) -> String {
    let readable: String = id
        .chars()
        .take(48)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    format!("{}-{:x}", readable, hasher.finalize())
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn read(&self, scope: &Scope) -> Result<Option<Value>> {
        let path = self.get_path(scope);

        if !path.exists() {
            tracing::debug!(
                scope = %scope,
                path = %path.display(),
                "FileStore: File does not exist"
            );
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        let value: Value = serde_json::from_str(&content)?;

        tracing::debug!(
            scope = %scope,
            path = %path.display(),
            file_size = content.len(),
            "FileStore: Document loaded"
        );

        Ok(Some(value))
    }

    async fn replace(&self, scope: &Scope, value: Value) -> Result<()> {
        let path = self.get_path(scope);

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tracing::debug!(path = %parent.display(), "FileStore: Creating directory");
                fs::create_dir_all(parent).await.map_err(|e| {
                    StoryError::Persistence(format!("{}: {}", parent.display(), e))
                })?;
            }
        }

        let content = serde_json::to_string_pretty(&value)?;
        fs::write(&path, &content)
            .await
            .map_err(|e| StoryError::Persistence(format!("{}: {}", path.display(), e)))?;

        tracing::debug!(
            scope = %scope,
            path = %path.display(),
            json_size = content.len(),
            "FileStore: Document replaced"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_replace_and_read() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());

        assert!(store.read(&Scope::Variables).await.unwrap().is_none());

        store
            .replace(&Scope::Variables, json!({"world": {"day": 3}}))
            .await
            .unwrap();
        let loaded = store.read(&Scope::Variables).await.unwrap().unwrap();
        assert_eq!(loaded["world"]["day"], 3);
    }

    #[tokio::test]
    async fn test_message_scope_lives_in_subdirectory() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());

        let scope = Scope::Message("msg/../odd id".to_string());
        store.replace(&scope, json!({"initial_state": {}})).await.unwrap();

        let path = store.get_path(&scope);
        assert!(path.starts_with(dir.path().join("messages")));
        assert!(path.exists());
        assert!(store.read(&scope).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_similar_message_ids_get_separate_files() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());

        let dotted = Scope::Message("a.b".to_string());
        let underscored = Scope::Message("a_b".to_string());
        assert_ne!(store.get_path(&dotted), store.get_path(&underscored));

        store.replace(&dotted, json!({"n": 1})).await.unwrap();
        store.replace(&underscored, json!({"n": 2})).await.unwrap();
        assert_eq!(store.read(&dotted).await.unwrap().unwrap()["n"], 1);
        assert_eq!(store.read(&underscored).await.unwrap().unwrap()["n"], 2);
    }

    #[tokio::test]
    async fn test_replace_overwrites_whole_document() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());

        store.replace(&Scope::History, json!({"a": 1, "b": 2})).await.unwrap();
        store.replace(&Scope::History, json!({"a": 5})).await.unwrap();

        let loaded = store.read(&Scope::History).await.unwrap().unwrap();
        assert_eq!(loaded, json!({"a": 5}));
    }
}
