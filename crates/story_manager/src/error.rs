//! Error types for the story manager

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoryError {
    /// An id or index could not be resolved.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The requested state transition is not allowed.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Genesis and its backup are both gone and could not be recovered.
    #[error("Data integrity failure: {0}")]
    DataIntegrity(String),

    /// A malformed event block.
    #[error("Parse failure: {0}")]
    Parse(String),

    /// The persisted store rejected a read or a write.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl StoryError {
    pub fn not_found(what: impl Into<String>) -> Self {
        StoryError::NotFound(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        StoryError::InvalidOperation(what.into())
    }
}

pub type Result<T> = std::result::Result<T, StoryError>;
