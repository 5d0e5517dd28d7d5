//! Error types for stackd

use thiserror::Error;

use crate::deploy::compose::ComposeError;
use crate::deploy::git::GitError;

/// Main error type for stackd
#[derive(Error, Debug)]
pub enum StackError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error("Project name already in use: {0}")]
    NameTaken(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Cipher error: {0}")]
    CipherError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StackError {
    /// True when the operation was cancelled rather than failed
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StackError::Compose(ComposeError::Cancelled { .. }))
    }
}

impl From<anyhow::Error> for StackError {
    fn from(err: anyhow::Error) -> Self {
        StackError::Internal(err.to_string())
    }
}
