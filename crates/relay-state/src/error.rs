//! Error types for relay-state

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StateError {
    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted file exists but cannot be interpreted
    #[error("Corrupt state file {path}: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    /// Profile name is empty or contains characters unsafe for a file name
    #[error("Invalid profile name: {0:?}")]
    InvalidProfile(String),

    /// A profile with this name is already registered
    #[error("Profile '{0}' already exists")]
    ProfileExists(String),

    /// No profile with this name is registered
    #[error("Profile '{0}' not found")]
    ProfileNotFound(String),

    /// The default profile cannot be deleted
    #[error("The default profile cannot be deleted")]
    DefaultProfile,

    /// A single mapping entry is malformed
    #[error("Invalid mapping for '{external}': {detail}")]
    InvalidMapping { external: String, detail: String },

    /// A blocking persistence task was cancelled or panicked
    #[error("Persistence task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for StateError {
    fn from(err: tokio::task::JoinError) -> Self {
        StateError::Task(err.to_string())
    }
}
