//! Error types for knowledge-sync.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invoke error: {0}")]
    Invoke(#[from] InvokeError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the error came from an abandoned (cancelled) operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Error::Cancelled
                | Error::Store(StoreError::Cancelled)
                | Error::Invoke(InvokeError::Cancelled)
        )
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Object store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("Conflict updating {kind} {name}: the object has been modified")]
    Conflict { kind: String, name: String },

    #[error("Timed out after {timeout:?} waiting for {kind} {name}")]
    Timeout {
        kind: String,
        name: String,
        timeout: Duration,
    },

    #[error("Watch failed: {0}")]
    Watch(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store operation cancelled")]
    Cancelled,
}

impl StoreError {
    /// Optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub(crate) fn not_found(kind: &str, name: &str) -> Self {
        StoreError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub(crate) fn conflict(kind: &str, name: &str) -> Self {
        StoreError::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Task invocation errors.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Tool {name} not found")]
    ToolNotFound { name: String },

    #[error("Tool {tool} failed to start: {reason}")]
    StartFailed { tool: String, reason: String },

    /// The task ran and reported failure.
    #[error("{0}")]
    Failed(String),

    #[error("Task cancelled")]
    Cancelled,
}

/// Workspace file errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Workspace {id} not found")]
    NotFound { id: String },

    #[error("Invalid workspace path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sync schedule errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid sync schedule {expression:?}: {reason}")]
    Invalid { expression: String, reason: String },

    #[error("sync schedule {expression:?} never fires")]
    NoUpcoming { expression: String },
}

/// Sync metadata extraction errors.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Failed to parse sync metadata: {0}")]
    Parse(String),

    #[error("Failed to compress sync details: {0}")]
    Compress(#[from] std::io::Error),
}

/// Progress stream client errors.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Server responded with status {0}")]
    Status(u16),
}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => StreamError::Status(status.as_u16()),
            None => StreamError::Http(e.to_string()),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
