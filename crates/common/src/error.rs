//! Error types for CyberLab

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using CyberLab Error
pub type Result<T> = std::result::Result<T, Error>;

/// CyberLab error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Lab {lab_id} is already running")]
    AlreadyRunning { lab_id: i64 },

    #[error("Lab {lab_id} is not running")]
    NotRunning { lab_id: i64 },

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Compose definition not found: {}", .0.display())]
    DefinitionNotFound(PathBuf),

    #[error("Failed to execute {program}: {message}")]
    ComposeSpawn { program: String, message: String },

    #[error("Compose exited with code {code:?}: {output}")]
    ComposeExit { code: Option<i32>, output: String },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn lab_not_found(lab_id: i64) -> Self {
        Error::NotFound {
            kind: "lab".to_string(),
            id: lab_id.to_string(),
        }
    }

    /// Failures reported before any state was touched; never retried.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::AlreadyRunning { .. }
                | Error::NotRunning { .. }
                | Error::InvalidStateTransition { .. }
        )
    }

    /// Launch or teardown failures of the external compose process.
    pub fn is_compose_failure(&self) -> bool {
        matches!(
            self,
            Error::DefinitionNotFound(_)
                | Error::ComposeSpawn { .. }
                | Error::ComposeExit { .. }
                | Error::Timeout { .. }
        )
    }
}
