//! Error types for nbo-enrich.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("pipeline '{pipeline}' is already running")]
    AlreadyRunning { pipeline: String },

    #[error("no active run for pipeline '{pipeline}'")]
    NoActiveRun { pipeline: String },

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{stage}: {message}")]
    Collaborator { stage: String, message: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a failure reported by an external collaborator
    /// (source, enricher, sink).
    pub fn collaborator(stage: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Collaborator {
            stage: stage.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
