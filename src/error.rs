//! Error types for chatwarden.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("pipeline is shutting down")]
    ShuttingDown,

    #[error("partitions are being resized")]
    Resizing,

    #[error("action {id} exhausted {attempts} attempts")]
    RetriesExhausted { id: String, attempts: u32 },

    #[error("action {id} attempt {attempt} failed: {reason}")]
    ActionFailed {
        id: String,
        attempt: u32,
        reason: String,
    },

    #[error("action {id} is being executed elsewhere")]
    ActionInProgress { id: String },

    #[error("action {id} failed permanently: {reason}")]
    PermanentAction { id: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
