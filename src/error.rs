//! Error types for watchd.

use crate::store::Run;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] StoreError),

    #[error("Execution error: {0}")]
    Execute(#[from] ExecuteError),

    #[error("Agent '{0}' not found")]
    UnknownAgent(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// Storage errors. Never swallowed by the executor.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by the state proxy.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("State key not found: {0}")]
    MissingKey(String),

    #[error("State value for {key} has unexpected shape: {reason}")]
    Decode { key: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a failed agent attempt.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Recoverable: retried, then absorbed into the run record.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    /// Non-recoverable: not retried, propagated after bookkeeping.
    #[error("Interrupted: {0}")]
    Interrupted(String),
}

impl AgentError {
    /// Recoverable failure from any displayable message.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self::Failed(anyhow::anyhow!("{message}"))
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl From<StateError> for AgentError {
    fn from(e: StateError) -> Self {
        Self::Failed(e.into())
    }
}

impl From<StoreError> for AgentError {
    fn from(e: StoreError) -> Self {
        Self::Failed(e.into())
    }
}

/// Errors that escape `Executor::execute`.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// The run was interrupted; `run` holds the finalized record.
    #[error("Run interrupted: {reason}")]
    Interrupted { run: Box<Run>, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
