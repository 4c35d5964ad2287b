//! Error types for the queue engine.

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Steering error: {0}")]
    Steering(#[from] SteeringError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Key/value storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Job queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Session lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session {id} not found")]
    NotFound { id: Uuid },

    #[error("Session {id} is already terminal ({status})")]
    AlreadyTerminal { id: Uuid, status: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Steering mailbox errors.
#[derive(Debug, thiserror::Error)]
pub enum SteeringError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Classifier errors. The engine degrades these to the conservative
/// "treat as Question" path; they never abort a job.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid classifier response: {0}")]
    InvalidResponse(String),
}

/// Agent execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// An abort steering message was consumed at a checkpoint.
    #[error("Execution aborted by steering message")]
    Aborted,

    #[error("Agent execution failed: {reason}")]
    Failed { reason: String },
}

/// Outbound delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Delivery to session {session_id} failed: {reason}")]
    SendFailed { session_id: Uuid, reason: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
