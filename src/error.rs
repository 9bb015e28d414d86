//! Error types for the relay.

use crate::model::MessageState;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Map a libSQL error, recognising unique/foreign-key violations.
    pub(crate) fn from_libsql(context: &str, err: libsql::Error) -> Self {
        let text = err.to_string();
        if text.contains("UNIQUE constraint failed") || text.contains("FOREIGN KEY constraint") {
            Self::Constraint(format!("{context}: {text}"))
        } else {
            Self::Query(format!("{context}: {text}"))
        }
    }
}

/// Input rejected at the manager boundary. Never reaches the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("A message with key {0} already exists")]
    DuplicateKey(String),

    #[error("A provider named {0} already exists")]
    DuplicateProvider(String),

    #[error("Duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },
}

/// Encryption collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed: {0}")]
    Seal(String),

    #[error("Decryption failed: {0}")]
    Open(String),

    #[error("Malformed ciphertext: {0}")]
    Malformed(String),
}

/// Pipeline-related errors.
///
/// Inside a sweep these are isolated per message; only fetch failures abort
/// the sweep.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Message {key} cannot move from {from} to {to}")]
    InvalidTransition {
        key: String,
        from: MessageState,
        to: MessageState,
    },

    #[error("Message {key} is disabled")]
    Disabled { key: String },

    #[error("Message {0} has not been persisted")]
    Unsaved(String),

    #[error("Dispatch of message {key} cancelled before it started")]
    Cancelled { key: String },
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
