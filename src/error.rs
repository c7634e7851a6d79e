//! Error types for satfetch
//!
//! One `Error` enum covers the whole crate. Variants map onto the failure
//! classes the pipeline distinguishes:
//! - invalid input (config, credentials, missing collection) — fatal to a job
//! - transient transport (network, I/O, timeout, catalog HTTP) — retried
//! - integrity (digest mismatch) — fails the item, never retried
//! - processor (user hook) — fails the item, pipeline continues
//! - shutdown — cooperative cancellation, not a real failure

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for satfetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for satfetch
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "download.parallel")
        key: Option<String>,
    },

    /// Invalid input to an operation (missing time range for bisection, bad
    /// filter parameters, missing collection field)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Credential discovery or token acquisition failed
    #[error("credential error: {0}")]
    Credentials(String),

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Catalog API returned something the client cannot interpret
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Network error from the HTTP layer
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A single item transfer exceeded its deadline
    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),

    /// Downloaded payload does not hash to the catalog-reported digest
    #[error("digest mismatch for {path}: expected {expected}, got {computed}")]
    DigestMismatch {
        /// Path of the file that failed verification
        path: PathBuf,
        /// Digest reported by the catalog
        expected: String,
        /// Digest computed from the transferred bytes
        computed: String,
    },

    /// User post-processing hook failed
    #[error("post-processing error: {0}")]
    PostProcess(String),

    /// Requested resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress
    #[error("shutdown in progress")]
    ShuttingDown,

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}

impl Error {
    /// Shorthand for a config error without a key
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: None,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_helper_has_no_key() {
        let err = Error::config("bad value");
        match err {
            Error::Config { message, key } => {
                assert_eq!(message, "bad value");
                assert!(key.is_none());
            }
            other => panic!("expected Config, got {other:?}"),
        }
    }

    #[test]
    fn digest_mismatch_message_names_both_digests() {
        let err = Error::DigestMismatch {
            path: PathBuf::from("/tmp/P1"),
            expected: "d1".into(),
            computed: "d2".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("d1"));
        assert!(msg.contains("d2"));
        assert!(msg.contains("digest mismatch"));
    }

    #[test]
    fn database_error_wraps_into_error() {
        let err: Error = DatabaseError::QueryFailed("locked".into()).into();
        assert!(err.to_string().contains("query failed: locked"));
    }

    #[test]
    fn timeout_message_contains_duration() {
        let err = Error::Timeout(Duration::from_secs(300));
        assert!(err.to_string().contains("300"));
    }
}
