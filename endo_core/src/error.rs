//! Error types for the endo_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for endo_core operations
///
/// A locked entry collection and a skipped save are not errors; they are
/// reported through [`crate::LoadedEntries`] and [`crate::SaveOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The host has no usable persistent storage
    #[error("Storage engine unavailable: {0}")]
    EngineUnavailable(String),

    /// A transaction was rolled back
    #[error("Transaction on table '{table}' aborted: {reason}")]
    TransactionAborted { table: String, reason: String },

    /// A table that was never declared in the schema
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Schema declaration error
    #[error("Schema error: {0}")]
    Schema(String),

    /// The stored database is newer than the declared schema
    #[error("Stored database version {stored} is newer than declared version {declared}")]
    VersionConflict { stored: u32, declared: u32 },

    /// No cryptographic primitives on this host
    #[error("Crypto unavailable: {0}")]
    CryptoUnavailable(String),

    /// Encryption or key derivation failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Backup file format error
    #[error("Backup error: {0}")]
    Backup(String),
}

impl Error {
    pub(crate) fn aborted(table: &str, reason: impl Into<String>) -> Self {
        Error::TransactionAborted {
            table: table.to_string(),
            reason: reason.into(),
        }
    }
}
