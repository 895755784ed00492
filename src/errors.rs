use std::path::PathBuf;
use thiserror::Error;

use crate::validate::ValidationReport;

/// All errors that can occur while staging or applying MTA configuration.
#[derive(Debug, Error)]
pub enum StageError {
    // --- Input errors (no side effects) ---
    #[error("Invalid parameters: {0}")]
    Validation(ValidationReport),

    #[error("MTA configuration check rejected the candidate: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),

    #[error("Nothing to apply: the staging area is empty")]
    NothingToApply,

    // --- Concurrency ---
    #[error("Configuration locked by another operation, try again shortly")]
    Busy,

    // --- Apply pipeline ---
    #[error("{tool} failed: {detail}")]
    ExternalTool { tool: String, detail: String },

    #[error("MTA reload failed (previous configuration restored): {0}")]
    ReloadFailed(String),

    #[error("MTA not running after reload (previous configuration restored): {0}")]
    VerifyFailed(String),

    #[error("Write failed: {0}")]
    WriteFailure(String),

    #[error("FATAL: could not restore last-known-good configuration during {stage}: {detail}; manual intervention required")]
    CompensationFailure { stage: String, detail: String },

    // --- History ---
    #[error("Configuration version {0} not found")]
    VersionNotFound(i64),

    // --- Crypto errors ---
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: wrong process secret or corrupted data")]
    DecryptionFailed,

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Secret '{0}' not found")]
    SecretNotFound(String),

    #[error("No process secret provided: set MTASTAGE_SECRET or secret_file")]
    MissingSecret,

    // --- Storage errors ---
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("State directory not usable: {0}")]
    StateDir(PathBuf),

    // --- Config errors ---
    #[error("Config file error: {0}")]
    ConfigError(String),

    // --- IO errors ---
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // --- Serialization errors ---
    #[error("Serialization error: {0}")]
    SerializationError(String),

    // --- CLI errors ---
    #[error("Command failed: {0}")]
    CommandFailed(String),
}

impl StageError {
    /// Compensation failures leave the MTA in an unknown state and must be
    /// escalated to an operator rather than retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::CompensationFailure { .. })
    }

    /// Errors the caller may simply retry without changing anything.
    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Busy)
    }
}

/// Convenience type alias for mtastage results.
pub type Result<T> = std::result::Result<T, StageError>;
