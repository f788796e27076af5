//! Unified error types for Moorage

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Moorage operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Resource lookup
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("No {kind} matched your input: {filters}")]
    NoMatch { kind: String, filters: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid resource name '{0}'")]
    InvalidResourceName(String),

    // Security
    #[error("Insecure path {0} escapes the jail root")]
    InsecureJailPath(PathBuf),

    // Runtime state
    #[error("Failed to update jail states: {0}")]
    StateUpdateFailed(String),

    #[error("Operation on '{target}' failed: {message}")]
    OperationFailed { target: String, message: String },

    #[error("Cannot {action} fstab while it is {state}")]
    FstabState { action: String, state: String },

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Export failed: {0}")]
    ExportFailed(String),

    #[error("This command must be run as root")]
    RequiresRoot,

    // Release errors
    #[error("Failed to download: {0}")]
    DownloadFailed(String),

    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("Failed to extract archive: {0}")]
    ExtractionFailed(String),

    #[error("Unsupported architecture: {0}")]
    UnsupportedArch(String),

    #[error("Invalid version format: {0}")]
    InvalidVersion(String),
}

impl Error {
    /// Shorthand for a resource that does not resolve
    pub fn not_found(kind: &str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    /// Shorthand for a failed lifecycle step on a target
    pub fn operation(target: impl Into<String>, message: impl Into<String>) -> Self {
        Error::OperationFailed {
            target: target.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for Moorage operations
pub type Result<T> = std::result::Result<T, Error>;
