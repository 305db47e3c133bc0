//! Error types for tally
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (bad args, bad config)
//! - 4: Operation failed (io, source unavailable, watcher failure)
//!
//! Inside the engine every variant is recovered locally; only the CLI turns
//! them into exit codes.

use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the tally CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Main error type for tally operations
#[derive(Error, Debug)]
pub enum Error {
    // User errors (exit code 2)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transcript not found: {0}")]
    TranscriptNotFound(PathBuf),

    // Operation failures (exit code 4)
    #[error("Extractor '{key}' failed: {reason}")]
    ExtractionFailure { key: String, reason: String },

    #[error("Transcript source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Consumer '{consumer}' failed: {reason}")]
    ConsumerFailure { consumer: String, reason: String },

    #[error("Malformed transcript line {line}: {reason}")]
    MalformedTranscript { line: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl Error {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            // User errors
            Error::InvalidConfig(_)
            | Error::InvalidArgument(_)
            | Error::TranscriptNotFound(_) => exit_codes::USER_ERROR,

            // Operation failures
            Error::ExtractionFailure { .. }
            | Error::SourceUnavailable(_)
            | Error::ConsumerFailure { .. }
            | Error::MalformedTranscript { .. }
            | Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::Watch(_)
            | Error::Pattern(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// Structured details for JSON error output, when the variant carries any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::TranscriptNotFound(path) => Some(serde_json::json!({
                "path": path.display().to_string(),
            })),
            Error::ExtractionFailure { key, .. } => Some(serde_json::json!({
                "pattern_key": key,
            })),
            Error::ConsumerFailure { consumer, .. } => Some(serde_json::json!({
                "consumer": consumer,
            })),
            Error::MalformedTranscript { line, .. } => Some(serde_json::json!({
                "line": line,
            })),
            _ => None,
        }
    }

    /// Whether a retry may succeed without user intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::SourceUnavailable(_) | Error::Watch(_))
    }
}

/// Result type alias for tally operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wrapper for displaying errors in JSON format
#[derive(serde::Serialize)]
pub struct JsonError {
    pub error: String,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&Error> for JsonError {
    fn from(err: &Error) -> Self {
        JsonError {
            error: err.to_string(),
            code: err.exit_code(),
            details: err.details(),
        }
    }
}
