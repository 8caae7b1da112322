//! # Error Types
//!
//! Custom error types for Habitat Listener using `thiserror`.

use thiserror::Error;

use crate::uploader::store::StoreError;

/// Main error type for Habitat Listener
#[derive(Debug, Error)]
pub enum HabitatError {
    /// Sentence delimiters or checksum framing are wrong
    #[error("Malformed sentence: {0}")]
    MalformedSentence(String),

    /// Checksum did not match the sentence data
    #[error("Invalid checksum: expected {expected}, got {found}")]
    ChecksumMismatch { expected: String, found: String },

    /// Payload configuration is missing or malformed
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Every candidate sentence configuration rejected the sentence
    #[error("No matching sentence configuration ({} candidates rejected)", .0.len())]
    NoMatchingSchema(Vec<String>),

    /// Merge retries exhausted by write conflicts
    #[error("Unmergeable: gave up after {attempts} conflicting attempts")]
    Unmergeable { attempts: usize },

    /// Store permanently refused the write
    #[error("Rejected by document store: {0}")]
    Rejected(StoreError),

    /// Caller passed something it must not
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Any other document store failure
    #[error("Document store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Timestamp conversion errors
    #[error("Time error: {0}")]
    Time(String),

    /// Serial port errors
    #[error("Serial error: {0}")]
    Serial(String),
}

/// Result type alias for Habitat Listener
pub type Result<T> = std::result::Result<T, HabitatError>;
