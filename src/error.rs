use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApexError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Payload too large: {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Path escapes whitelist root: {}", .0.display())]
    PathEscapesRoot(PathBuf),

    #[error("Unsupported patch format: {0}")]
    PatchFormat(String),

    #[error("Patch target not found in file: {0}")]
    PatchTargetMissing(String),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(String),

    #[error("Intent log corrupted: {0}")]
    IntentLogCorrupted(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Test runner error: {0}")]
    TestRunner(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, ApexError>;
