//! Error taxonomy shared by every Giftbox crate.

/// Giftbox error type.
#[derive(Debug, thiserror::Error)]
pub enum GiftboxError {
    #[error("Config error: {0}")]
    Config(String),

    /// A rule set that can never be honoured (non-positive multiplier, zero winners...).
    /// Raised when an event is scheduled, never mid-lifecycle.
    #[error("Invalid rules: {0}")]
    InvalidRules(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// A concurrent write won the race against ours.
    #[error("Persistence conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Raffle error: {0}")]
    Raffle(String),

    #[error("Donation error: {0}")]
    Donation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GiftboxError {
    /// Whether retrying the same operation with a fresh read may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, GiftboxError::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, GiftboxError>;
