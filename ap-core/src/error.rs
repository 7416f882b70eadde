use thiserror::Error;

pub type Result<T> = std::result::Result<T, AutopilotError>;

/// Hard failures surfaced by the engine.
///
/// Admission denials, provider failures and retryable task failures are
/// ordinary outcomes and are returned as values, not as errors.
#[derive(Debug, Error)]
pub enum AutopilotError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("snapshot not found: {0}")]
    SnapshotMissing(String),

    #[error("invalid decision: {0}")]
    InvalidDecision(String),

    #[error("invalid transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("autopilot paused: {0}")]
    ReliabilityPaused(String),

    #[error("emergency stop is active")]
    EmergencyStop,

    #[error("listener {listener} failed: {message}")]
    Listener { listener: String, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for AutopilotError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for AutopilotError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
