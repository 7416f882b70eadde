use ap_core::AutopilotError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ActionError>;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("target missing: {0}")]
    TargetMissing(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error(transparent)]
    Core(#[from] AutopilotError),
}

impl ActionError {
    /// Whether running the same task again could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidArguments(_) | Self::TargetMissing(_) => false,
            Self::ExecutionFailed(_) => true,
            Self::Core(e) => !matches!(
                e,
                AutopilotError::InvalidDecision(_)
                    | AutopilotError::Serialization(_)
                    | AutopilotError::NotFound(_)
                    | AutopilotError::Unauthorized(_)
            ),
        }
    }
}
