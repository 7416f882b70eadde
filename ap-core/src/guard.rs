use crate::error::{AutopilotError, Result};
use serde::{Deserialize, Serialize};

/// Global switches read at the start of every decision point.
///
/// Built once per operation from configuration plus the persisted reliability
/// state and passed in explicitly, so tests can simulate stopped or paused
/// systems without touching shared state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardState {
    /// Nothing runs: no generation, no AI calls, no dispatch.
    pub emergency_stop: bool,
    /// Decisions are generated but never auto-applied.
    pub safe_mode: bool,
    /// Reliability breaker tripped or an operator paused the system.
    pub paused: bool,
    #[serde(default)]
    pub pause_reason: Option<String>,
}

impl GuardState {
    pub fn running() -> Self {
        Self::default()
    }

    pub fn with_emergency_stop(mut self, on: bool) -> Self {
        self.emergency_stop = on;
        self
    }

    pub fn with_safe_mode(mut self, on: bool) -> Self {
        self.safe_mode = on;
        self
    }

    pub fn with_pause(mut self, reason: Option<String>) -> Self {
        self.paused = reason.is_some();
        self.pause_reason = reason;
        self
    }

    pub fn allows_ai(&self) -> bool {
        !self.emergency_stop
    }

    pub fn allows_dispatch(&self) -> bool {
        !self.emergency_stop && !self.paused
    }

    pub fn allows_auto_apply(&self) -> bool {
        self.allows_dispatch() && !self.safe_mode
    }

    /// Error form of [`allows_auto_apply`](Self::allows_auto_apply).
    pub fn check_auto_apply(&self) -> Result<()> {
        if self.emergency_stop {
            return Err(AutopilotError::EmergencyStop);
        }
        if self.paused {
            return Err(AutopilotError::ReliabilityPaused(
                self.pause_reason
                    .clone()
                    .unwrap_or_else(|| "paused".to_string()),
            ));
        }
        if self.safe_mode {
            return Err(AutopilotError::ReliabilityPaused("safe_mode".to_string()));
        }
        Ok(())
    }
}
