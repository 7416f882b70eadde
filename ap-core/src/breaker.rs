//! Reliability circuit breaker.
//!
//! Tracks task outcomes over a rolling window and trips a persisted pause
//! when the failure rate exceeds the threshold over a minimum sample. An
//! auto-pause never clears itself; only an explicit `resume` does.

use crate::error::{AutopilotError, Result};
use crate::events::{AutopilotEvent, EventBus};
use crate::guard::GuardState;
use crate::store::ReliabilityRepository;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

pub const AUTO_PAUSE_REASON: &str = "auto:fail_rate";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub min_confidence: f64,
    pub max_fail_rate: f64,
    pub min_sample: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            max_fail_rate: 0.25,
            min_sample: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Applied,
    Failed,
    Rejected,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for OutcomeKind {
    type Err = AutopilotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            "rejected" => Ok(Self::Rejected),
            other => Err(AutopilotError::Storage(format!("unknown outcome kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Health {
    pub applied: u64,
    pub failed: u64,
    pub rejected: u64,
    /// `failed / (applied + failed)`; zero until `sample ≥ min_sample`.
    pub fail_rate: f64,
    pub sample: u64,
}

impl Health {
    fn from_counts(applied: u64, failed: u64, rejected: u64, min_sample: u64) -> Self {
        let sample = applied + failed;
        let fail_rate = if sample >= min_sample && sample > 0 {
            failed as f64 / sample as f64
        } else {
            0.0
        };
        Self {
            applied,
            failed,
            rejected,
            fail_rate,
            sample,
        }
    }
}

/// Persisted pause flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PauseState {
    pub paused: bool,
    pub reason: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub meta: serde_json::Value,
    /// Outcomes before the last resume no longer count toward the fail rate.
    pub resumed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReliabilityState {
    pub paused: bool,
    pub reason: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfidenceVerdict {
    AutoApply,
    ManualReview { reason: String },
}

/// Log-odds correction against `baseline`: `σ(logit(p) − logit(baseline))`.
/// A baseline of 0.5 leaves `p` unchanged.
pub fn debias_confidence(p: f64, baseline: f64) -> f64 {
    const EPS: f64 = 1e-6;
    let logit = |x: f64| {
        let x = x.clamp(EPS, 1.0 - EPS);
        (x / (1.0 - x)).ln()
    };
    let z = logit(p) - logit(baseline);
    (1.0 / (1.0 + (-z).exp())).clamp(0.0, 1.0)
}

pub struct Breaker {
    repo: Arc<dyn ReliabilityRepository>,
    events: Arc<EventBus>,
    thresholds: Thresholds,
    window_days: i64,
    baseline: f64,
}

impl Breaker {
    pub fn new(
        repo: Arc<dyn ReliabilityRepository>,
        events: Arc<EventBus>,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            repo,
            events,
            thresholds,
            window_days: 7,
            baseline: 0.5,
        }
    }

    pub fn with_window_days(mut self, days: u32) -> Self {
        self.window_days = i64::from(days.max(1));
        self
    }

    pub fn with_confidence_baseline(mut self, baseline: f64) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn record(&self, kind: OutcomeKind, subject: Option<&str>) -> Result<()> {
        self.record_at(kind, subject, Utc::now())
    }

    pub fn record_at(&self, kind: OutcomeKind, subject: Option<&str>, at: DateTime<Utc>) -> Result<()> {
        self.repo.record_outcome(kind, subject, at)
    }

    pub fn health(&self, window_days: u32) -> Result<Health> {
        self.health_since(Utc::now() - Duration::days(i64::from(window_days)))
    }

    pub fn health_since(&self, since: DateTime<Utc>) -> Result<Health> {
        let c = self.repo.count_outcomes(since)?;
        Ok(Health::from_counts(
            c.applied,
            c.failed,
            c.rejected,
            self.thresholds.min_sample,
        ))
    }

    pub fn pause_state(&self) -> Result<PauseState> {
        Ok(self.repo.load_pause()?.unwrap_or_default())
    }

    pub fn state(&self) -> Result<ReliabilityState> {
        let p = self.pause_state()?;
        Ok(ReliabilityState {
            paused: p.paused,
            reason: p.reason,
            since: p.since,
            thresholds: self.thresholds,
        })
    }

    /// Overlay the persisted pause onto `base`.
    pub fn guard(&self, base: GuardState) -> Result<GuardState> {
        let p = self.pause_state()?;
        Ok(if p.paused {
            base.with_pause(Some(p.reason.unwrap_or_else(|| "paused".to_string())))
        } else {
            base
        })
    }

    /// Recompute the fail rate over the current window and trip the pause
    /// when it exceeds the threshold. Returns true when this call tripped it.
    pub async fn evaluate(&self) -> Result<bool> {
        let state = self.pause_state()?;
        if state.paused {
            return Ok(false);
        }
        let mut since = Utc::now() - Duration::days(self.window_days);
        if let Some(resumed) = state.resumed_at {
            since = since.max(resumed + Duration::milliseconds(1));
        }
        let health = self.health_since(since)?;
        if health.sample < self.thresholds.min_sample
            || health.fail_rate <= self.thresholds.max_fail_rate
        {
            return Ok(false);
        }
        tracing::error!(
            fail_rate = health.fail_rate,
            sample = health.sample,
            max_fail_rate = self.thresholds.max_fail_rate,
            "fail rate over threshold; pausing autopilot"
        );
        self.pause(
            AUTO_PAUSE_REASON,
            serde_json::json!({
                "fail_rate": health.fail_rate,
                "sample": health.sample,
                "applied": health.applied,
                "failed": health.failed,
            }),
        )
        .await?;
        Ok(true)
    }

    /// Manual or automatic pause; always allowed, overwrites the reason.
    pub async fn pause(&self, reason: &str, meta: serde_json::Value) -> Result<PauseState> {
        let mut state = self.pause_state()?;
        state.paused = true;
        state.reason = Some(reason.to_string());
        state.since = Some(Utc::now());
        state.meta = meta.clone();
        self.repo.save_pause(&state)?;
        tracing::warn!(reason, "autopilot paused");
        self.events
            .publish(AutopilotEvent::Paused {
                reason: reason.to_string(),
                meta,
            })
            .await;
        Ok(state)
    }

    /// Clear any pause and restart the counting window.
    pub async fn resume(&self, reason: &str) -> Result<PauseState> {
        let now = Utc::now();
        let state = PauseState {
            paused: false,
            reason: None,
            since: None,
            meta: serde_json::Value::Null,
            resumed_at: Some(now),
        };
        self.repo.save_pause(&state)?;
        tracing::warn!(reason, "autopilot resumed");
        self.events
            .publish(AutopilotEvent::Resumed {
                reason: reason.to_string(),
            })
            .await;
        Ok(state)
    }

    /// Low or missing confidence routes to manual review.
    pub fn confidence_gate(&self, confidence: Option<f64>) -> ConfidenceVerdict {
        let Some(raw) = confidence else {
            return ConfidenceVerdict::ManualReview {
                reason: "no confidence reported".to_string(),
            };
        };
        let debiased = debias_confidence(raw, self.baseline);
        if debiased >= self.thresholds.min_confidence {
            ConfidenceVerdict::AutoApply
        } else {
            ConfidenceVerdict::ManualReview {
                reason: format!(
                    "confidence {debiased:.3} below {:.3}",
                    self.thresholds.min_confidence
                ),
            }
        }
    }
}
