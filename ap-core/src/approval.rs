//! Review surface: approve, reject and apply decisions by hash.

use crate::breaker::{Breaker, OutcomeKind};
use crate::decision::{Decision, DecisionStatus};
use crate::error::{AutopilotError, Result};
use crate::events::{AutopilotEvent, EventBus};
use crate::guard::GuardState;
use crate::queue::{NewTask, TaskQueue};
use crate::store::DecisionRepository;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Operator(String),
    Autopilot,
}

impl Actor {
    pub fn operator(name: impl Into<String>) -> Self {
        Self::Operator(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Operator(name) => name,
            Self::Autopilot => "autopilot",
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Who may act on decisions. An empty operator list admits any named
/// operator; the autopilot itself is always admitted.
#[derive(Debug, Clone, Default)]
pub struct ReviewPolicy {
    operators: Vec<String>,
}

impl ReviewPolicy {
    pub fn new(operators: Vec<String>) -> Self {
        Self { operators }
    }

    pub fn authorize(&self, actor: &Actor) -> Result<()> {
        match actor {
            Actor::Autopilot => Ok(()),
            Actor::Operator(name) if name.trim().is_empty() => Err(AutopilotError::Unauthorized(
                "operator name is empty".to_string(),
            )),
            Actor::Operator(name) => {
                if self.operators.is_empty() || self.operators.iter().any(|o| o == name) {
                    Ok(())
                } else {
                    Err(AutopilotError::Unauthorized(format!(
                        "{name} is not a configured operator"
                    )))
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Changed(Decision),
    /// Already at or past the requested state; nothing was done.
    Unchanged(Decision),
    Enqueued {
        decision: Decision,
        task_id: String,
    },
}

impl TransitionOutcome {
    pub fn decision(&self) -> &Decision {
        match self {
            Self::Changed(d) | Self::Unchanged(d) => d,
            Self::Enqueued { decision, .. } => decision,
        }
    }
}

pub struct ApprovalController {
    decisions: Arc<dyn DecisionRepository>,
    queue: TaskQueue,
    breaker: Arc<Breaker>,
    events: Arc<EventBus>,
    policy: ReviewPolicy,
}

impl ApprovalController {
    pub fn new(
        decisions: Arc<dyn DecisionRepository>,
        queue: TaskQueue,
        breaker: Arc<Breaker>,
        events: Arc<EventBus>,
        policy: ReviewPolicy,
    ) -> Self {
        Self {
            decisions,
            queue,
            breaker,
            events,
            policy,
        }
    }

    fn load(&self, hash: &str) -> Result<Decision> {
        self.decisions
            .get(hash)?
            .ok_or_else(|| AutopilotError::NotFound(format!("decision {hash}")))
    }

    /// `planned → approved`. Anything already past `planned` is left alone.
    #[tracing::instrument(level = "info", skip(self, actor), fields(actor = %actor))]
    pub async fn approve(&self, hash: &str, actor: &Actor) -> Result<TransitionOutcome> {
        self.policy.authorize(actor)?;
        let moved = self.decisions.transition(
            hash,
            &[DecisionStatus::Planned],
            DecisionStatus::Approved,
            Some(actor.name()),
            None,
            Utc::now(),
        )?;
        let Some(decision) = moved else {
            return Ok(TransitionOutcome::Unchanged(self.load(hash)?));
        };
        tracing::info!("decision approved");
        self.events
            .publish(AutopilotEvent::TaskApproved {
                decision_hash: decision.hash.clone(),
                actor: actor.name().to_string(),
            })
            .await;
        Ok(TransitionOutcome::Changed(decision))
    }

    /// `planned → rejected`, terminal. Re-rejecting is a no-op; rejecting an
    /// approved decision is refused.
    #[tracing::instrument(level = "info", skip(self, actor, reason), fields(actor = %actor))]
    pub async fn reject(&self, hash: &str, actor: &Actor, reason: &str) -> Result<TransitionOutcome> {
        self.policy.authorize(actor)?;
        let moved = self.decisions.transition(
            hash,
            &[DecisionStatus::Planned],
            DecisionStatus::Rejected,
            Some(actor.name()),
            Some(reason),
            Utc::now(),
        )?;
        let Some(decision) = moved else {
            let current = self.load(hash)?;
            if current.status.is_terminal() {
                return Ok(TransitionOutcome::Unchanged(current));
            }
            return Err(AutopilotError::InvalidTransition {
                subject: format!("decision {hash}"),
                from: current.status.to_string(),
                to: DecisionStatus::Rejected.to_string(),
            });
        };
        if let Err(e) = self.breaker.record(OutcomeKind::Rejected, Some(hash)) {
            tracing::warn!(error = %e, "failed to record rejection outcome");
        }
        tracing::info!(reason, "decision rejected");
        self.events
            .publish(AutopilotEvent::DecisionRejected {
                decision_hash: decision.hash.clone(),
                actor: actor.name().to_string(),
                reason: reason.to_string(),
            })
            .await;
        Ok(TransitionOutcome::Changed(decision))
    }

    /// Queue the mutation for an approved decision. The task is keyed by the
    /// decision hash, so applying twice never queues two tasks. The status
    /// becomes `applied` only once the task executes.
    #[tracing::instrument(level = "info", skip(self, actor, guard), fields(actor = %actor))]
    pub async fn apply(
        &self,
        hash: &str,
        actor: &Actor,
        guard: &GuardState,
    ) -> Result<TransitionOutcome> {
        self.policy.authorize(actor)?;
        if guard.emergency_stop {
            return Err(AutopilotError::EmergencyStop);
        }
        let decision = self.load(hash)?;
        match decision.status {
            DecisionStatus::Approved | DecisionStatus::Failed => {}
            DecisionStatus::Planned => {
                return Err(AutopilotError::InvalidTransition {
                    subject: format!("decision {hash}"),
                    from: decision.status.to_string(),
                    to: DecisionStatus::Applied.to_string(),
                });
            }
            DecisionStatus::Rejected | DecisionStatus::Applied | DecisionStatus::Dead => {
                return Ok(TransitionOutcome::Unchanged(decision));
            }
        }
        if guard.paused {
            tracing::warn!(
                reason = ?guard.pause_reason,
                "autopilot paused; task queued but will not dispatch until resume"
            );
        }
        let payload = serde_json::to_value(&decision.action)?;
        let task_id = self.queue.enqueue(
            NewTask::new(decision.decision_type.as_str(), payload)
                .with_idempotency_key(decision.hash.clone())
                .for_decision(decision.hash.clone())
                .for_target(decision.target_id.clone()),
        )?;
        tracing::info!(task_id = %task_id, "decision queued for execution");
        Ok(TransitionOutcome::Enqueued { decision, task_id })
    }

    pub fn get(&self, hash: &str) -> Result<Option<Decision>> {
        self.decisions.get(hash)
    }

    pub fn list(&self, status: Option<DecisionStatus>, limit: usize) -> Result<Vec<Decision>> {
        self.decisions.list(status, limit)
    }
}
