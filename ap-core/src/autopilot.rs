use crate::approval::{Actor, ApprovalController};
use crate::breaker::{Breaker, ConfidenceVerdict};
use crate::error::Result;
use crate::events::{AutopilotEvent, EventListener};
use async_trait::async_trait;
use std::sync::Arc;

/// Promotes auto-eligible decisions without a human: approve, then apply.
///
/// Only acts when the decision is flagged `auto`, the guard allows
/// auto-application and the confidence gate passes. Everything else stays
/// `planned` for review.
pub struct AutopilotListener {
    approvals: Arc<ApprovalController>,
    breaker: Arc<Breaker>,
}

impl AutopilotListener {
    pub fn new(approvals: Arc<ApprovalController>, breaker: Arc<Breaker>) -> Self {
        Self { approvals, breaker }
    }
}

#[async_trait]
impl EventListener for AutopilotListener {
    fn name(&self) -> &str {
        "autopilot"
    }

    async fn on_event(&self, event: &AutopilotEvent) -> Result<()> {
        let AutopilotEvent::DecisionProduced { decision, guard } = event else {
            return Ok(());
        };
        if !decision.auto {
            return Ok(());
        }
        // The pause may have tripped since the pipeline read its guard.
        let guard = self.breaker.guard(guard.clone())?;
        if !guard.allows_auto_apply() {
            tracing::info!(
                hash = %decision.hash,
                safe_mode = guard.safe_mode,
                paused = guard.paused,
                "auto-apply blocked by guard; left for review"
            );
            return Ok(());
        }
        if let ConfidenceVerdict::ManualReview { reason } =
            self.breaker.confidence_gate(decision.confidence)
        {
            tracing::info!(hash = %decision.hash, reason, "routed to manual review");
            return Ok(());
        }

        self.approvals.approve(&decision.hash, &Actor::Autopilot).await?;
        self.approvals
            .apply(&decision.hash, &Actor::Autopilot, &guard)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Analysis;
    use crate::approval::ReviewPolicy;
    use crate::breaker::Thresholds;
    use crate::decision::DecisionStatus;
    use crate::events::EventBus;
    use crate::generator::DecisionGenerator;
    use crate::guard::GuardState;
    use crate::pipeline::DecisionPipeline;
    use crate::queue::{RetryPolicy, TaskQueue};
    use crate::store::SqliteStore;

    struct Wired {
        pipeline: DecisionPipeline,
        queue: TaskQueue,
        breaker: Arc<Breaker>,
    }

    fn wired() -> Wired {
        let store = SqliteStore::open_in_memory().expect("open store");
        let bus = Arc::new(EventBus::new());
        let queue = TaskQueue::new(Arc::new(store.clone()), RetryPolicy::default());
        let breaker = Arc::new(Breaker::new(
            Arc::new(store.clone()),
            bus.clone(),
            Thresholds::default(),
        ));
        let approvals = Arc::new(ApprovalController::new(
            Arc::new(store.clone()),
            queue.clone(),
            breaker.clone(),
            bus.clone(),
            ReviewPolicy::default(),
        ));
        bus.subscribe(Arc::new(AutopilotListener::new(approvals, breaker.clone())));
        let pipeline =
            DecisionPipeline::new(DecisionGenerator::default(), Arc::new(store), bus);
        Wired {
            pipeline,
            queue,
            breaker,
        }
    }

    fn analysis(confidence: Option<f64>) -> Analysis {
        let mut a = Analysis::new("home");
        a.confidence = confidence;
        a.recommendations.schema_types = vec!["Article".to_string(), "Product".to_string()];
        a
    }

    #[tokio::test]
    async fn confident_allow_listed_decision_is_queued() {
        let w = wired();
        let out = w
            .pipeline
            .run(&analysis(Some(0.95)), &GuardState::running())
            .await
            .expect("run");
        assert_eq!(out.len(), 2);
        let tasks = w.queue.list(None, 10).expect("list");
        assert_eq!(tasks.len(), 1, "only the allow-listed schema is auto-applied");
        assert_eq!(tasks[0].payload["schema_type"], "Article");
    }

    #[tokio::test]
    async fn low_confidence_and_safe_mode_stay_planned() {
        let w = wired();
        w.pipeline
            .run(&analysis(Some(0.4)), &GuardState::running())
            .await
            .expect("run");
        assert!(w.queue.list(None, 10).expect("list").is_empty());

        let w = wired();
        let out = w
            .pipeline
            .run(&analysis(Some(0.99)), &GuardState::running().with_safe_mode(true))
            .await
            .expect("run");
        assert!(out.iter().all(|d| d.status == DecisionStatus::Planned));
        assert!(w.queue.list(None, 10).expect("list").is_empty());
    }

    #[tokio::test]
    async fn persisted_pause_blocks_auto_apply() {
        let w = wired();
        w.breaker
            .pause("manual", serde_json::Value::Null)
            .await
            .expect("pause");
        w.pipeline
            .run(&analysis(Some(0.99)), &GuardState::running())
            .await
            .expect("run");
        assert!(w.queue.list(None, 10).expect("list").is_empty());
    }
}
