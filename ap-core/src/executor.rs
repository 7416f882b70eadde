//! Runs claimed tasks: snapshot, dispatch, then settle queue, decision and
//! breaker state from the result.

use crate::breaker::{Breaker, OutcomeKind};
use crate::decision::DecisionStatus;
use crate::error::Result;
use crate::events::{AutopilotEvent, EventBus};
use crate::guard::GuardState;
use crate::queue::{FailOutcome, Task, TaskQueue};
use crate::snapshot::SnapshotService;
use crate::store::DecisionRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchError {
    pub message: String,
    /// False when a retry cannot help (bad payload, unknown action).
    pub retryable: bool,
}

impl DispatchError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Routes a task to whatever performs its side effect.
#[async_trait]
pub trait ActionDispatch: Send + Sync {
    /// Whether the named action writes to its target (and so needs a
    /// snapshot first).
    fn mutates(&self, action_name: &str) -> bool;

    async fn dispatch(
        &self,
        task: &Task,
        guard: &GuardState,
    ) -> std::result::Result<serde_json::Value, DispatchError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionReport {
    Executed {
        task_id: String,
        snapshot_id: Option<String>,
        output: serde_json::Value,
    },
    Retrying {
        task_id: String,
        attempts: u32,
        available_at: DateTime<Utc>,
        error: String,
    },
    Dead {
        task_id: String,
        attempts: u32,
        error: String,
    },
}

impl ExecutionReport {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Executed { task_id, .. }
            | Self::Retrying { task_id, .. }
            | Self::Dead { task_id, .. } => task_id,
        }
    }
}

pub struct TaskExecutor {
    queue: TaskQueue,
    decisions: Arc<dyn DecisionRepository>,
    snapshots: SnapshotService,
    breaker: Arc<Breaker>,
    events: Arc<EventBus>,
    dispatcher: Arc<dyn ActionDispatch>,
    timeout: Duration,
}

impl TaskExecutor {
    pub fn new(
        queue: TaskQueue,
        decisions: Arc<dyn DecisionRepository>,
        snapshots: SnapshotService,
        breaker: Arc<Breaker>,
        events: Arc<EventBus>,
        dispatcher: Arc<dyn ActionDispatch>,
    ) -> Self {
        Self {
            queue,
            decisions,
            snapshots,
            breaker,
            events,
            dispatcher,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Claim up to `limit` due tasks and run them concurrently. Nothing is
    /// claimed while the guard blocks dispatch.
    pub async fn run_batch(&self, guard: &GuardState, limit: usize) -> Result<Vec<ExecutionReport>> {
        if !guard.allows_dispatch() {
            tracing::debug!(
                emergency_stop = guard.emergency_stop,
                paused = guard.paused,
                "dispatch blocked by guard"
            );
            return Ok(Vec::new());
        }
        let tasks = self.queue.claim_next(limit)?;
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let results =
            futures_util::future::join_all(tasks.into_iter().map(|t| self.execute(t, guard))).await;
        let mut reports = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!(error = %e, "task execution could not be recorded"),
            }
        }
        Ok(reports)
    }

    /// Execute one claimed (running) task.
    #[tracing::instrument(level = "info", skip_all, fields(task_id = %task.id, action = %task.action_name))]
    pub async fn execute(&self, task: Task, guard: &GuardState) -> Result<ExecutionReport> {
        let snapshot_id = self.snapshot_before(&task);

        let result = match tokio::time::timeout(self.timeout, self.dispatcher.dispatch(&task, guard))
            .await
        {
            Ok(r) => r,
            Err(_) => Err(DispatchError::retryable(format!(
                "timed out after {:?}",
                self.timeout
            ))),
        };

        let report = match result {
            Ok(output) => {
                self.queue.complete(&task.id)?;
                self.settle_decision(&task, DecisionStatus::Applied);
                self.record(OutcomeKind::Applied, &task.id);
                self.events
                    .publish(AutopilotEvent::TaskApplied {
                        task_id: task.id.clone(),
                        decision_hash: task.decision_hash.clone(),
                        snapshot_id: snapshot_id.clone(),
                    })
                    .await;
                ExecutionReport::Executed {
                    task_id: task.id.clone(),
                    snapshot_id,
                    output,
                }
            }
            Err(err) => {
                let outcome = if err.retryable {
                    self.queue.fail(&task.id, &err.message)?
                } else {
                    self.queue.fail_permanently(&task.id, &err.message)?
                };
                self.record(OutcomeKind::Failed, &task.id);
                match outcome {
                    FailOutcome::Retrying {
                        attempts,
                        available_at,
                    } => {
                        self.settle_decision(&task, DecisionStatus::Failed);
                        ExecutionReport::Retrying {
                            task_id: task.id.clone(),
                            attempts,
                            available_at,
                            error: err.message,
                        }
                    }
                    FailOutcome::Dead { attempts } => {
                        self.settle_decision(&task, DecisionStatus::Dead);
                        self.events
                            .publish(AutopilotEvent::TaskDead {
                                task_id: task.id.clone(),
                                decision_hash: task.decision_hash.clone(),
                                error: err.message.clone(),
                            })
                            .await;
                        ExecutionReport::Dead {
                            task_id: task.id.clone(),
                            attempts,
                            error: err.message,
                        }
                    }
                }
            }
        };

        if let Err(e) = self.breaker.evaluate().await {
            tracing::warn!(error = %e, "breaker evaluation failed");
        }
        Ok(report)
    }

    fn snapshot_before(&self, task: &Task) -> Option<String> {
        if !self.dispatcher.mutates(&task.action_name) {
            return None;
        }
        let target_id = task.target_id.as_deref()?;
        let snapshot_id = self
            .snapshots
            .try_capture(target_id, &format!("pre:{}", task.action_name))?;
        if let Err(e) = self.queue.attach_snapshot(&task.id, &snapshot_id) {
            tracing::warn!(error = %e, "failed to link snapshot to task");
        }
        Some(snapshot_id)
    }

    fn settle_decision(&self, task: &Task, to: DecisionStatus) {
        let Some(hash) = task.decision_hash.as_deref() else {
            return;
        };
        let from = [DecisionStatus::Approved, DecisionStatus::Failed];
        match self
            .decisions
            .transition(hash, &from, to, None, None, Utc::now())
        {
            Ok(Some(_)) => tracing::debug!(hash, status = to.as_str(), "decision settled"),
            Ok(None) => tracing::debug!(hash, status = to.as_str(), "decision not in an applicable state"),
            Err(e) => tracing::warn!(hash, error = %e, "failed to update decision status"),
        }
    }

    fn record(&self, kind: OutcomeKind, task_id: &str) {
        if let Err(e) = self.breaker.record(kind, Some(task_id)) {
            tracing::warn!(task_id, error = %e, "failed to record task outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{Actor, ApprovalController, ReviewPolicy, TransitionOutcome};
    use crate::breaker::Thresholds;
    use crate::decision::{Decision, DecisionAction, Priority, ProposedDecision};
    use crate::queue::{NewTask, RetryPolicy, TaskStatus};
    use crate::store::SqliteStore;
    use crate::target::{MemoryTargetStore, TargetStore};
    use serde_json::json;
    use std::sync::Mutex;

    /// Writes "mutated" to the target after `delay`; fails while
    /// `failures` > 0.
    struct Scripted {
        targets: Arc<MemoryTargetStore>,
        failures: Mutex<u32>,
        permanent: bool,
        delay: Duration,
    }

    #[async_trait]
    impl ActionDispatch for Scripted {
        fn mutates(&self, _action_name: &str) -> bool {
            true
        }

        async fn dispatch(
            &self,
            task: &Task,
            _guard: &GuardState,
        ) -> std::result::Result<serde_json::Value, DispatchError> {
            {
                let mut left = self.failures.lock().expect("lock");
                if *left > 0 {
                    *left -= 1;
                    return Err(DispatchError {
                        message: "scripted failure".to_string(),
                        retryable: !self.permanent,
                    });
                }
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let target = task.target_id.clone().unwrap_or_default();
            self.targets
                .write(&target, "mutated")
                .map_err(|e| DispatchError::retryable(e.to_string()))?;
            Ok(json!({ "ok": true }))
        }
    }

    /// Settles tasks on "taken" itself, so the executor's own bookkeeping
    /// for them fails.
    struct SettlesBehindExecutor {
        queue: TaskQueue,
    }

    #[async_trait]
    impl ActionDispatch for SettlesBehindExecutor {
        fn mutates(&self, _action_name: &str) -> bool {
            false
        }

        async fn dispatch(
            &self,
            task: &Task,
            _guard: &GuardState,
        ) -> std::result::Result<serde_json::Value, DispatchError> {
            if task.target_id.as_deref() == Some("taken") {
                self.queue
                    .complete(&task.id)
                    .map_err(|e| DispatchError::retryable(e.to_string()))?;
            }
            Ok(json!({ "ok": true }))
        }
    }

    struct Harness {
        store: SqliteStore,
        queue: TaskQueue,
        targets: Arc<MemoryTargetStore>,
        breaker: Arc<Breaker>,
        executor: TaskExecutor,
        approvals: ApprovalController,
    }

    fn harness(failures: u32, permanent: bool, max_attempts: u32) -> Harness {
        build_harness(max_attempts, Duration::from_secs(120), |targets, _| {
            Arc::new(Scripted {
                targets,
                failures: Mutex::new(failures),
                permanent,
                delay: Duration::ZERO,
            }) as Arc<dyn ActionDispatch>
        })
    }

    fn build_harness(
        max_attempts: u32,
        timeout: Duration,
        dispatcher: impl FnOnce(Arc<MemoryTargetStore>, TaskQueue) -> Arc<dyn ActionDispatch>,
    ) -> Harness {
        let store = SqliteStore::open_in_memory().expect("open store");
        let bus = Arc::new(EventBus::new());
        let targets = Arc::new(MemoryTargetStore::new());
        let queue = TaskQueue::new(
            Arc::new(store.clone()),
            RetryPolicy::new(max_attempts, 0, 0),
        );
        let breaker = Arc::new(Breaker::new(
            Arc::new(store.clone()),
            bus.clone(),
            Thresholds::default(),
        ));
        let snapshots = SnapshotService::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            targets.clone(),
            bus.clone(),
        );
        let dispatcher = dispatcher(targets.clone(), queue.clone());
        let executor = TaskExecutor::new(
            queue.clone(),
            Arc::new(store.clone()),
            snapshots,
            breaker.clone(),
            bus.clone(),
            dispatcher,
        )
        .with_timeout(timeout);
        let approvals = ApprovalController::new(
            Arc::new(store.clone()),
            queue.clone(),
            breaker.clone(),
            bus,
            ReviewPolicy::default(),
        );
        Harness {
            store,
            queue,
            targets,
            breaker,
            executor,
            approvals,
        }
    }

    async fn approved_task(h: &Harness) -> (String, String) {
        let d = Decision::planned(
            ProposedDecision {
                target_id: "home".to_string(),
                action: DecisionAction::AddSchema {
                    schema_type: "Article".to_string(),
                },
                priority: Priority::Medium,
                auto: true,
                source: "ai:schema_gap".to_string(),
                confidence: Some(0.9),
            },
            Utc::now(),
        )
        .expect("decision");
        h.store.insert_if_absent(&d).expect("insert");
        let ops = Actor::operator("ops");
        h.approvals.approve(&d.hash, &ops).await.expect("approve");
        let TransitionOutcome::Enqueued { task_id, .. } = h
            .approvals
            .apply(&d.hash, &ops, &GuardState::running())
            .await
            .expect("apply")
        else {
            panic!("expected enqueue");
        };
        (d.hash, task_id)
    }

    #[tokio::test]
    async fn success_snapshots_first_and_marks_applied() {
        let h = harness(0, false, 3);
        h.targets.write("home", "original").expect("seed target");
        let (hash, task_id) = approved_task(&h).await;

        let reports = h
            .executor
            .run_batch(&GuardState::running(), 4)
            .await
            .expect("run batch");
        assert_eq!(reports.len(), 1);
        let ExecutionReport::Executed { snapshot_id, .. } = &reports[0] else {
            panic!("expected executed, got {:?}", reports[0]);
        };
        let snapshot_id = snapshot_id.clone().expect("snapshot taken");

        let task = h.queue.get(&task_id).expect("get").expect("task");
        assert_eq!(task.status, TaskStatus::Executed);
        assert_eq!(task.snapshot_id.as_deref(), Some(snapshot_id.as_str()));
        let decision = h.store.get(&hash).expect("get").expect("decision");
        assert_eq!(decision.status, DecisionStatus::Applied);
        assert_eq!(h.breaker.health(7).expect("health").applied, 1);
        assert_eq!(
            h.targets.read("home").expect("read").as_deref(),
            Some("mutated")
        );
    }

    #[tokio::test]
    async fn retryable_failure_requeues_then_dead_letters() {
        let h = harness(5, false, 2);
        let (hash, task_id) = approved_task(&h).await;
        let guard = GuardState::running();

        let first = h.executor.run_batch(&guard, 1).await.expect("first");
        assert!(matches!(first[0], ExecutionReport::Retrying { attempts: 1, .. }));
        assert_eq!(
            h.store.get(&hash).expect("get").expect("decision").status,
            DecisionStatus::Failed
        );

        let second = h.executor.run_batch(&guard, 1).await.expect("second");
        assert!(matches!(second[0], ExecutionReport::Dead { attempts: 2, .. }));
        assert_eq!(
            h.queue.get(&task_id).expect("get").expect("task").status,
            TaskStatus::Dead
        );
        assert_eq!(
            h.store.get(&hash).expect("get").expect("decision").status,
            DecisionStatus::Dead
        );
        assert_eq!(h.breaker.health(7).expect("health").failed, 2);
    }

    #[tokio::test]
    async fn slow_dispatch_times_out_as_retryable_failure() {
        let h = build_harness(3, Duration::from_millis(20), |targets, _| {
            Arc::new(Scripted {
                targets,
                failures: Mutex::new(0),
                permanent: false,
                delay: Duration::from_millis(500),
            }) as Arc<dyn ActionDispatch>
        });
        h.targets.write("home", "original").expect("seed target");
        let (hash, task_id) = approved_task(&h).await;

        let reports = h
            .executor
            .run_batch(&GuardState::running(), 1)
            .await
            .expect("run");
        let ExecutionReport::Retrying {
            attempts, error, ..
        } = &reports[0]
        else {
            panic!("expected retry, got {:?}", reports[0]);
        };
        assert_eq!(*attempts, 1);
        assert!(error.contains("timed out"), "{error}");
        assert_eq!(
            h.queue.get(&task_id).expect("get").expect("task").status,
            TaskStatus::Pending
        );
        assert_eq!(
            h.store.get(&hash).expect("get").expect("decision").status,
            DecisionStatus::Failed
        );
        assert_eq!(h.breaker.health(7).expect("health").failed, 1);
        assert_eq!(
            h.targets.read("home").expect("read").as_deref(),
            Some("original")
        );
    }

    #[tokio::test]
    async fn one_unrecordable_task_keeps_the_other_reports() {
        let h = build_harness(3, Duration::from_secs(5), |_, queue| {
            Arc::new(SettlesBehindExecutor { queue }) as Arc<dyn ActionDispatch>
        });
        let taken = h
            .queue
            .enqueue(NewTask::new("add_schema", json!({})).for_target("taken"))
            .expect("enqueue taken");
        let normal = h
            .queue
            .enqueue(NewTask::new("add_schema", json!({})).for_target("home"))
            .expect("enqueue normal");

        let reports = h
            .executor
            .run_batch(&GuardState::running(), 4)
            .await
            .expect("batch survives a bookkeeping error");
        assert_eq!(reports.len(), 1);
        let ExecutionReport::Executed { task_id, .. } = &reports[0] else {
            panic!("expected executed, got {:?}", reports[0]);
        };
        assert_eq!(task_id, &normal);
        assert_eq!(
            h.queue.get(&taken).expect("get").expect("task").status,
            TaskStatus::Executed
        );
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let h = harness(1, true, 5);
        let (_, task_id) = approved_task(&h).await;
        let reports = h
            .executor
            .run_batch(&GuardState::running(), 1)
            .await
            .expect("run");
        assert!(matches!(reports[0], ExecutionReport::Dead { attempts: 1, .. }));
        assert_eq!(
            h.queue.get(&task_id).expect("get").expect("task").status,
            TaskStatus::Dead
        );
    }

    #[tokio::test]
    async fn paused_guard_claims_nothing() {
        let h = harness(0, false, 3);
        let task_id = h
            .queue
            .enqueue(NewTask::new("add_schema", json!({})).for_target("home"))
            .expect("enqueue");
        let paused = GuardState::running().with_pause(Some("manual".to_string()));
        assert!(h.executor.run_batch(&paused, 4).await.expect("run").is_empty());
        assert_eq!(
            h.queue.get(&task_id).expect("get").expect("task").status,
            TaskStatus::Pending
        );
    }
}
