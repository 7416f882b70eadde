//! Durable at-least-once work queue.
//!
//! `pending → running → executed | pending (retry) | dead`. A retry is a
//! pending row with a later `available_at` and a higher `attempts`. The only
//! synchronization point is the claim, which flips `pending → running`
//! under a write transaction so no two workers hold the same row.

use crate::error::{AutopilotError, Result};
use crate::store::TaskRepository;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Executed,
    Dead,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Executed => "executed",
            Self::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Executed | Self::Dead)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = AutopilotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "executed" => Ok(Self::Executed),
            "dead" => Ok(Self::Dead),
            other => Err(AutopilotError::Storage(format!("unknown task status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub action_name: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub idempotency_key: Option<String>,
    pub decision_hash: Option<String>,
    pub target_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Enqueue request.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub action_name: String,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub decision_hash: Option<String>,
    pub target_id: Option<String>,
    pub max_attempts: Option<u32>,
    pub delay: Option<Duration>,
}

impl NewTask {
    pub fn new(action_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            action_name: action_name.into(),
            payload,
            idempotency_key: None,
            decision_hash: None,
            target_id: None,
            max_attempts: None,
            delay: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn for_decision(mut self, hash: impl Into<String>) -> Self {
        self.decision_hash = Some(hash.into());
        self
    }

    pub fn for_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::seconds(30),
            max: Duration::hours(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_seconds: u64, max_seconds: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base: Duration::seconds(base_seconds as i64),
            max: Duration::seconds(max_seconds.max(base_seconds) as i64),
            ..Self::default()
        }
    }

    /// Delay before the next try after `attempts` failures:
    /// `min(base * multiplier^(attempts-1), max)`. Non-decreasing in `attempts`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(63) as i32;
        let secs = self.base.num_seconds() as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = secs.min(self.max.num_seconds() as f64);
        Duration::seconds(capped as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying {
        attempts: u32,
        available_at: DateTime<Utc>,
    },
    Dead {
        attempts: u32,
    },
}

#[derive(Clone)]
pub struct TaskQueue {
    repo: Arc<dyn TaskRepository>,
    policy: RetryPolicy,
}

impl TaskQueue {
    pub fn new(repo: Arc<dyn TaskRepository>, policy: RetryPolicy) -> Self {
        Self { repo, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn enqueue(&self, task: NewTask) -> Result<String> {
        self.enqueue_at(task, Utc::now())
    }

    /// Returns the id of the existing pending/running task when the
    /// idempotency key is already in flight.
    pub fn enqueue_at(&self, task: NewTask, now: DateTime<Utc>) -> Result<String> {
        let row = Task {
            id: uuid::Uuid::new_v4().to_string(),
            action_name: task.action_name,
            payload: task.payload,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: task
                .max_attempts
                .unwrap_or(self.policy.max_attempts)
                .max(1),
            available_at: now + task.delay.unwrap_or_else(Duration::zero),
            last_error: None,
            idempotency_key: task.idempotency_key,
            decision_hash: task.decision_hash,
            target_id: task.target_id,
            snapshot_id: None,
            created_at: now,
            updated_at: now,
        };
        let (id, created) = self.repo.insert_or_get(&row)?;
        if created {
            tracing::info!(task_id = %id, action = %row.action_name, "task enqueued");
        } else {
            tracing::debug!(
                task_id = %id,
                idempotency_key = ?row.idempotency_key,
                "enqueue deduplicated"
            );
        }
        Ok(id)
    }

    pub fn claim_next(&self, limit: usize) -> Result<Vec<Task>> {
        self.claim_next_at(limit, Utc::now())
    }

    pub fn claim_next_at(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Task>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let claimed = self.repo.claim_due(limit, now)?;
        if !claimed.is_empty() {
            tracing::debug!(count = claimed.len(), "claimed tasks");
        }
        Ok(claimed)
    }

    pub fn complete(&self, task_id: &str) -> Result<Task> {
        let task = self.repo.complete(task_id, Utc::now())?;
        tracing::info!(task_id, attempts = task.attempts, "task executed");
        Ok(task)
    }

    pub fn fail(&self, task_id: &str, error: &str) -> Result<FailOutcome> {
        self.fail_at(task_id, error, Utc::now(), false)
    }

    /// Skip remaining retries; used for errors a retry cannot fix.
    pub fn fail_permanently(&self, task_id: &str, error: &str) -> Result<FailOutcome> {
        self.fail_at(task_id, error, Utc::now(), true)
    }

    pub fn fail_at(
        &self,
        task_id: &str,
        error: &str,
        now: DateTime<Utc>,
        permanent: bool,
    ) -> Result<FailOutcome> {
        let outcome = self.repo.fail(task_id, error, now, &self.policy, permanent)?;
        match outcome {
            FailOutcome::Retrying {
                attempts,
                available_at,
            } => tracing::warn!(task_id, attempts, %available_at, error, "task failed; retry scheduled"),
            FailOutcome::Dead { attempts } => {
                tracing::error!(task_id, attempts, error, "task moved to dead-letter")
            }
        }
        Ok(outcome)
    }

    /// Operator override: make a pending task due now regardless of backoff.
    pub fn retry_now(&self, task_id: &str) -> Result<Task> {
        let task = self.repo.reschedule_now(task_id, Utc::now())?;
        tracing::info!(task_id, attempts = task.attempts, "task rescheduled by operator");
        Ok(task)
    }

    /// Count `running` rows idle longer than `max_age` as failed attempts so
    /// a crashed worker never strands a task. Returns how many were recovered.
    pub fn recover_stale(&self, max_age: Duration) -> Result<usize> {
        let now = Utc::now();
        let stale = self.repo.stale_running(now - max_age)?;
        let mut recovered = 0;
        for task in stale {
            match self.fail_at(&task.id, "lease expired", now, false) {
                Ok(_) => recovered += 1,
                // Finished between the scan and the update.
                Err(AutopilotError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if recovered > 0 {
            tracing::warn!(recovered, "recovered stale running tasks");
        }
        Ok(recovered)
    }

    pub fn dead_letters(&self, limit: usize) -> Result<Vec<Task>> {
        self.repo.list(Some(TaskStatus::Dead), limit)
    }

    pub fn get(&self, task_id: &str) -> Result<Option<Task>> {
        self.repo.get(task_id)
    }

    pub fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        self.repo.list(status, limit)
    }

    pub fn attach_snapshot(&self, task_id: &str, snapshot_id: &str) -> Result<()> {
        self.repo.set_snapshot(task_id, snapshot_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use serde_json::json;
    use std::collections::HashSet;

    fn queue(max_attempts: u32) -> TaskQueue {
        let store = SqliteStore::open_in_memory().expect("open store");
        TaskQueue::new(Arc::new(store), RetryPolicy::new(max_attempts, 30, 3600))
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::new(10, 30, 100);
        assert_eq!(policy.backoff(1), Duration::seconds(30));
        assert_eq!(policy.backoff(2), Duration::seconds(60));
        assert_eq!(policy.backoff(3), Duration::seconds(100));
        assert_eq!(policy.backoff(40), Duration::seconds(100));
        let mut last = Duration::zero();
        for n in 1..20 {
            assert!(policy.backoff(n) >= last);
            last = policy.backoff(n);
        }
    }

    #[test]
    fn idempotency_key_dedupes_only_in_flight_tasks() {
        let q = queue(3);
        let a = q
            .enqueue(NewTask::new("add_schema", json!({})).with_idempotency_key("h1"))
            .expect("enqueue");
        let b = q
            .enqueue(NewTask::new("add_schema", json!({})).with_idempotency_key("h1"))
            .expect("enqueue again");
        assert_eq!(a, b);

        let claimed = q.claim_next(1).expect("claim");
        assert_eq!(claimed[0].id, a);
        q.complete(&a).expect("complete");

        let c = q
            .enqueue(NewTask::new("add_schema", json!({})).with_idempotency_key("h1"))
            .expect("enqueue after completion");
        assert_ne!(a, c);
    }

    #[test]
    fn failures_back_off_then_dead_letter() {
        let q = queue(3);
        let now = Utc::now();
        let id = q
            .enqueue_at(NewTask::new("add_section", json!({})), now)
            .expect("enqueue");

        q.claim_next_at(1, now).expect("claim 1");
        let first = q.fail_at(&id, "boom", now, false).expect("fail 1");
        let FailOutcome::Retrying { attempts, available_at } = first else {
            panic!("expected retry, got {first:?}");
        };
        assert_eq!(attempts, 1);
        assert_eq!(available_at, now + Duration::seconds(30));

        assert!(q.claim_next_at(1, now).expect("not yet due").is_empty());

        let later = available_at;
        q.claim_next_at(1, later).expect("claim 2");
        q.fail_at(&id, "boom", later, false).expect("fail 2");

        let later = later + Duration::hours(2);
        q.claim_next_at(1, later).expect("claim 3");
        let last = q.fail_at(&id, "boom", later, false).expect("fail 3");
        assert_eq!(last, FailOutcome::Dead { attempts: 3 });

        let task = q.get(&id).expect("get").expect("exists");
        assert_eq!(task.status, TaskStatus::Dead);
        assert_eq!(task.last_error.as_deref(), Some("boom"));
        assert!(q.claim_next_at(1, later + Duration::days(1)).expect("claim").is_empty());
        assert_eq!(q.dead_letters(10).expect("dead letters").len(), 1);
    }

    #[test]
    fn terminal_states_are_exclusive() {
        let q = queue(3);
        let id = q.enqueue(NewTask::new("x", json!({}))).expect("enqueue");
        q.claim_next(1).expect("claim");
        q.complete(&id).expect("complete");
        assert!(matches!(
            q.fail(&id, "late"),
            Err(AutopilotError::InvalidTransition { .. })
        ));
        assert!(matches!(
            q.complete(&id),
            Err(AutopilotError::InvalidTransition { .. })
        ));
        assert_eq!(
            q.get(&id).expect("get").expect("exists").status,
            TaskStatus::Executed
        );
    }

    #[test]
    fn retry_now_skips_backoff_but_not_dead() {
        let q = queue(5);
        let id = q.enqueue(NewTask::new("x", json!({}))).expect("enqueue");
        q.claim_next(1).expect("claim");
        q.fail(&id, "transient").expect("fail");
        assert!(q.claim_next(1).expect("backing off").is_empty());

        q.retry_now(&id).expect("retry now");
        let claimed = q.claim_next(1).expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);

        q.fail_permanently(&id, "fatal").expect("fail permanently");
        assert!(matches!(
            q.retry_now(&id),
            Err(AutopilotError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn concurrent_claims_never_share_a_task() {
        let q = queue(3);
        for i in 0..40 {
            q.enqueue(NewTask::new("x", json!({ "i": i }))).expect("enqueue");
        }
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let q = q.clone();
                std::thread::spawn(move || {
                    let mut ids = Vec::new();
                    loop {
                        let batch = q.claim_next(3).expect("claim");
                        if batch.is_empty() {
                            break;
                        }
                        ids.extend(batch.into_iter().map(|t| t.id));
                    }
                    ids
                })
            })
            .collect();
        let all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("join worker"))
            .collect();
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 40);
        assert_eq!(unique.len(), 40);
    }

    #[test]
    fn stale_running_tasks_are_recovered_as_failures() {
        let q = queue(3);
        let id = q.enqueue(NewTask::new("x", json!({}))).expect("enqueue");
        q.claim_next(1).expect("claim");
        assert_eq!(q.recover_stale(Duration::minutes(10)).expect("fresh lease"), 0);
        assert_eq!(q.recover_stale(Duration::seconds(-1)).expect("expired lease"), 1);
        let task = q.get(&id).expect("get").expect("exists");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.last_error.as_deref(), Some("lease expired"));
    }
}
