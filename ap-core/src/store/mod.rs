//! Durable records behind the engine.
//!
//! Each concern is a small repository trait so services can be handed just
//! the slice they need. [`SqliteStore`] implements all of them.

mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use crate::breaker::{OutcomeKind, PauseState};
use crate::decision::{Decision, DecisionStatus};
use crate::error::Result;
use crate::queue::{FailOutcome, RetryPolicy, Task, TaskStatus};
use crate::snapshot::Snapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub trait CreditRepository: Send + Sync {
    /// Zero for a scope never seen.
    fn balance(&self, scope: &str) -> Result<i64>;
    /// Decrement iff the balance covers `amount`, as one conditional write.
    fn try_consume(&self, scope: &str, amount: i64) -> Result<bool>;
    /// Increment and return the new balance.
    fn credit(&self, scope: &str, amount: i64) -> Result<i64>;
    /// Create the scope with `amount`; false when it already exists.
    fn seed(&self, scope: &str, amount: i64) -> Result<bool>;
}

pub trait DecisionRepository: Send + Sync {
    /// Insert unless a record with the same hash exists. Returns the stored
    /// record and whether this call created it.
    fn insert_if_absent(&self, decision: &Decision) -> Result<(Decision, bool)>;
    fn get(&self, hash: &str) -> Result<Option<Decision>>;
    /// Move to `to` iff the current status is one of `from`. `None` when the
    /// guard did not match (or the record is missing).
    fn transition(
        &self,
        hash: &str,
        from: &[DecisionStatus],
        to: DecisionStatus,
        actor: Option<&str>,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<Decision>>;
    fn list(&self, status: Option<DecisionStatus>, limit: usize) -> Result<Vec<Decision>>;
}

pub trait TaskRepository: Send + Sync {
    /// Insert `task`, or return the id of the pending/running task that
    /// already holds the same idempotency key. The flag is true on insert.
    fn insert_or_get(&self, task: &Task) -> Result<(String, bool)>;
    fn get(&self, id: &str) -> Result<Option<Task>>;
    /// Atomically move up to `limit` due pending tasks to running.
    fn claim_due(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Task>>;
    fn complete(&self, id: &str, now: DateTime<Utc>) -> Result<Task>;
    /// Record a failed attempt on a running task.
    fn fail(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
        permanent: bool,
    ) -> Result<FailOutcome>;
    fn reschedule_now(&self, id: &str, now: DateTime<Utc>) -> Result<Task>;
    fn set_snapshot(&self, id: &str, snapshot_id: &str) -> Result<()>;
    fn stale_running(&self, older_than: DateTime<Utc>) -> Result<Vec<Task>>;
    fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>>;
}

pub trait SnapshotRepository: Send + Sync {
    fn insert(&self, snapshot: &Snapshot) -> Result<()>;
    fn get(&self, id: &str) -> Result<Option<Snapshot>>;
    /// Newest snapshot of `target_id` created at or before `at`.
    fn latest_before(&self, target_id: &str, at: DateTime<Utc>) -> Result<Option<Snapshot>>;
    /// Newest first.
    fn list_for_target(&self, target_id: &str) -> Result<Vec<Snapshot>>;
    fn delete(&self, ids: &[String]) -> Result<usize>;
    fn distinct_targets(&self) -> Result<Vec<String>>;
    fn record_rollback(&self, snapshot_id: &str, target_id: &str, at: DateTime<Utc>)
    -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub applied: u64,
    pub failed: u64,
    pub rejected: u64,
}

pub trait ReliabilityRepository: Send + Sync {
    fn record_outcome(
        &self,
        kind: OutcomeKind,
        subject: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()>;
    fn count_outcomes(&self, since: DateTime<Utc>) -> Result<OutcomeCounts>;
    fn load_pause(&self) -> Result<Option<PauseState>>;
    fn save_pause(&self, state: &PauseState) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub event: String,
    pub subject: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

pub trait AuditRepository: Send + Sync {
    fn append(
        &self,
        event: &str,
        subject: &str,
        payload: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<()>;
    /// Newest first.
    fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>>;
}
