//! Pre-mutation capture and rollback.

use crate::error::{AutopilotError, Result};
use crate::events::{AutopilotEvent, EventBus};
use crate::store::{SnapshotRepository, TaskRepository};
use crate::target::TargetStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Immutable copy of a target's content at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub target_id: String,
    pub captured_content: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SnapshotService {
    repo: Arc<dyn SnapshotRepository>,
    tasks: Arc<dyn TaskRepository>,
    targets: Arc<dyn TargetStore>,
    events: Arc<EventBus>,
}

impl SnapshotService {
    pub fn new(
        repo: Arc<dyn SnapshotRepository>,
        tasks: Arc<dyn TaskRepository>,
        targets: Arc<dyn TargetStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            repo,
            tasks,
            targets,
            events,
        }
    }

    pub fn capture(&self, target_id: &str, reason: &str) -> Result<String> {
        self.capture_at(target_id, reason, Utc::now())
    }

    /// Store the target's current content verbatim. A target that was never
    /// written is captured as empty content.
    pub fn capture_at(&self, target_id: &str, reason: &str, now: DateTime<Utc>) -> Result<String> {
        let content = self.targets.read(target_id)?.unwrap_or_default();
        let snapshot = Snapshot {
            id: ulid::Ulid::new().to_string(),
            target_id: target_id.to_string(),
            captured_content: content,
            reason: reason.to_string(),
            created_at: now,
        };
        self.repo.insert(&snapshot)?;
        tracing::debug!(snapshot_id = %snapshot.id, target_id, reason, "snapshot captured");
        Ok(snapshot.id)
    }

    /// Non-fatal capture: on failure the caller proceeds without rollback
    /// capability for this run.
    pub fn try_capture(&self, target_id: &str, reason: &str) -> Option<String> {
        match self.capture(target_id, reason) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(target_id, error = %e, "snapshot capture failed; continuing without rollback");
                None
            }
        }
    }

    /// Overwrite the live target with the snapshot's content. Rolling back
    /// to the same snapshot twice leaves the same end state.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn rollback(&self, snapshot_id: &str) -> Result<Snapshot> {
        let Some(snapshot) = self.repo.get(snapshot_id)? else {
            return Err(AutopilotError::SnapshotMissing(snapshot_id.to_string()));
        };
        self.targets
            .write(&snapshot.target_id, &snapshot.captured_content)?;
        self.repo
            .record_rollback(&snapshot.id, &snapshot.target_id, Utc::now())?;
        tracing::info!(target_id = %snapshot.target_id, "target rolled back");
        self.events
            .publish(AutopilotEvent::RolledBack {
                snapshot_id: snapshot.id.clone(),
                target_id: snapshot.target_id.clone(),
            })
            .await;
        Ok(snapshot)
    }

    /// Undo a task: its recorded pre-mutation snapshot, or else the latest
    /// snapshot of its target taken at or before the task last ran.
    pub async fn rollback_task(&self, task_id: &str) -> Result<Snapshot> {
        let Some(task) = self.tasks.get(task_id)? else {
            return Err(AutopilotError::NotFound(format!("task {task_id}")));
        };
        if let Some(snapshot_id) = task.snapshot_id.as_deref() {
            return self.rollback(snapshot_id).await;
        }
        let Some(target_id) = task.target_id.as_deref() else {
            return Err(AutopilotError::SnapshotMissing(format!(
                "task {task_id} has no target"
            )));
        };
        match self.repo.latest_before(target_id, task.updated_at)? {
            Some(snapshot) => self.rollback(&snapshot.id).await,
            None => Err(AutopilotError::SnapshotMissing(format!(
                "no snapshot of {target_id} before task {task_id}"
            ))),
        }
    }

    pub fn get(&self, snapshot_id: &str) -> Result<Option<Snapshot>> {
        self.repo.get(snapshot_id)
    }

    pub fn latest_before(&self, target_id: &str, at: DateTime<Utc>) -> Result<Option<Snapshot>> {
        self.repo.latest_before(target_id, at)
    }

    pub fn list(&self, target_id: &str) -> Result<Vec<Snapshot>> {
        self.repo.list_for_target(target_id)
    }

    /// Keep the newest `keep_latest` snapshots of a target, delete the rest.
    pub fn prune(&self, target_id: &str, keep_latest: usize) -> Result<usize> {
        let stale: Vec<String> = self
            .repo
            .list_for_target(target_id)?
            .into_iter()
            .skip(keep_latest.max(1))
            .map(|s| s.id)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        let deleted = self.repo.delete(&stale)?;
        tracing::info!(target_id, deleted, keep_latest, "pruned snapshots");
        Ok(deleted)
    }

    pub fn prune_all(&self, keep_latest: usize) -> Result<usize> {
        let mut total = 0;
        for target_id in self.repo.distinct_targets()? {
            total += self.prune(&target_id, keep_latest)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{NewTask, RetryPolicy, TaskQueue};
    use crate::store::SqliteStore;
    use crate::target::MemoryTargetStore;
    use chrono::Duration;
    use serde_json::json;

    fn service() -> (SnapshotService, Arc<MemoryTargetStore>, SqliteStore) {
        let store = SqliteStore::open_in_memory().expect("open store");
        let targets = Arc::new(MemoryTargetStore::new());
        let svc = SnapshotService::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            targets.clone(),
            Arc::new(EventBus::new()),
        );
        (svc, targets, store)
    }

    #[tokio::test]
    async fn capture_then_rollback_restores_exact_content() {
        let (svc, targets, _) = service();
        let original = "{\n  \"title\": \"Ünïcode \\t\"\n}\n";
        targets.write("home", original).expect("seed");
        let id = svc.capture("home", "pre:add_schema").expect("capture");

        targets.write("home", "{\"title\":\"changed\"}").expect("mutate");
        svc.rollback(&id).await.expect("rollback");
        assert_eq!(targets.read("home").expect("read").as_deref(), Some(original));

        svc.rollback(&id).await.expect("second rollback");
        assert_eq!(targets.read("home").expect("read").as_deref(), Some(original));
    }

    #[tokio::test]
    async fn unknown_snapshot_is_reported_and_nothing_changes() {
        let (svc, targets, _) = service();
        targets.write("home", "keep").expect("seed");
        let err = svc.rollback("01NOPE").await.expect_err("missing");
        assert!(matches!(err, AutopilotError::SnapshotMissing(_)));
        assert_eq!(targets.read("home").expect("read").as_deref(), Some("keep"));
    }

    #[tokio::test]
    async fn rollback_task_prefers_linked_snapshot() {
        let (svc, targets, store) = service();
        let queue = TaskQueue::new(Arc::new(store), RetryPolicy::default());
        targets.write("p", "v1").expect("seed");
        let linked = svc.capture("p", "pre").expect("capture v1");
        targets.write("p", "v2").expect("v2");
        svc.capture("p", "later").expect("capture v2");

        let task_id = queue
            .enqueue(NewTask::new("add_section", json!({})).for_target("p"))
            .expect("enqueue");
        queue.attach_snapshot(&task_id, &linked).expect("attach");
        targets.write("p", "v3").expect("v3");

        let restored = svc.rollback_task(&task_id).await.expect("rollback task");
        assert_eq!(restored.id, linked);
        assert_eq!(targets.read("p").expect("read").as_deref(), Some("v1"));
    }

    #[test]
    fn prune_keeps_newest() {
        let (svc, targets, _) = service();
        targets.write("p", "x").expect("seed");
        let t0 = Utc::now();
        let ids: Vec<String> = (0..5)
            .map(|i| {
                svc.capture_at("p", "pre", t0 + Duration::seconds(i))
                    .expect("capture")
            })
            .collect();
        assert_eq!(svc.prune("p", 2).expect("prune"), 3);
        let left: Vec<String> = svc.list("p").expect("list").into_iter().map(|s| s.id).collect();
        assert_eq!(left, vec![ids[4].clone(), ids[3].clone()]);
        assert_eq!(
            svc.latest_before("p", t0 + Duration::seconds(3))
                .expect("latest")
                .map(|s| s.id),
            Some(ids[3].clone())
        );
    }
}
