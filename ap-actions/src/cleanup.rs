use crate::error::Result;
use crate::traits::{Action, ActionContext, ActionSpec, parse_action, wrong_variant};
use ap_core::{DecisionAction, SnapshotService};
use async_trait::async_trait;
use serde_json::json;

/// Snapshot retention. Scoped to the task's target when it has one,
/// otherwise sweeps every target.
pub struct CleanupSnapshotsAction {
    snapshots: SnapshotService,
}

impl CleanupSnapshotsAction {
    pub fn new(snapshots: SnapshotService) -> Self {
        Self { snapshots }
    }
}

#[async_trait]
impl Action for CleanupSnapshotsAction {
    fn spec(&self) -> ActionSpec {
        ActionSpec {
            name: "cleanup_snapshots".to_string(),
            description: "Delete all but the newest snapshots per target.".to_string(),
            mutates_target: false,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(task_id = ctx.task_id))]
    async fn execute(
        &self,
        ctx: &ActionContext<'_>,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let keep_latest = match parse_action(payload)? {
            DecisionAction::CleanupSnapshots { keep_latest } => keep_latest,
            other => return Err(wrong_variant("cleanup_snapshots", &other)),
        };
        let deleted = match ctx.target_id {
            Some(target_id) => self.snapshots.prune(target_id, keep_latest)?,
            None => self.snapshots.prune_all(keep_latest)?,
        };
        Ok(json!({ "deleted": deleted, "keep_latest": keep_latest }))
    }
}
