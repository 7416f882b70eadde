use crate::analyze::AnalyzeTargetAction;
use crate::cleanup::CleanupSnapshotsAction;
use crate::links::InternalLinksAction;
use crate::meta::UpdateMetaAction;
use crate::schema::AddSchemaAction;
use crate::section::AddSectionAction;
use crate::traits::{Action, ActionContext};
use ap_core::{
    ActionDispatch, CreditScope, DecisionPipeline, DispatchError, GuardState, ProviderManager,
    SnapshotService, Task, TargetStore,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Name-keyed action table; the executor's dispatcher.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four page edits a decision can apply.
    pub fn with_page_actions(targets: Arc<dyn TargetStore>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AddSchemaAction::new(targets.clone())));
        registry.register(Arc::new(AddSectionAction::new(targets.clone())));
        registry.register(Arc::new(UpdateMetaAction::new(targets.clone())));
        registry.register(Arc::new(InternalLinksAction::new(targets)));
        registry
    }

    /// Page edits plus snapshot retention and AI analysis.
    pub fn standard(
        targets: Arc<dyn TargetStore>,
        snapshots: SnapshotService,
        providers: Arc<ProviderManager>,
        pipeline: Arc<DecisionPipeline>,
        scope: CreditScope,
    ) -> Self {
        let mut registry = Self::with_page_actions(targets.clone());
        registry.register(Arc::new(CleanupSnapshotsAction::new(snapshots)));
        registry.register(Arc::new(AnalyzeTargetAction::new(
            targets, providers, pipeline, scope,
        )));
        registry
    }

    /// Later registrations under the same name replace earlier ones.
    pub fn register(&mut self, action: Arc<dyn Action>) {
        let name = action.spec().name;
        if self.actions.insert(name.clone(), action).is_some() {
            tracing::warn!(action = %name, "replaced existing action registration");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ActionDispatch for ActionRegistry {
    fn mutates(&self, action_name: &str) -> bool {
        self.actions
            .get(action_name)
            .is_some_and(|a| a.spec().mutates_target)
    }

    #[tracing::instrument(level = "info", skip_all, fields(task_id = %task.id, action = %task.action_name))]
    async fn dispatch(
        &self,
        task: &Task,
        guard: &GuardState,
    ) -> Result<serde_json::Value, DispatchError> {
        let Some(action) = self.actions.get(&task.action_name) else {
            return Err(DispatchError::permanent(format!(
                "unknown action: {}",
                task.action_name
            )));
        };
        let ctx = ActionContext {
            task_id: &task.id,
            target_id: task.target_id.as_deref(),
            guard,
        };
        action
            .execute(&ctx, task.payload.clone())
            .await
            .map_err(|e| DispatchError {
                message: e.to_string(),
                retryable: e.is_retryable(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap_core::{MemoryTargetStore, TaskStatus};
    use chrono::Utc;
    use serde_json::json;

    fn task(action_name: &str, target_id: Option<&str>, payload: serde_json::Value) -> Task {
        let now = Utc::now();
        Task {
            id: "task-1".to_string(),
            action_name: action_name.to_string(),
            payload,
            status: TaskStatus::Running,
            attempts: 1,
            max_attempts: 3,
            available_at: now,
            last_error: None,
            idempotency_key: None,
            decision_hash: None,
            target_id: target_id.map(str::to_string),
            snapshot_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn page_actions_mutate_and_unknown_does_not() {
        let registry = ActionRegistry::with_page_actions(Arc::new(MemoryTargetStore::new()));
        assert_eq!(
            registry.names(),
            vec!["add_schema", "add_section", "internal_links", "update_meta"]
        );
        assert!(registry.mutates("add_section"));
        assert!(!registry.mutates("send_email"));
    }

    #[tokio::test]
    async fn dispatches_by_action_name() {
        let targets = Arc::new(MemoryTargetStore::new());
        let registry = ActionRegistry::with_page_actions(targets.clone());
        let out = registry
            .dispatch(
                &task(
                    "add_schema",
                    Some("home"),
                    json!({ "type": "add_schema", "schema_type": "WebPage" }),
                ),
                &GuardState::running(),
            )
            .await
            .expect("dispatch");
        assert_eq!(out["changed"], true);
        assert!(targets.read("home").expect("read").is_some());
    }

    #[tokio::test]
    async fn unknown_action_and_bad_payload_are_permanent() {
        let registry = ActionRegistry::with_page_actions(Arc::new(MemoryTargetStore::new()));
        let guard = GuardState::running();

        let err = registry
            .dispatch(&task("send_email", Some("home"), json!({})), &guard)
            .await
            .expect_err("unknown");
        assert!(!err.retryable);

        let err = registry
            .dispatch(
                &task("add_section", Some("home"), json!({ "type": "add_section", "heading": "X", "level": 9 })),
                &guard,
            )
            .await
            .expect_err("bad level");
        assert!(!err.retryable);
        assert!(err.message.contains("level"));
    }
}
