use crate::error::Result;
use crate::page::{edit_page, same_text};
use crate::traits::{Action, ActionContext, ActionSpec, parse_action, wrong_variant};
use ap_core::{DecisionAction, TargetStore};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

pub struct AddSchemaAction {
    targets: Arc<dyn TargetStore>,
}

impl AddSchemaAction {
    pub fn new(targets: Arc<dyn TargetStore>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl Action for AddSchemaAction {
    fn spec(&self) -> ActionSpec {
        ActionSpec {
            name: "add_schema".to_string(),
            description: "Declare a structured-data schema type on the target page.".to_string(),
            mutates_target: true,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(task_id = ctx.task_id))]
    async fn execute(
        &self,
        ctx: &ActionContext<'_>,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let target_id = ctx.require_target()?;
        let schema_type = match parse_action(payload)? {
            DecisionAction::AddSchema { schema_type } => schema_type.trim().to_string(),
            other => return Err(wrong_variant("add_schema", &other)),
        };

        let changed = edit_page(self.targets.as_ref(), target_id, |page| {
            if page.schema_types.iter().any(|s| same_text(s, &schema_type)) {
                return false;
            }
            page.schema_types.push(schema_type.clone());
            true
        })?;
        Ok(json!({ "target_id": target_id, "schema_type": schema_type, "changed": changed }))
    }
}
