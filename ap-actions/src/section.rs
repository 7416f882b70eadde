use crate::error::Result;
use crate::page::{edit_page, same_text};
use crate::traits::{Action, ActionContext, ActionSpec, parse_action, wrong_variant};
use ap_core::{DecisionAction, PageSection, TargetStore};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Appends a section unless one with the same heading already exists.
pub struct AddSectionAction {
    targets: Arc<dyn TargetStore>,
}

impl AddSectionAction {
    pub fn new(targets: Arc<dyn TargetStore>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl Action for AddSectionAction {
    fn spec(&self) -> ActionSpec {
        ActionSpec {
            name: "add_section".to_string(),
            description: "Append a headed content section to the target page.".to_string(),
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
        let section = match parse_action(payload)? {
            DecisionAction::AddSection {
                heading,
                level,
                body,
            } => PageSection {
                heading: heading.trim().to_string(),
                level,
                body,
            },
            other => return Err(wrong_variant("add_section", &other)),
        };
        let heading = section.heading.clone();

        let changed = edit_page(self.targets.as_ref(), target_id, |page| {
            if page.sections.iter().any(|s| same_text(&s.heading, &section.heading)) {
                return false;
            }
            page.sections.push(section);
            true
        })?;
        Ok(json!({ "target_id": target_id, "heading": heading, "changed": changed }))
    }
}
