use crate::error::Result;
use crate::page::edit_page;
use crate::traits::{Action, ActionContext, ActionSpec, parse_action, wrong_variant};
use ap_core::{DecisionAction, TargetStore};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Adds internal links; a URL already linked from the page is skipped.
pub struct InternalLinksAction {
    targets: Arc<dyn TargetStore>,
}

impl InternalLinksAction {
    pub fn new(targets: Arc<dyn TargetStore>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl Action for InternalLinksAction {
    fn spec(&self) -> ActionSpec {
        ActionSpec {
            name: "internal_links".to_string(),
            description: "Add internal links to the target page.".to_string(),
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
        let links = match parse_action(payload)? {
            DecisionAction::InternalLinks { links } => links,
            other => return Err(wrong_variant("internal_links", &other)),
        };

        let mut added = 0usize;
        edit_page(self.targets.as_ref(), target_id, |page| {
            for link in links {
                let url = link.url.trim();
                if page.links.iter().any(|l| l.url.trim() == url) {
                    continue;
                }
                page.links.push(link);
                added += 1;
            }
            added > 0
        })?;
        Ok(json!({ "target_id": target_id, "added": added, "changed": added > 0 }))
    }
}
