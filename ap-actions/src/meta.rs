use crate::error::Result;
use crate::page::edit_page;
use crate::traits::{Action, ActionContext, ActionSpec, parse_action, wrong_variant};
use ap_core::{DecisionAction, TargetStore};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

pub struct UpdateMetaAction {
    targets: Arc<dyn TargetStore>,
}

impl UpdateMetaAction {
    pub fn new(targets: Arc<dyn TargetStore>) -> Self {
        Self { targets }
    }
}

fn nonblank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[async_trait]
impl Action for UpdateMetaAction {
    fn spec(&self) -> ActionSpec {
        ActionSpec {
            name: "update_meta".to_string(),
            description: "Set the target page's title and/or description.".to_string(),
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
        let (title, description) = match parse_action(payload)? {
            DecisionAction::UpdateMeta { title, description } => {
                (nonblank(title), nonblank(description))
            }
            other => return Err(wrong_variant("update_meta", &other)),
        };

        let changed = edit_page(self.targets.as_ref(), target_id, |page| {
            let mut changed = false;
            if title.is_some() && page.title != title {
                page.title = title.clone();
                changed = true;
            }
            if description.is_some() && page.description != description {
                page.description = description.clone();
                changed = true;
            }
            changed
        })?;
        Ok(json!({
            "target_id": target_id,
            "title": title,
            "description": description,
            "changed": changed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap_core::{GuardState, MemoryTargetStore, Page};

    #[tokio::test]
    async fn only_overwrites_fields_present_in_payload() {
        let targets = Arc::new(MemoryTargetStore::new());
        targets
            .write("home", r#"{"title":"Old","description":"Keep me"}"#)
            .expect("seed");
        let action = UpdateMetaAction::new(targets.clone());
        let guard = GuardState::running();
        let ctx = ActionContext {
            task_id: "t1",
            target_id: Some("home"),
            guard: &guard,
        };

        let out = action
            .execute(&ctx, json!({ "type": "update_meta", "title": "New", "description": "  " }))
            .await
            .expect("update");
        assert_eq!(out["changed"], true);

        let page = Page::parse(&targets.read("home").expect("read").expect("present")).expect("parse");
        assert_eq!(page.title.as_deref(), Some("New"));
        assert_eq!(page.description.as_deref(), Some("Keep me"));

        let again = action
            .execute(&ctx, json!({ "type": "update_meta", "title": "New" }))
            .await
            .expect("repeat");
        assert_eq!(again["changed"], false);
    }
}
