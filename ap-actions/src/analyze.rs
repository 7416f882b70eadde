use crate::error::{ActionError, Result};
use crate::traits::{Action, ActionContext, ActionSpec, optional_string};
use ap_core::{
    Analysis, AnalysisContext, CreditScope, DecisionPipeline, Page, ProviderManager, TargetStore,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Reads a target, asks the provider chain for recommendations and feeds
/// the reply through the decision pipeline.
///
/// Payload keys (all optional): `instructions` appended to the system
/// prompt, `actor` to bill an actor's credit scope instead of the default.
pub struct AnalyzeTargetAction {
    targets: Arc<dyn TargetStore>,
    providers: Arc<ProviderManager>,
    pipeline: Arc<DecisionPipeline>,
    scope: CreditScope,
}

impl AnalyzeTargetAction {
    pub fn new(
        targets: Arc<dyn TargetStore>,
        providers: Arc<ProviderManager>,
        pipeline: Arc<DecisionPipeline>,
        scope: CreditScope,
    ) -> Self {
        Self {
            targets,
            providers,
            pipeline,
            scope,
        }
    }
}

#[async_trait]
impl Action for AnalyzeTargetAction {
    fn spec(&self) -> ActionSpec {
        ActionSpec {
            name: "analyze_target".to_string(),
            description: "Run AI analysis on a target and record the resulting decisions."
                .to_string(),
            mutates_target: false,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(task_id = ctx.task_id))]
    async fn execute(
        &self,
        ctx: &ActionContext<'_>,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let target_id = ctx.require_target()?;
        let instructions = optional_string(&payload, "instructions")?;
        let scope = match optional_string(&payload, "actor")? {
            Some(actor) if !actor.trim().is_empty() => CreditScope::actor(actor.trim()),
            _ => self.scope.clone(),
        };

        let Some(content) = self.targets.read(target_id)? else {
            return Err(ActionError::TargetMissing(target_id.to_string()));
        };
        let existing = Page::parse(&content)
            .map_err(|e| ActionError::InvalidArguments(format!("target {target_id}: {e}")))?
            .existing();

        let mut analysis_ctx = AnalysisContext::new(target_id, content);
        analysis_ctx.instructions = instructions;
        // Admission denial and provider exhaustion both land here; a later
        // attempt may find credits or a recovered provider.
        let Some(result) = self
            .providers
            .analyze(&analysis_ctx, &scope, ctx.guard)
            .await
        else {
            return Err(ActionError::ExecutionFailed(
                "no provider produced an analysis".to_string(),
            ));
        };

        let analysis = Analysis::from_ai_value(target_id, &result.provider, existing, &result.value)
            .map_err(|e| ActionError::ExecutionFailed(e.to_string()))?;
        let decisions = self.pipeline.run(&analysis, ctx.guard).await?;
        tracing::info!(
            target_id,
            provider = %result.provider,
            decisions = decisions.len(),
            "analysis recorded"
        );
        Ok(json!({
            "target_id": target_id,
            "provider": result.provider,
            "decisions": decisions.iter().map(|d| d.hash.clone()).collect::<Vec<_>>(),
        }))
    }
}
