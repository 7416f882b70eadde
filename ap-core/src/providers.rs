//! AI providers behind credit and rate admission, tried in a fixed order.

use crate::credits::{CreditLedger, CreditScope};
use crate::guard::GuardState;
use crate::rate_limit::RateLimiter;
use ap_llm::{ChatMessage, GeminiClient, OpenAiClient, ReplyMode};
use async_trait::async_trait;
use std::sync::Arc;

const ANALYSIS_INSTRUCTIONS: &str = "You review a web page document and recommend improvements. \
Reply with one JSON object with these optional keys: \
\"sections\" (array of {\"heading\", \"level\" 2-6, \"body\"}), \
\"schema_types\" (array of schema.org type names), \
\"title\", \"description\", \
\"internal_links\" (array of {\"url\", \"anchor\"}), \
\"confidence\" (number 0-1). Recommend only what the page is missing.";

/// Input for one analysis call.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub target_id: String,
    pub content: String,
    pub instructions: Option<String>,
}

impl AnalysisContext {
    pub fn new(target_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            content: content.into(),
            instructions: None,
        }
    }

    pub fn to_messages(&self) -> Vec<ChatMessage> {
        let mut system = ANALYSIS_INSTRUCTIONS.to_string();
        if let Some(extra) = self.instructions.as_deref().filter(|s| !s.trim().is_empty()) {
            system.push_str("\n\n");
            system.push_str(extra);
        }
        vec![
            ChatMessage::system(system),
            ChatMessage::user(format!(
                "Target: {}\n\nDocument:\n{}",
                self.target_id, self.content
            )),
        ]
    }
}

/// One AI backend. `analyze` never fails across this boundary: transport,
/// timeout and parse errors all come back as `None`.
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;
    fn mode(&self) -> ReplyMode;
    /// Kill-switch and credentials.
    fn is_available(&self, guard: &GuardState) -> bool;
    async fn analyze(
        &self,
        ctx: &AnalysisContext,
        scope: &CreditScope,
    ) -> Option<serde_json::Value>;
}

pub struct OpenAiProvider {
    client: OpenAiClient,
}

impl OpenAiProvider {
    pub fn new(client: OpenAiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn mode(&self) -> ReplyMode {
        ReplyMode::Json
    }

    fn is_available(&self, guard: &GuardState) -> bool {
        guard.allows_ai() && self.client.has_credentials()
    }

    async fn analyze(&self, ctx: &AnalysisContext, scope: &CreditScope) -> Option<serde_json::Value> {
        match self.client.chat(&ctx.to_messages(), self.mode()).await {
            Ok(resp) => {
                tracing::debug!(
                    scope = %scope,
                    prompt_tokens = resp.usage.prompt_tokens,
                    completion_tokens = resp.usage.completion_tokens,
                    "openai analysis reply"
                );
                parse_structured(self.name(), &resp.content)
            }
            Err(e) => {
                tracing::warn!(provider = self.name(), error = %e, "provider call failed");
                None
            }
        }
    }
}

pub struct GeminiProvider {
    client: GeminiClient,
}

impl GeminiProvider {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AiProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn mode(&self) -> ReplyMode {
        ReplyMode::Json
    }

    fn is_available(&self, guard: &GuardState) -> bool {
        guard.allows_ai() && self.client.has_credentials()
    }

    async fn analyze(&self, ctx: &AnalysisContext, scope: &CreditScope) -> Option<serde_json::Value> {
        match self.client.chat(&ctx.to_messages(), self.mode()).await {
            Ok(resp) => {
                tracing::debug!(
                    scope = %scope,
                    prompt_tokens = resp.usage.prompt_tokens,
                    completion_tokens = resp.usage.completion_tokens,
                    "gemini analysis reply"
                );
                parse_structured(self.name(), &resp.content)
            }
            Err(e) => {
                tracing::warn!(provider = self.name(), error = %e, "provider call failed");
                None
            }
        }
    }
}

/// Parse a reply as a JSON object, tolerating a surrounding code fence.
fn parse_structured(provider: &str, raw: &str) -> Option<serde_json::Value> {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.split_once('\n').map_or("", |(_, body)| body);
        text = rest.trim_end().trim_end_matches("```").trim();
    }
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(v) if v.is_object() => Some(v),
        Ok(_) => {
            tracing::warn!(provider, "provider reply is JSON but not an object");
            None
        }
        Err(e) => {
            tracing::warn!(provider, error = %e, "provider reply is not JSON");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResult {
    pub provider: String,
    pub value: serde_json::Value,
}

/// Fallback chain with credit admission and refund-on-failure.
///
/// One credit is consumed before each provider call and refunded if the
/// call does not produce a structured object, so only a usable answer
/// costs anything. No lock is held across the network call.
pub struct ProviderManager {
    providers: Vec<Arc<dyn AiProvider>>,
    ledger: CreditLedger,
    limiter: Arc<RateLimiter>,
}

impl ProviderManager {
    pub fn new(
        providers: Vec<Arc<dyn AiProvider>>,
        ledger: CreditLedger,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            providers,
            ledger,
            limiter,
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn available(&self, guard: &GuardState) -> Vec<String> {
        self.providers
            .iter()
            .filter(|p| p.is_available(guard))
            .map(|p| p.name().to_string())
            .collect()
    }

    #[tracing::instrument(level = "info", skip_all, fields(target_id = %ctx.target_id, scope = %scope))]
    pub async fn analyze(
        &self,
        ctx: &AnalysisContext,
        scope: &CreditScope,
        guard: &GuardState,
    ) -> Option<ProviderResult> {
        if !guard.allows_ai() {
            tracing::warn!("emergency stop active; no provider called");
            return None;
        }
        match self.ledger.has_credits(1, scope) {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!("admission denied: no credits");
                return None;
            }
            Err(e) => {
                tracing::error!(error = %e, "credit check failed");
                return None;
            }
        }
        if !self.limiter.allow(&scope.key()) {
            tracing::info!("admission denied: rate limited");
            return None;
        }

        for provider in &self.providers {
            if !provider.is_available(guard) {
                tracing::debug!(provider = provider.name(), "provider unavailable; skipping");
                continue;
            }
            match self.ledger.consume(1, scope) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(provider = provider.name(), "credit lost to a concurrent caller");
                    return None;
                }
                Err(e) => {
                    tracing::error!(error = %e, "credit consume failed");
                    return None;
                }
            }

            if let Some(value) = provider.analyze(ctx, scope).await.filter(|v| v.is_object()) {
                tracing::info!(provider = provider.name(), "provider returned structured result");
                return Some(ProviderResult {
                    provider: provider.name().to_string(),
                    value,
                });
            }

            if let Err(e) = self.ledger.add(1, scope) {
                tracing::error!(provider = provider.name(), error = %e, "credit refund failed");
            }
            tracing::warn!(provider = provider.name(), "provider failed; credit refunded, falling back");
        }
        tracing::warn!("all providers exhausted");
        None
    }
}
