use crate::error::{LlmError, Result};
use crate::transport::HttpTransport;
use crate::types::{ChatMessage, ChatResponse, ReplyMode, Role, Usage};
use serde::{Deserialize, Serialize};

pub const GEMINI_DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Clone)]
pub struct GeminiClient {
    transport: HttpTransport,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl GeminiClient {
    pub fn new(transport: HttpTransport, api_key: Option<&str>, model: &str) -> Self {
        Self {
            transport,
            endpoint: GEMINI_DEFAULT_ENDPOINT.to_string(),
            api_key: api_key
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(ToOwned::to_owned),
            model: model.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        let endpoint = endpoint.trim().trim_end_matches('/');
        if !endpoint.is_empty() {
            self.endpoint = endpoint.to_string();
        }
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    fn generate_url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model, mode = mode.as_str()))]
    pub async fn chat(&self, messages: &[ChatMessage], mode: ReplyMode) -> Result<ChatResponse> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(LlmError::MissingCredentials("gemini".to_string()));
        };
        let req = GeminiRequest::new(messages, mode)?;
        let body = serde_json::to_value(&req)?;
        let text = self
            .transport
            .post_json(&self.generate_url(), &[("x-goog-api-key", api_key)], &body)
            .await?;

        let parsed: GeminiResponse = serde_json::from_str(&text)?;
        parsed.try_into()
    }

    pub async fn generate(&self, prompt: &str, mode: ReplyMode) -> Result<ChatResponse> {
        self.chat(&[ChatMessage::user(prompt)], mode).await
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    response_mime_type: String,
}

impl GeminiRequest {
    /// System messages are folded into `systemInstruction`; Gemini has no system role.
    fn new(messages: &[ChatMessage], mode: ReplyMode) -> Result<Self> {
        let mut system = Vec::new();
        let mut contents = Vec::new();
        for m in messages {
            match m.role {
                Role::System => system.push(GeminiPart {
                    text: m.content.clone(),
                }),
                Role::User | Role::Assistant => contents.push(GeminiContent {
                    role: Some(if m.role == Role::User { "user" } else { "model" }.to_string()),
                    parts: vec![GeminiPart {
                        text: m.content.clone(),
                    }],
                }),
            }
        }
        if contents.is_empty() {
            return Err(LlmError::InvalidInput(
                "gemini request needs at least one user message".to_string(),
            ));
        }
        Ok(Self {
            contents,
            system_instruction: (!system.is_empty()).then_some(GeminiContent {
                role: None,
                parts: system,
            }),
            generation_config: match mode {
                ReplyMode::Json => Some(GeminiGenerationConfig {
                    response_mime_type: "application/json".to_string(),
                }),
                ReplyMode::Text => None,
            },
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

impl TryFrom<GeminiResponse> for ChatResponse {
    type Error = LlmError;

    fn try_from(v: GeminiResponse) -> Result<Self> {
        let candidate = v.candidates.into_iter().next().ok_or_else(|| {
            LlmError::ResponseFormat("gemini response missing candidates".to_string())
        })?;
        let content = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(LlmError::ResponseFormat(
                "gemini response has empty content".to_string(),
            ));
        }
        let usage = v.usage_metadata.map_or_else(Usage::default, |u| Usage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
        });
        Ok(ChatResponse {
            content,
            usage,
            finish_reason: candidate
                .finish_reason
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}
