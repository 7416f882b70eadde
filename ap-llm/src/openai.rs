use crate::error::{LlmError, Result};
use crate::transport::HttpTransport;
use crate::types::{ChatMessage, ChatResponse, ReplyMode, Role, Usage};
use serde::{Deserialize, Serialize};

pub const OPENAI_DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Clone)]
pub struct OpenAiClient {
    transport: HttpTransport,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiClient {
    pub fn new(transport: HttpTransport, api_key: Option<&str>, model: &str) -> Self {
        Self {
            transport,
            endpoint: OPENAI_DEFAULT_ENDPOINT.to_string(),
            api_key: api_key
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(ToOwned::to_owned),
            model: model.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        let endpoint = endpoint.trim();
        if !endpoint.is_empty() {
            self.endpoint = endpoint.to_string();
        }
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// True when an API key is configured.
    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model, mode = mode.as_str()))]
    pub async fn chat(&self, messages: &[ChatMessage], mode: ReplyMode) -> Result<ChatResponse> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(LlmError::MissingCredentials("openai".to_string()));
        };
        if messages.is_empty() {
            return Err(LlmError::InvalidInput("messages must not be empty".to_string()));
        }

        let req = OpenAiChatRequest::new(&self.model, messages, mode);
        let body = serde_json::to_value(&req)?;
        let bearer = format!("Bearer {api_key}");
        let text = self
            .transport
            .post_json(&self.endpoint, &[("authorization", bearer.as_str())], &body)
            .await?;

        let parsed: OpenAiChatResponse = serde_json::from_str(&text)?;
        parsed.try_into()
    }

    pub async fn generate(&self, prompt: &str, mode: ReplyMode) -> Result<ChatResponse> {
        self.chat(&[ChatMessage::user(prompt)], mode).await
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OpenAiResponseFormat>,
}

#[derive(Debug, Serialize)]
struct OpenAiResponseFormat {
    r#type: String,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: &'static str,
    content: String,
}

impl OpenAiChatRequest {
    fn new(model: &str, messages: &[ChatMessage], mode: ReplyMode) -> Self {
        Self {
            model: model.to_string(),
            messages: messages.iter().map(to_openai_message).collect(),
            response_format: match mode {
                ReplyMode::Json => Some(OpenAiResponseFormat {
                    r#type: "json_object".to_string(),
                }),
                ReplyMode::Text => None,
            },
        }
    }
}

fn to_openai_message(m: &ChatMessage) -> OpenAiMessage {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    OpenAiMessage {
        role,
        content: m.content.clone(),
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl TryFrom<OpenAiChatResponse> for ChatResponse {
    type Error = LlmError;

    fn try_from(v: OpenAiChatResponse) -> Result<Self> {
        let choice = v.choices.into_iter().next().ok_or_else(|| {
            LlmError::ResponseFormat("openai response missing choices".to_string())
        })?;
        let content = choice.message.content.unwrap_or_default();
        if content.trim().is_empty() {
            return Err(LlmError::ResponseFormat(
                "openai response has empty content".to_string(),
            ));
        }
        let usage = v.usage.map_or_else(Usage::default, |u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        });
        Ok(ChatResponse {
            content,
            usage,
            finish_reason: choice
                .finish_reason
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn json_mode_sets_response_format() {
        let req = OpenAiChatRequest::new(
            "gpt-4o-mini",
            &[ChatMessage::system("be terse"), ChatMessage::user("hi")],
            ReplyMode::Json,
        );
        let value = serde_json::to_value(&req).expect("serialize request");
        assert_eq!(value["response_format"]["type"], "json_object");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "hi");

        let text = OpenAiChatRequest::new("gpt-4o-mini", &[ChatMessage::user("hi")], ReplyMode::Text);
        let value = serde_json::to_value(&text).expect("serialize request");
        assert!(value.get("response_format").is_none());
    }

    #[test]
    fn response_parses_first_choice_and_usage() {
        let raw = json!({
            "choices": [{ "message": { "content": "{\"ok\":true}" }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3 }
        });
        let parsed: OpenAiChatResponse = serde_json::from_value(raw).expect("parse response");
        let resp = ChatResponse::try_from(parsed).expect("convert response");
        assert_eq!(resp.content, "{\"ok\":true}");
        assert_eq!(resp.usage.prompt_tokens, 12);
        assert_eq!(resp.finish_reason, "stop");
    }

    #[test]
    fn empty_choices_is_a_format_error() {
        let parsed: OpenAiChatResponse =
            serde_json::from_value(json!({ "choices": [] })).expect("parse response");
        let err = ChatResponse::try_from(parsed).expect_err("missing choices must fail");
        assert!(matches!(err, LlmError::ResponseFormat(_)));
    }

    #[tokio::test]
    async fn chat_without_key_reports_missing_credentials() {
        let client = OpenAiClient::new(
            HttpTransport::new(Duration::from_secs(1), Transport::Direct),
            Some("   "),
            "gpt-4o-mini",
        );
        assert!(!client.has_credentials());
        let err = client
            .generate("hello", ReplyMode::Text)
            .await
            .expect_err("no key must fail before any request");
        assert!(matches!(err, LlmError::MissingCredentials(_)));
    }
}
