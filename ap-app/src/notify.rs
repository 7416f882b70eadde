use ap_core::{AutopilotError, AutopilotEvent, EventListener};
use async_trait::async_trait;
use std::time::Duration;

/// Posts every event as JSON to a webhook. Delivery failures surface as
/// listener errors, which the bus logs and drops.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: &str, token: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(anyhow::anyhow!("webhook url must be http(s): {url:?}"));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("build webhook client: {e}"))?;
        Ok(Self {
            http,
            url: url.to_string(),
            token: token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        })
    }

    fn failure(&self, message: String) -> AutopilotError {
        AutopilotError::Listener {
            listener: self.name().to_string(),
            message,
        }
    }
}

#[async_trait]
impl EventListener for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    #[tracing::instrument(level = "debug", skip_all, fields(event = event.name()))]
    async fn on_event(&self, event: &AutopilotEvent) -> ap_core::Result<()> {
        let mut req = self.http.post(&self.url).json(event);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| self.failure(format!("post failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(self.failure(format!("webhook answered {status}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_urls_and_blank_tokens() {
        assert!(WebhookNotifier::new("ftp://example.com", None, Duration::from_secs(1)).is_err());
        let notifier =
            WebhookNotifier::new(" https://hooks.example.com/x ", Some("  "), Duration::from_secs(1))
                .expect("valid url");
        assert_eq!(notifier.url, "https://hooks.example.com/x");
        assert!(notifier.token.is_none());
    }

    #[tokio::test]
    async fn unreachable_webhook_is_a_listener_error() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook", None, Duration::from_millis(200))
            .expect("valid url");
        let err = notifier
            .on_event(&AutopilotEvent::Resumed {
                reason: "test".to_string(),
            })
            .await
            .expect_err("nothing listens on the discard port");
        assert!(matches!(err, AutopilotError::Listener { .. }));
    }
}
