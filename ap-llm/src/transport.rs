use crate::error::{LlmError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Where provider requests are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Direct,
    /// Requests are wrapped as `{target, headers, body}` and posted to `url`.
    /// The proxy answers with the upstream status and body unchanged.
    Proxy { url: String, token: Option<String> },
}

#[derive(Debug, Serialize)]
struct ProxyEnvelope<'a> {
    target: &'a str,
    headers: BTreeMap<&'a str, &'a str>,
    body: &'a serde_json::Value,
}

#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    mode: Transport,
}

impl HttpTransport {
    pub fn new(timeout: Duration, mode: Transport) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self { http, mode }
    }

    pub fn mode(&self) -> &Transport {
        &self.mode
    }

    /// POST a JSON body to `target` and return the raw response text.
    ///
    /// Non-2xx statuses are returned as `LlmError::Http` with the body attached.
    #[tracing::instrument(level = "debug", skip_all, fields(target = %redact_query(target)))]
    pub async fn post_json(
        &self,
        target: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<String> {
        let request = match &self.mode {
            Transport::Direct => {
                let mut request = self.http.post(target).json(body);
                for (name, value) in headers {
                    request = request.header(*name, *value);
                }
                request
            }
            Transport::Proxy { url, token } => {
                let envelope = proxy_envelope(target, headers, body);
                let request = self.http.post(url).json(&envelope);
                match token.as_deref() {
                    Some(token) => request.bearer_auth(token),
                    None => request,
                }
            }
        };

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "status={status} body={}",
                truncate(&text, 512)
            )));
        }
        Ok(text)
    }
}

fn proxy_envelope<'a>(
    target: &'a str,
    headers: &'a [(&'a str, &'a str)],
    body: &'a serde_json::Value,
) -> ProxyEnvelope<'a> {
    ProxyEnvelope {
        target,
        headers: headers.iter().copied().collect(),
        body,
    }
}

fn redact_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn proxy_envelope_wraps_target_headers_and_body() {
        let body = json!({ "model": "m" });
        let headers = [("authorization", "Bearer k"), ("x-extra", "1")];
        let envelope = proxy_envelope("https://api.example.com/v1/chat", &headers, &body);
        let value = serde_json::to_value(&envelope).expect("serialize envelope");
        assert_eq!(value["target"], "https://api.example.com/v1/chat");
        assert_eq!(value["headers"]["authorization"], "Bearer k");
        assert_eq!(value["body"]["model"], "m");
    }

    #[test]
    fn redact_query_drops_credentials_in_query_string() {
        assert_eq!(
            redact_query("https://g.example.com/models/x:generateContent?key=secret"),
            "https://g.example.com/models/x:generateContent"
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo";
        assert_eq!(truncate(s, 2), "h");
        assert_eq!(truncate(s, 64), s);
    }
}
