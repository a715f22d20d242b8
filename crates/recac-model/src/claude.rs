//! Anthropic messages API backend.

use crate::{ChunkCallback, ModelClient, RetryPolicy};
use async_trait::async_trait;
use futures_util::StreamExt;
use recac_core::config::ModelSettings;
use recac_core::{RecacError, RecacResult};
use serde::Deserialize;
use tracing::warn;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Client for the Anthropic messages API.
pub struct ClaudeClient {
    settings: ModelSettings,
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
    http: reqwest::Client,
}

impl ClaudeClient {
    /// Build a client from settings, reading `ANTHROPIC_API_KEY` from the
    /// environment.
    pub fn new(settings: ModelSettings) -> RecacResult<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| RecacError::Config("ANTHROPIC_API_KEY is not set".into()))?;
        Ok(Self::with_key(settings, api_key))
    }

    /// Build a client with an explicit key.
    pub fn with_key(settings: ModelSettings, api_key: impl Into<String>) -> Self {
        Self {
            settings,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            retry: RetryPolicy::default(),
            http: reqwest::Client::new(),
        }
    }

    /// Override the API base URL (tests point this at a mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request_body(&self, prompt: &str, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.settings.model_id,
            "max_tokens": self.settings.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });
        if stream {
            body["stream"] = serde_json::json!(true);
        }
        body
    }

    /// POST the body; `Err((error, retryable))` distinguishes transient
    /// failures (network, 5xx, 429) from fatal ones (other 4xx).
    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, (RecacError, bool)> {
        let url = format!("{}/v1/messages", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| (RecacError::Model(e.to_string()), true))?;

        let status = resp.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err((RecacError::Model(format!("Claude API error {status}")), true));
        }
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err((
                RecacError::Model(format!("Claude API error {status}: {detail}")),
                false,
            ));
        }
        Ok(resp)
    }

    async fn send_once(&self, prompt: &str) -> Result<String, (RecacError, bool)> {
        let resp = self.post(&self.request_body(prompt, false)).await?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| (RecacError::Model(e.to_string()), true))?;
        parse_reply(&body).map_err(|e| (e, false))
    }
}

fn parse_reply(body: &serde_json::Value) -> RecacResult<String> {
    let content = body["content"]
        .as_array()
        .ok_or_else(|| RecacError::Model("missing content in Claude response".into()))?;
    let text: Vec<&str> = content
        .iter()
        .filter(|block| block["type"].as_str() == Some("text"))
        .filter_map(|block| block["text"].as_str())
        .collect();
    Ok(text.join("\n"))
}

/// One server-sent event line from the streaming API.
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl ModelClient for ClaudeClient {
    async fn send(&self, prompt: &str) -> RecacResult<String> {
        let mut last_err = RecacError::Model("no attempts made".into());
        for attempt in 1..=self.retry.attempts {
            match self.send_once(prompt).await {
                Ok(reply) => return Ok(reply),
                Err((e, retryable)) => {
                    warn!(attempt, error = %e, "Claude request failed");
                    if !retryable {
                        return Err(e);
                    }
                    last_err = e;
                    if attempt < self.retry.attempts {
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn send_stream(&self, prompt: &str, on_chunk: ChunkCallback) -> RecacResult<String> {
        let resp = self
            .post(&self.request_body(prompt, true))
            .await
            .map_err(|(e, _)| e)?;

        let mut full = String::new();
        let mut buffer = String::new();
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| RecacError::Model(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim_end().to_string();
                buffer.drain(..=newline);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                let Ok(event) = serde_json::from_str::<StreamEvent>(data) else {
                    continue;
                };
                if event.event_type == "content_block_delta" {
                    if let Some(text) = event.delta.and_then(|d| d.text) {
                        on_chunk(&text);
                        full.push_str(&text);
                    }
                }
            }
        }

        Ok(full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings() -> ModelSettings {
        ModelSettings {
            model_id: "claude-test".into(),
            ..ModelSettings::default()
        }
    }

    fn reply_body(text: &str) -> serde_json::Value {
        serde_json::json!({
            "content": [{"type": "text", "text": text}],
            "stop_reason": "end_turn"
        })
    }

    #[tokio::test]
    async fn test_send_parses_text_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply_body("done: all tests pass")))
            .mount(&server)
            .await;

        let client = ClaudeClient::with_key(settings(), "test-key").with_base_url(server.uri());
        let reply = client.send("status?").await.unwrap();
        assert_eq!(reply, "done: all tests pass");
    }

    #[tokio::test]
    async fn test_send_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply_body("recovered")))
            .mount(&server)
            .await;

        let retry = RetryPolicy {
            attempts: 3,
            backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(2),
        };
        let client = ClaudeClient::with_key(settings(), "test-key")
            .with_base_url(server.uri())
            .with_retry(retry);
        let reply = client.send("status?").await.unwrap();
        assert_eq!(reply, "recovered");
    }

    #[tokio::test]
    async fn test_send_gives_up_after_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let retry = RetryPolicy {
            attempts: 2,
            backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(1),
        };
        let client = ClaudeClient::with_key(settings(), "test-key")
            .with_base_url(server.uri())
            .with_retry(retry);
        let err = client.send("status?").await.unwrap_err();
        assert!(err.to_string().contains("Claude API error"));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let retry = RetryPolicy {
            attempts: 2,
            backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(1),
        };
        let client = ClaudeClient::with_key(settings(), "wrong")
            .with_base_url(server.uri())
            .with_retry(retry);
        let err = client.send("status?").await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn test_stream_concatenates_deltas() {
        let server = MockServer::start().await;
        let sse = concat!(
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hello \"}}\n",
            "\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"world\"}}\n",
            "\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n",
            "\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_string(sse))
            .mount(&server)
            .await;

        let client = ClaudeClient::with_key(settings(), "test-key").with_base_url(server.uri());
        let chunks = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = chunks.clone();
        let reply = client
            .send_stream(
                "hi",
                Arc::new(move |c: &str| sink.lock().push(c.to_string())),
            )
            .await
            .unwrap();
        assert_eq!(reply, "hello world");
        assert_eq!(chunks.lock().len(), 2);
    }
}
