//! OpenRouter chat-completions backend (OpenAI-compatible wire format).

use crate::{ModelClient, RetryPolicy};
use async_trait::async_trait;
use recac_core::config::ModelSettings;
use recac_core::{RecacError, RecacResult};
use tracing::warn;

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api";

/// Client for the OpenRouter chat-completions API.
pub struct OpenRouterClient {
    settings: ModelSettings,
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
    http: reqwest::Client,
}

impl OpenRouterClient {
    /// Build a client from settings, reading `OPENROUTER_API_KEY` from the
    /// environment.
    pub fn new(settings: ModelSettings) -> RecacResult<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| RecacError::Config("OPENROUTER_API_KEY is not set".into()))?;
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

    async fn send_once(&self, prompt: &str) -> Result<String, (RecacError, bool)> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.settings.model_id,
            "max_tokens": self.settings.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });

        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| (RecacError::Model(e.to_string()), true))?;

        let status = resp.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err((
                RecacError::Model(format!("OpenRouter API error {status}")),
                true,
            ));
        }
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err((
                RecacError::Model(format!("OpenRouter API error {status}: {detail}")),
                false,
            ));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| (RecacError::Model(e.to_string()), true))?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| {
                (
                    RecacError::Model("missing content in OpenRouter response".into()),
                    false,
                )
            })
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    async fn send(&self, prompt: &str) -> RecacResult<String> {
        let mut last_err = RecacError::Model("no attempts made".into());
        for attempt in 1..=self.retry.attempts {
            match self.send_once(prompt).await {
                Ok(reply) => return Ok(reply),
                Err((e, retryable)) => {
                    warn!(attempt, error = %e, "OpenRouter request failed");
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings() -> ModelSettings {
        ModelSettings {
            model_id: "qwen/qwen-2.5-coder-32b".into(),
            ..ModelSettings::default()
        }
    }

    #[tokio::test]
    async fn test_send_parses_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "patch applied"},
                             "finish_reason": "stop"}]
            })))
            .mount(&server)
            .await;

        let client = OpenRouterClient::with_key(settings(), "test-key").with_base_url(server.uri());
        assert_eq!(client.send("fix the bug").await.unwrap(), "patch applied");
    }

    #[tokio::test]
    async fn test_missing_content_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": []
            })))
            .mount(&server)
            .await;

        let client = OpenRouterClient::with_key(settings(), "test-key").with_base_url(server.uri());
        let err = client.send("fix the bug").await.unwrap_err();
        assert!(err.to_string().contains("missing content"));
    }
}
