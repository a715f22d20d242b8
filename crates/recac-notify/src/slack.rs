//! Slack Web API notifier (`chat.postMessage`, `reactions.add`).

use crate::Notifier;
use async_trait::async_trait;
use recac_core::{RecacError, RecacResult};
use serde::Deserialize;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://slack.com/api";

/// Notifier backed by the Slack Web API.
pub struct SlackNotifier {
    bot_token: String,
    channel: String,
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SlackApiResponse {
    ok: bool,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl SlackNotifier {
    /// Build a notifier for `channel`, reading `SLACK_BOT_TOKEN` from the
    /// environment.
    pub fn new(channel: impl Into<String>) -> RecacResult<Self> {
        let bot_token = std::env::var("SLACK_BOT_TOKEN")
            .map_err(|_| RecacError::Config("SLACK_BOT_TOKEN is not set".into()))?;
        Ok(Self::with_token(channel, bot_token))
    }

    /// Build a notifier with an explicit bot token.
    pub fn with_token(channel: impl Into<String>, bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            channel: channel.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Override the API base URL (tests point this at a mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> RecacResult<SlackApiResponse> {
        let url = format!("{}/{method}", self.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| RecacError::Notify(format!("{method}: {e}")))?;
        let parsed: SlackApiResponse = resp
            .json()
            .await
            .map_err(|e| RecacError::Notify(format!("{method}: {e}")))?;
        if !parsed.ok {
            return Err(RecacError::Notify(format!(
                "{method} failed: {}",
                parsed.error.as_deref().unwrap_or("unknown error")
            )));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn post(&self, thread: Option<&str>, text: &str) -> RecacResult<String> {
        let mut body = serde_json::json!({
            "channel": self.channel,
            "text": text,
        });
        if let Some(ts) = thread {
            body["thread_ts"] = serde_json::json!(ts);
        }
        let resp = self.call("chat.postMessage", body).await?;
        let ts = resp
            .ts
            .ok_or_else(|| RecacError::Notify("chat.postMessage returned no ts".into()))?;
        debug!(ts = %ts, "posted notification");
        // replies keep identifying the parent thread
        Ok(thread.map(ToString::to_string).unwrap_or(ts))
    }

    async fn add_reaction(&self, thread: &str, emoji: &str) -> RecacResult<()> {
        let body = serde_json::json!({
            "channel": self.channel,
            "timestamp": thread,
            "name": emoji,
        });
        self.call("reactions.add", body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_post_starts_thread() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .and(body_partial_json(serde_json::json!({"channel": "C123"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true, "ts": "1712.0001"
            })))
            .mount(&server)
            .await;

        let notifier = SlackNotifier::with_token("C123", "xoxb-test").with_base_url(server.uri());
        let ts = notifier.post(None, "session started").await.unwrap();
        assert_eq!(ts, "1712.0001");
    }

    #[tokio::test]
    async fn test_reply_keeps_parent_thread() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .and(body_partial_json(
                serde_json::json!({"thread_ts": "1712.0001"}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true, "ts": "1712.0002"
            })))
            .mount(&server)
            .await;

        let notifier = SlackNotifier::with_token("C123", "xoxb-test").with_base_url(server.uri());
        let ts = notifier.post(Some("1712.0001"), "progress").await.unwrap();
        assert_eq!(ts, "1712.0001");
    }

    #[tokio::test]
    async fn test_api_error_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": false, "error": "channel_not_found"
            })))
            .mount(&server)
            .await;

        let notifier = SlackNotifier::with_token("C404", "xoxb-test").with_base_url(server.uri());
        let err = notifier.post(None, "hello").await.unwrap_err();
        assert!(err.to_string().contains("channel_not_found"));
    }

    #[tokio::test]
    async fn test_add_reaction() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/reactions.add"))
            .and(body_partial_json(serde_json::json!({"name": "x"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})),
            )
            .mount(&server)
            .await;

        let notifier = SlackNotifier::with_token("C123", "xoxb-test").with_base_url(server.uri());
        notifier.add_reaction("1712.0001", "x").await.unwrap();
    }
}
