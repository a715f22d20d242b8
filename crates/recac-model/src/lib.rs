//! Model provider clients.
//!
//! The control plane talks to providers through the [`ModelClient`]
//! capability: a blocking `send` and a chunked `send_stream`. Two backends
//! are provided — the Anthropic messages API ([`ClaudeClient`]) and the
//! OpenRouter chat-completions API ([`OpenRouterClient`]) — plus a scripted
//! [`FakeModelClient`] for tests.
//!
//! Transient network failures are retried inside the clients with linear
//! backoff; retry exhaustion surfaces as a model error to the caller.

mod claude;
mod fake;
mod openrouter;

pub use claude::ClaudeClient;
pub use fake::FakeModelClient;
pub use openrouter::OpenRouterClient;

use async_trait::async_trait;
use recac_core::RecacResult;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked with each streamed text chunk.
pub type ChunkCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Capability for sending prompts to a language model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Send a prompt and return the full reply text.
    async fn send(&self, prompt: &str) -> RecacResult<String>;

    /// Send a prompt, invoking `on_chunk` as text arrives.
    ///
    /// Returns the full reply. The default forwards to [`ModelClient::send`]
    /// and delivers the reply as one chunk; providers with server-side
    /// streaming override this.
    async fn send_stream(&self, prompt: &str, on_chunk: ChunkCallback) -> RecacResult<String> {
        let reply = self.send(prompt).await?;
        on_chunk(&reply);
        Ok(reply)
    }
}

/// Retry policy for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Backoff unit; attempt N sleeps `N * backoff`, capped at `max_backoff`.
    pub backoff: Duration,
    /// Per-attempt backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Sleep duration before retrying after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        (self.backoff * attempt).min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_is_linear_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(5));
        assert_eq!(policy.delay(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_default_stream_delivers_one_chunk() {
        let client = FakeModelClient::with_replies(vec!["hello".into()]);
        let chunks = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = chunks.clone();
        let reply = client
            .send_stream(
                "hi",
                Arc::new(move |c: &str| sink.lock().push(c.to_string())),
            )
            .await
            .unwrap();
        assert_eq!(reply, "hello");
        assert_eq!(*chunks.lock(), vec!["hello".to_string()]);
    }
}
