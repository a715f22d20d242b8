//! Scripted model client for deterministic testing.

use crate::ModelClient;
use async_trait::async_trait;
use parking_lot::Mutex;
use recac_core::{RecacError, RecacResult};
use std::collections::VecDeque;
use std::sync::Arc;

/// A model client that returns pre-scripted replies in order and records
/// every prompt it receives.
#[derive(Clone, Default)]
pub struct FakeModelClient {
    inner: Arc<Mutex<FakeState>>,
}

#[derive(Default)]
struct FakeState {
    replies: VecDeque<String>,
    prompts: Vec<String>,
    error: Option<String>,
}

impl FakeModelClient {
    /// Client with no scripted replies; every send fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Client that plays back `replies` in order.
    pub fn with_replies(replies: Vec<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeState {
                replies: replies.into(),
                prompts: Vec::new(),
                error: None,
            })),
        }
    }

    /// Queue another reply.
    pub fn push_reply(&self, reply: impl Into<String>) {
        self.inner.lock().replies.push_back(reply.into());
    }

    /// Make every subsequent send fail with the given message.
    pub fn fail_with(&self, message: impl Into<String>) {
        self.inner.lock().error = Some(message.into());
    }

    /// Every prompt received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.inner.lock().prompts.clone()
    }

    /// Number of sends issued.
    pub fn call_count(&self) -> usize {
        self.inner.lock().prompts.len()
    }
}

#[async_trait]
impl ModelClient for FakeModelClient {
    async fn send(&self, prompt: &str) -> RecacResult<String> {
        let mut state = self.inner.lock();
        state.prompts.push(prompt.to_string());
        if let Some(msg) = &state.error {
            return Err(RecacError::Model(msg.clone()));
        }
        state
            .replies
            .pop_front()
            .ok_or_else(|| RecacError::Model("fake client ran out of replies".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_in_order() {
        let client = FakeModelClient::with_replies(vec!["one".into(), "two".into()]);
        assert_eq!(client.send("a").await.unwrap(), "one");
        assert_eq!(client.send("b").await.unwrap(), "two");
        assert!(client.send("c").await.is_err());
        assert_eq!(client.prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let client = FakeModelClient::with_replies(vec!["unused".into()]);
        client.fail_with("connection reset");
        let err = client.send("a").await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(client.call_count(), 1);
    }
}
