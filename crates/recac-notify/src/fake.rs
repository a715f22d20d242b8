//! Recording notifier for tests.

use crate::Notifier;
use async_trait::async_trait;
use parking_lot::Mutex;
use recac_core::RecacResult;
use std::sync::Arc;

/// Recorded notification call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyCall {
    /// A posted message with its thread (if replying) and text.
    Post(Option<String>, String),
    /// A reaction with its thread and emoji.
    Reaction(String, String),
}

/// Notifier that records every call and returns a fixed thread id.
#[derive(Clone, Default)]
pub struct FakeNotifier {
    calls: Arc<Mutex<Vec<NotifyCall>>>,
}

impl FakeNotifier {
    /// New empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<NotifyCall> {
        self.calls.lock().clone()
    }

    /// Texts of every posted message.
    pub fn posts(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                NotifyCall::Post(_, text) => Some(text.clone()),
                NotifyCall::Reaction(_, _) => None,
            })
            .collect()
    }

    /// Emojis of every reaction.
    pub fn reactions(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                NotifyCall::Reaction(_, emoji) => Some(emoji.clone()),
                NotifyCall::Post(_, _) => None,
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn post(&self, thread: Option<&str>, text: &str) -> RecacResult<String> {
        self.calls.lock().push(NotifyCall::Post(
            thread.map(ToString::to_string),
            text.to_string(),
        ));
        Ok(thread.unwrap_or("fake-thread").to_string())
    }

    async fn add_reaction(&self, thread: &str, emoji: &str) -> RecacResult<()> {
        self.calls
            .lock()
            .push(NotifyCall::Reaction(thread.to_string(), emoji.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_posts_and_reactions() {
        let notifier = FakeNotifier::new();
        let ts = notifier.post(None, "started").await.unwrap();
        notifier.post(Some(&ts), "progress").await.unwrap();
        notifier.add_reaction(&ts, "x").await.unwrap();

        assert_eq!(notifier.posts(), vec!["started", "progress"]);
        assert_eq!(notifier.reactions(), vec!["x"]);
    }
}
