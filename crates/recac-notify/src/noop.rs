//! No-op notifier used when no chat integration is configured.

use crate::Notifier;
use async_trait::async_trait;
use recac_core::RecacResult;

/// Notifier that discards everything and hands out a synthetic thread id.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn post(&self, thread: Option<&str>, _text: &str) -> RecacResult<String> {
        Ok(thread.unwrap_or("noop-thread").to_string())
    }

    async fn add_reaction(&self, _thread: &str, _emoji: &str) -> RecacResult<()> {
        Ok(())
    }
}
