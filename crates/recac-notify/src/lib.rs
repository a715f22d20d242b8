//! Chat notification capability.
//!
//! Each project gets one thread in the configured channel; session progress
//! and terminal outcomes are posted as replies, and budget failures add an
//! `x` reaction to the thread root. The capability is deliberately small so
//! a ticket system could implement it as well.

mod fake;
mod noop;
mod slack;

pub use fake::{FakeNotifier, NotifyCall};
pub use noop::NoopNotifier;
pub use slack::SlackNotifier;

use async_trait::async_trait;
use recac_core::RecacResult;

/// Reaction added to the thread on successful delivery.
pub const REACTION_SUCCESS: &str = "white_check_mark";
/// Reaction added to the thread on a budget failure.
pub const REACTION_FAILURE: &str = "x";

/// The notifier capability.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Post `text`; replies into `thread` when given, otherwise starts a new
    /// thread. Returns the thread timestamp identifying the thread.
    async fn post(&self, thread: Option<&str>, text: &str) -> RecacResult<String>;

    /// Add an emoji reaction to the message at `thread`.
    async fn add_reaction(&self, thread: &str, emoji: &str) -> RecacResult<()>;
}
