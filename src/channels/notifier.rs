//! Notifier — outbound delivery of one content item to one entity.

use async_trait::async_trait;

use crate::error::ChannelError;

/// Delivers a single nudge through an external chat platform.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name (e.g. "telegram").
    fn name(&self) -> &str;

    /// Deliver the content identified by `content_ref` to `entity_id`.
    ///
    /// Called by the dispatcher only after the live stage was re-checked.
    async fn send(&self, entity_id: &str, content_ref: &str) -> Result<(), ChannelError>;
}
