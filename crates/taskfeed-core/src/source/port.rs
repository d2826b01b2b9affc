use async_trait::async_trait;

use crate::{
    domain::{ChannelId, ChatMessage, MessageId},
    Result,
};

/// Hexagonal port for reading channel history.
///
/// One call returns at most `limit` messages strictly older than `before`
/// (or the newest messages when `before` is `None`), in the platform's order.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch_page(
        &self,
        channel: &ChannelId,
        limit: u32,
        before: Option<&MessageId>,
    ) -> Result<Vec<ChatMessage>>;
}
