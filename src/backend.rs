//! The seam between the sync core and the CMS that stores conversations.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{Conversation, ConversationId, Message, MessageId, Platform, PushToken, UserId};

/// Result of one "mark read up to" pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadPass {
    /// Messages the pass tried to flip.
    pub attempted: usize,
    pub marked: usize,
    /// Messages whose update failed; they stay unread until the next pass.
    pub failed: Vec<MessageId>,
}

#[async_trait]
pub trait MessagingBackend: Send + Sync {
    async fn list_conversations(&self, user: UserId) -> Result<Vec<Conversation>>;

    async fn get_conversation(&self, conversation: ConversationId) -> Result<Conversation>;

    /// The newest `limit` messages, oldest first.
    async fn fetch_recent(
        &self,
        conversation: ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>>;

    /// Messages with an id strictly greater than `after`, oldest first.
    async fn fetch_messages_after(
        &self,
        conversation: ConversationId,
        after: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>>;

    /// Creates the message and updates the conversation's last-message summary.
    async fn send_message(
        &self,
        conversation: ConversationId,
        sender: UserId,
        text: &str,
    ) -> Result<Message>;

    /// Unread messages not sent by `reader`, oldest first, optionally capped at `up_to`.
    async fn list_unread(
        &self,
        conversation: ConversationId,
        reader: UserId,
        up_to: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>>;

    async fn count_unread(&self, conversation: ConversationId, reader: UserId) -> Result<u32>;

    /// Idempotent: marking an already-read message succeeds.
    async fn mark_message_read(&self, message: MessageId) -> Result<()>;

    async fn set_unread_count(&self, conversation: ConversationId, count: u32) -> Result<()>;

    /// Marks everything `reader` has not read in `conversation`, up to and
    /// including `up_to`, as read.
    ///
    /// The default walks the unread list and flips one message at a time;
    /// backends with a server-side batch route override it.
    async fn mark_read_up_to(
        &self,
        conversation: ConversationId,
        reader: UserId,
        up_to: Option<MessageId>,
        limit: usize,
    ) -> Result<ReadPass> {
        mark_each_read(self, conversation, reader, up_to, limit).await
    }

    async fn find_push_token(&self, token: &str) -> Result<Option<PushToken>>;

    async fn create_push_token(
        &self,
        token: &str,
        platform: Platform,
        owner: UserId,
    ) -> Result<PushToken>;

    async fn assign_push_token(
        &self,
        id: u64,
        platform: Platform,
        owner: UserId,
    ) -> Result<PushToken>;
}

/// Flips each unread message individually, in id order.
///
/// A failed update is logged and recorded in [`ReadPass::failed`]; it does
/// not stop the pass and nothing already marked is rolled back.
pub async fn mark_each_read<B>(
    backend: &B,
    conversation: ConversationId,
    reader: UserId,
    up_to: Option<MessageId>,
    limit: usize,
) -> Result<ReadPass>
where
    B: MessagingBackend + ?Sized,
{
    let unread = backend
        .list_unread(conversation, reader, up_to, limit)
        .await?;
    let mut pass = ReadPass {
        attempted: unread.len(),
        ..ReadPass::default()
    };

    for message in unread {
        match backend.mark_message_read(message.id).await {
            Ok(()) => pass.marked += 1,
            Err(err) => {
                warn!(%conversation, message = %message.id, ?err, "failed to mark message read");
                pass.failed.push(message.id);
            }
        }
    }

    debug!(
        %conversation,
        attempted = pass.attempted,
        marked = pass.marked,
        "per-message read pass finished"
    );
    Ok(pass)
}
