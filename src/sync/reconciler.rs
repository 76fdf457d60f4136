//! Re-derives a conversation's read state from the server.
//!
//! The unread counter on the conversation record is only ever written here,
//! and always with a count read back from the server after the read pass.

use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::MessagingBackend;
use crate::error::Result;
use crate::model::{ConversationId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub conversation: ConversationId,
    pub marked: usize,
    pub failed: Vec<MessageId>,
    /// Value written to the conversation's unread counter.
    pub unread_count: u32,
}

impl Reconciliation {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.unread_count == 0
    }
}

#[derive(Clone)]
pub struct ReadReconciler {
    backend: Arc<dyn MessagingBackend>,
    reader: UserId,
    limit: usize,
}

impl ReadReconciler {
    pub fn new(backend: Arc<dyn MessagingBackend>, reader: UserId, limit: usize) -> Self {
        Self {
            backend,
            reader,
            limit: limit.max(1),
        }
    }

    /// Marks what `reader` has not read in `conversation` (up to `up_to`
    /// when given) and writes the remaining unread count back.
    ///
    /// Updates that fail are left for the next pass; nothing is rolled back.
    pub async fn reconcile(
        &self,
        conversation: ConversationId,
        up_to: Option<MessageId>,
    ) -> Result<Reconciliation> {
        let pass = self
            .backend
            .mark_read_up_to(conversation, self.reader, up_to, self.limit)
            .await?;

        let unread_count = match self.backend.count_unread(conversation, self.reader).await {
            Ok(count) => count,
            Err(err) => {
                warn!(%conversation, ?err, "unread recount failed; using pass result");
                pass.failed.len() as u32
            }
        };
        self.backend
            .set_unread_count(conversation, unread_count)
            .await?;

        if pass.failed.is_empty() {
            info!(%conversation, marked = pass.marked, unread_count, "conversation reconciled");
        } else {
            warn!(
                %conversation,
                marked = pass.marked,
                failed = pass.failed.len(),
                unread_count,
                "conversation partially reconciled"
            );
        }

        Ok(Reconciliation {
            conversation,
            marked: pass.marked,
            failed: pass.failed,
            unread_count,
        })
    }
}
