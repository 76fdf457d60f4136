use std::collections::HashSet;

use crate::model::{ConversationId, Message, MessageId};

/// The visible message list of one conversation plus its watermark.
#[derive(Debug, Clone)]
pub struct ConversationFeed {
    conversation: ConversationId,
    messages: Vec<Message>,
    seen: HashSet<MessageId>,
    watermark: Option<MessageId>,
}

impl ConversationFeed {
    pub fn new(conversation: ConversationId) -> Self {
        Self {
            conversation,
            messages: Vec::new(),
            seen: HashSet::new(),
            watermark: None,
        }
    }

    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Highest message id merged so far.
    pub fn watermark(&self) -> Option<MessageId> {
        self.watermark
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Merges a polled batch and returns the messages that were not already
    /// present, in id order.
    ///
    /// Messages belonging to another conversation are ignored. The watermark
    /// only ever moves forward.
    pub fn merge(&mut self, batch: impl IntoIterator<Item = Message>) -> Vec<Message> {
        let mut appended: Vec<Message> = batch
            .into_iter()
            .filter(|message| message.conversation_id == self.conversation)
            .filter(|message| self.seen.insert(message.id))
            .collect();

        if appended.is_empty() {
            return appended;
        }
        appended.sort_by_key(|message| message.id);

        // A late message older than the tail is rare; keep the list ordered.
        let needs_sort = match (self.messages.last(), appended.first()) {
            (Some(tail), Some(head)) => head.id < tail.id,
            _ => false,
        };
        self.messages.extend(appended.iter().cloned());
        if needs_sort {
            self.messages.sort_by_key(|message| message.id);
        }

        let batch_max = appended.last().map(|message| message.id);
        self.watermark = self.watermark.max(batch_max);
        appended
    }

    /// Messages with an id strictly greater than `after`.
    pub fn since(&self, after: Option<MessageId>) -> &[Message] {
        match after {
            None => &self.messages,
            Some(after) => {
                let start = self.messages.partition_point(|message| message.id <= after);
                &self.messages[start..]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::{Participant, UserId};

    fn message(conversation: u64, id: u64) -> Message {
        Message {
            id: MessageId(id),
            conversation_id: ConversationId(conversation),
            sender: Participant {
                id: UserId(2),
                username: "ana".into(),
                display_name: None,
            },
            text: format!("message {id}"),
            attachments: Vec::new(),
            read: false,
            created_at: Utc::now(),
        }
    }

    fn ids(messages: &[Message]) -> Vec<u64> {
        messages.iter().map(|message| message.id.0).collect()
    }

    #[test]
    fn overlapping_batches_merge_without_duplicates() {
        let mut feed = ConversationFeed::new(ConversationId(1));

        let first = feed.merge([1, 2, 3].map(|id| message(1, id)));
        assert_eq!(ids(&first), vec![1, 2, 3]);
        assert_eq!(feed.watermark(), Some(MessageId(3)));

        let second = feed.merge([2, 3, 4].map(|id| message(1, id)));
        assert_eq!(ids(&second), vec![4]);
        assert_eq!(ids(feed.messages()), vec![1, 2, 3, 4]);
        assert_eq!(feed.watermark(), Some(MessageId(4)));
    }

    #[test]
    fn merging_same_batch_twice_is_a_no_op() {
        let mut feed = ConversationFeed::new(ConversationId(1));
        feed.merge([5, 6].map(|id| message(1, id)));
        assert!(feed.merge([5, 6].map(|id| message(1, id))).is_empty());
        assert_eq!(feed.len(), 2);
    }

    #[test]
    fn watermark_never_moves_back() {
        let mut feed = ConversationFeed::new(ConversationId(1));
        feed.merge([10].map(|id| message(1, id)));
        let late = feed.merge([7, 3].map(|id| message(1, id)));

        assert_eq!(ids(&late), vec![3, 7]);
        assert_eq!(feed.watermark(), Some(MessageId(10)));
        assert_eq!(ids(feed.messages()), vec![3, 7, 10]);
    }

    #[test]
    fn ignores_other_conversations() {
        let mut feed = ConversationFeed::new(ConversationId(1));
        let appended = feed.merge(vec![message(2, 1), message(1, 2)]);
        assert_eq!(ids(&appended), vec![2]);
    }

    #[test]
    fn arbitrary_batches_keep_ids_unique_and_watermark_monotonic() {
        let batches: Vec<Vec<u64>> = vec![
            vec![4, 1, 4],
            vec![],
            vec![2, 9, 3],
            vec![9, 9, 8],
            vec![1],
            vec![12, 11, 10],
        ];
        let mut feed = ConversationFeed::new(ConversationId(1));
        let mut last_watermark = None;

        for batch in batches {
            feed.merge(batch.into_iter().map(|id| message(1, id)));

            let listed = ids(feed.messages());
            let mut unique = listed.clone();
            unique.dedup();
            assert_eq!(listed, unique);
            assert!(listed.windows(2).all(|pair| pair[0] < pair[1]));

            assert!(feed.watermark() >= last_watermark);
            last_watermark = feed.watermark();
        }

        assert_eq!(feed.len(), 9);
        assert_eq!(feed.watermark(), Some(MessageId(12)));
    }

    #[test]
    fn since_returns_tail_after_id() {
        let mut feed = ConversationFeed::new(ConversationId(1));
        feed.merge([1, 2, 3, 4].map(|id| message(1, id)));
        assert_eq!(ids(feed.since(Some(MessageId(2)))), vec![3, 4]);
        assert_eq!(ids(feed.since(None)).len(), 4);
        assert!(feed.since(Some(MessageId(4))).is_empty());
    }
}
