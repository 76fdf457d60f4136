//! In-memory backend shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::StatusCode;
use tokio::sync::Notify;

use intranet_messaging::backend::MessagingBackend;
use intranet_messaging::error::{ApiError, Result};
use intranet_messaging::model::{
    Conversation, ConversationId, Message, MessageId, Participant, Platform, PushToken, UserId,
};

pub const ME: UserId = UserId(1);
pub const COLLEAGUE: UserId = UserId(2);
pub const CONVERSATION: ConversationId = ConversationId(10);

pub fn participant(user: UserId) -> Participant {
    Participant {
        id: user,
        username: format!("user{}", user.0),
        display_name: None,
    }
}

pub fn message(conversation: ConversationId, id: u64, sender: UserId) -> Message {
    Message {
        id: MessageId(id),
        conversation_id: conversation,
        sender: participant(sender),
        text: format!("message {id}"),
        attachments: Vec::new(),
        read: false,
        created_at: Utc.timestamp_opt(1_700_000_000 + id as i64, 0).unwrap(),
    }
}

pub fn ids(messages: &[Message]) -> Vec<u64> {
    messages.iter().map(|message| message.id.0).collect()
}

/// Lets the spawned poll task run to its next await point. Time is paused in
/// these tests, so the sleep completes as soon as every task is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[derive(Default)]
struct State {
    conversations: HashMap<ConversationId, Conversation>,
    messages: Vec<Message>,
    tokens: Vec<PushToken>,
    scripted: VecDeque<Vec<Message>>,
    failing_reads: HashSet<MessageId>,
    fetch_failures: usize,
    failing_fetch_call: Option<usize>,
    unread_writes: Vec<(ConversationId, u32)>,
    next_message_id: u64,
    next_token_id: u64,
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<State>,
    gate: Mutex<Option<Arc<Notify>>>,
    pub fetch_calls: AtomicUsize,
    pub mark_calls: AtomicUsize,
    pub token_lookups: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let backend = Self::default();
        backend.add_conversation(CONVERSATION, &[ME, COLLEAGUE]);
        Arc::new(backend)
    }

    pub fn add_conversation(&self, id: ConversationId, members: &[UserId]) {
        let conversation = Conversation {
            id,
            group_name: None,
            participants: members.iter().copied().map(participant).collect(),
            last_message: None,
            unread_count: 0,
            updated_at: None,
        };
        self.state.lock().unwrap().conversations.insert(id, conversation);
    }

    pub fn push(&self, message: Message) {
        let mut state = self.state.lock().unwrap();
        state.next_message_id = state.next_message_id.max(message.id.0);
        state.messages.push(message);
    }

    /// Incoming messages from the colleague, with the given ids.
    pub fn push_incoming(&self, ids: impl IntoIterator<Item = u64>) {
        for id in ids {
            self.push(message(CONVERSATION, id, COLLEAGUE));
        }
    }

    /// The next `fetch_messages_after` call returns exactly this batch.
    pub fn script_fetch(&self, batch: Vec<Message>) {
        self.state.lock().unwrap().scripted.push_back(batch);
    }

    pub fn fail_next_fetches(&self, count: usize) {
        self.state.lock().unwrap().fetch_failures = count;
    }

    /// The `call`-th fetch overall (1-based) fails.
    pub fn fail_fetch_call(&self, call: usize) {
        self.state.lock().unwrap().failing_fetch_call = Some(call);
    }

    /// The next update of `id` fails; later ones succeed.
    pub fn fail_read_once(&self, id: u64) {
        self.state.lock().unwrap().failing_reads.insert(MessageId(id));
    }

    /// Holds every fetch until [`FakeBackend::release`] is called.
    pub fn hold_fetches(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Notify::new()));
    }

    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.notify_one();
        }
    }

    pub fn unread_writes(&self) -> Vec<(ConversationId, u32)> {
        self.state.lock().unwrap().unread_writes.clone()
    }

    pub fn stored_unread(&self, id: ConversationId) -> u32 {
        self.state.lock().unwrap().conversations[&id].unread_count
    }

    pub fn is_read(&self, id: u64) -> bool {
        self.state
            .lock()
            .unwrap()
            .messages
            .iter()
            .any(|message| message.id == MessageId(id) && message.read)
    }

    pub fn add_token(&self, token: &str, platform: Platform, owner: Option<UserId>) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.next_token_id += 1;
        let id = state.next_token_id;
        state.tokens.push(PushToken {
            id,
            token: token.to_string(),
            platform,
            owner,
        });
        id
    }

    pub fn tokens(&self) -> Vec<PushToken> {
        self.state.lock().unwrap().tokens.clone()
    }

    fn unread_for(state: &State, conversation: ConversationId, reader: UserId) -> Vec<Message> {
        state
            .messages
            .iter()
            .filter(|message| message.conversation_id == conversation)
            .filter(|message| !message.read && message.sender.id != reader)
            .cloned()
            .collect()
    }
}

fn not_found(what: &str) -> ApiError {
    ApiError::NotFound(what.to_string())
}

#[async_trait]
impl MessagingBackend for FakeBackend {
    async fn list_conversations(&self, user: UserId) -> Result<Vec<Conversation>> {
        let state = self.state.lock().unwrap();
        let mut conversations: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|conversation| conversation.participants.iter().any(|p| p.id == user))
            .cloned()
            .collect();
        conversations.sort_by_key(|conversation| conversation.id);
        Ok(conversations)
    }

    async fn get_conversation(&self, conversation: ConversationId) -> Result<Conversation> {
        self.state
            .lock()
            .unwrap()
            .conversations
            .get(&conversation)
            .cloned()
            .ok_or_else(|| not_found("conversation"))
    }

    async fn fetch_recent(&self, conversation: ConversationId, limit: usize) -> Result<Vec<Message>> {
        let state = self.state.lock().unwrap();
        let mut messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|message| message.conversation_id == conversation)
            .cloned()
            .collect();
        messages.sort_by_key(|message| message.id);
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.split_off(skip))
    }

    async fn fetch_messages_after(
        &self,
        conversation: ConversationId,
        after: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let call = self.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state.lock().unwrap();
        if state.failing_fetch_call == Some(call) {
            return Err(ApiError::status(StatusCode::BAD_GATEWAY, "upstream down"));
        }
        if state.fetch_failures > 0 {
            state.fetch_failures -= 1;
            return Err(ApiError::status(StatusCode::BAD_GATEWAY, "upstream down"));
        }
        if let Some(batch) = state.scripted.pop_front() {
            return Ok(batch);
        }

        let mut messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|message| message.conversation_id == conversation)
            .filter(|message| after.map_or(true, |after| message.id > after))
            .cloned()
            .collect();
        messages.sort_by_key(|message| message.id);
        messages.truncate(limit);
        Ok(messages)
    }

    async fn send_message(
        &self,
        conversation: ConversationId,
        sender: UserId,
        text: &str,
    ) -> Result<Message> {
        let mut state = self.state.lock().unwrap();
        if !state.conversations.contains_key(&conversation) {
            return Err(not_found("conversation"));
        }
        state.next_message_id += 1;
        let mut sent = message(conversation, state.next_message_id, sender);
        sent.text = text.to_string();
        sent.read = true;
        state.messages.push(sent.clone());
        if let Some(record) = state.conversations.get_mut(&conversation) {
            record.last_message = Some(sent.summary());
        }
        Ok(sent)
    }

    async fn list_unread(
        &self,
        conversation: ConversationId,
        reader: UserId,
        up_to: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let state = self.state.lock().unwrap();
        let mut unread: Vec<Message> = Self::unread_for(&state, conversation, reader)
            .into_iter()
            .filter(|message| up_to.map_or(true, |up_to| message.id <= up_to))
            .collect();
        unread.sort_by_key(|message| message.id);
        unread.truncate(limit);
        Ok(unread)
    }

    async fn count_unread(&self, conversation: ConversationId, reader: UserId) -> Result<u32> {
        let state = self.state.lock().unwrap();
        Ok(Self::unread_for(&state, conversation, reader).len() as u32)
    }

    async fn mark_message_read(&self, id: MessageId) -> Result<()> {
        self.mark_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.failing_reads.remove(&id) {
            return Err(ApiError::status(StatusCode::INTERNAL_SERVER_ERROR, "write failed"));
        }
        let message = state
            .messages
            .iter_mut()
            .find(|message| message.id == id)
            .ok_or_else(|| not_found("message"))?;
        message.read = true;
        Ok(())
    }

    async fn set_unread_count(&self, conversation: ConversationId, count: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.unread_writes.push((conversation, count));
        let record = state
            .conversations
            .get_mut(&conversation)
            .ok_or_else(|| not_found("conversation"))?;
        record.unread_count = count;
        Ok(())
    }

    async fn find_push_token(&self, token: &str) -> Result<Option<PushToken>> {
        self.token_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .lock()
            .unwrap()
            .tokens
            .iter()
            .find(|existing| existing.token == token)
            .cloned())
    }

    async fn create_push_token(
        &self,
        token: &str,
        platform: Platform,
        owner: UserId,
    ) -> Result<PushToken> {
        let id = self.add_token(token, platform, Some(owner));
        Ok(PushToken {
            id,
            token: token.to_string(),
            platform,
            owner: Some(owner),
        })
    }

    async fn assign_push_token(
        &self,
        id: u64,
        platform: Platform,
        owner: UserId,
    ) -> Result<PushToken> {
        let mut state = self.state.lock().unwrap();
        let token = state
            .tokens
            .iter_mut()
            .find(|token| token.id == id)
            .ok_or_else(|| not_found("push token"))?;
        token.platform = platform;
        token.owner = Some(owner);
        Ok(token.clone())
    }
}
