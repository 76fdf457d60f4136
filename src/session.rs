//! One signed-in user's messaging session.
//!
//! At most one conversation is open at a time. Opening it loads the recent
//! history, reconciles read state and starts its poller; closing it (or
//! opening another) stops the poller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::backend::MessagingBackend;
use crate::error::{ApiError, Result};
use crate::model::{Conversation, ConversationId, Message, MessageId, Platform, UserId};
use crate::notify::{
    Channel, ClickTarget, ClientChannel, Dispatch, Navigator, NotificationDispatcher,
    NotificationOptions, NotificationTray, PushPayload,
};
use crate::settings::Settings;
use crate::sync::{
    ConversationFeed, FeedEvent, PollOutcome, Poller, PollerConfig, ReadReconciler,
    Reconciliation, Registration, TokenRegistrar,
};

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub user: UserId,
    pub poll_interval: Duration,
    pub page_size: usize,
    pub reconcile_limit: usize,
    pub dedup_capacity: usize,
}

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            user: settings.user_id,
            poll_interval: settings.poll_interval(),
            page_size: settings.page_size,
            reconcile_limit: settings.reconcile_limit,
            dedup_capacity: settings.dedup_capacity,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenedConversation {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    /// `None` when reconciliation failed; it is retried on the next read.
    pub reconciliation: Option<Reconciliation>,
}

#[derive(Debug, Clone)]
pub struct NewMessages {
    pub conversation: ConversationId,
    pub messages: Vec<Message>,
    pub watermark: Option<MessageId>,
}

struct ActiveConversation {
    poller: Poller,
    /// Last message handed out by [`MessagingSession::read_new_messages`].
    delivered: Option<MessageId>,
    reconciled: bool,
}

pub struct MessagingSession {
    backend: Arc<dyn MessagingBackend>,
    config: SessionConfig,
    reconciler: ReadReconciler,
    registrar: TokenRegistrar,
    dispatcher: NotificationDispatcher,
    active: Mutex<Option<ActiveConversation>>,
}

impl MessagingSession {
    pub fn new(
        backend: Arc<dyn MessagingBackend>,
        config: SessionConfig,
        tray: Arc<dyn NotificationTray>,
        clients: Arc<dyn ClientChannel>,
    ) -> Self {
        Self {
            reconciler: ReadReconciler::new(
                Arc::clone(&backend),
                config.user,
                config.reconcile_limit,
            ),
            registrar: TokenRegistrar::new(Arc::clone(&backend), config.user),
            dispatcher: NotificationDispatcher::new(config.dedup_capacity, tray, clients),
            backend,
            config,
            active: Mutex::new(None),
        }
    }

    pub fn user(&self) -> UserId {
        self.config.user
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.backend.list_conversations(self.config.user).await
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.poller.conversation())
    }

    pub async fn open_conversation(
        &self,
        conversation: ConversationId,
    ) -> Result<OpenedConversation> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.poller.stop();
        }

        let details = self.backend.get_conversation(conversation).await?;
        let recent = self
            .backend
            .fetch_recent(conversation, self.config.page_size)
            .await?;

        let mut feed = ConversationFeed::new(conversation);
        let messages = feed.merge(recent);
        let watermark = feed.watermark();

        let reconciliation = match self.reconciler.reconcile(conversation, watermark).await {
            Ok(reconciliation) => Some(reconciliation),
            Err(err) => {
                warn!(%conversation, ?err, "read reconciliation failed on open");
                None
            }
        };

        let poller = Poller::start(
            Arc::clone(&self.backend),
            feed,
            PollerConfig {
                interval: self.config.poll_interval,
                page_size: self.config.page_size,
            },
        );
        *active = Some(ActiveConversation {
            poller,
            delivered: watermark,
            reconciled: reconciliation
                .as_ref()
                .is_some_and(Reconciliation::is_complete),
        });

        info!(%conversation, loaded = messages.len(), "conversation opened");
        Ok(OpenedConversation {
            conversation: details,
            messages,
            reconciliation,
        })
    }

    pub async fn close_conversation(&self) -> Option<ConversationId> {
        let closed = self.active.lock().await.take()?;
        closed.poller.stop();
        let conversation = closed.poller.conversation();
        info!(%conversation, "conversation closed");
        Some(conversation)
    }

    pub async fn subscribe_feed(&self) -> Option<broadcast::Receiver<FeedEvent>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.poller.subscribe())
    }

    /// Messages that arrived in the open conversation since the last call.
    ///
    /// Triggers a poll first; a poll failure is logged and whatever the
    /// background loop already collected is returned.
    pub async fn read_new_messages(&self) -> Result<NewMessages> {
        let mut guard = self.active.lock().await;
        let active = guard
            .as_mut()
            .ok_or_else(|| ApiError::validation("no conversation is open"))?;
        let conversation = active.poller.conversation();

        match active.poller.poll_now().await {
            Ok(PollOutcome::Skipped) => debug!(%conversation, "poll already running"),
            Ok(_) => {}
            Err(err) => warn!(%conversation, ?err, "poll failed; returning buffered messages"),
        }

        let (messages, watermark) = {
            let feed = active.poller.feed();
            let feed = feed.lock().await;
            (feed.since(active.delivered).to_vec(), feed.watermark())
        };
        active.delivered = watermark.max(active.delivered);

        let incoming = messages
            .iter()
            .any(|message| message.sender.id != self.config.user);
        if incoming || !active.reconciled {
            match self.reconciler.reconcile(conversation, watermark).await {
                Ok(reconciliation) => active.reconciled = reconciliation.is_complete(),
                Err(err) => {
                    active.reconciled = false;
                    warn!(%conversation, ?err, "read reconciliation failed");
                }
            }
        }

        Ok(NewMessages {
            conversation,
            messages,
            watermark,
        })
    }

    pub async fn send_message(&self, conversation: ConversationId, text: &str) -> Result<Message> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ApiError::validation("message text must not be empty"));
        }

        let message = self
            .backend
            .send_message(conversation, self.config.user, text)
            .await?;

        let active = self.active.lock().await;
        if let Some(active) = active
            .as_ref()
            .filter(|active| active.poller.conversation() == conversation)
        {
            active.poller.feed().lock().await.merge([message.clone()]);
        }
        Ok(message)
    }

    pub async fn register_push_token(
        &self,
        token: &str,
        platform: Platform,
    ) -> Result<Registration> {
        self.registrar.register(token, platform).await
    }

    pub async fn dispatch_notification(
        &self,
        payload: &PushPayload,
        channel: Channel,
    ) -> Result<Dispatch> {
        self.dispatcher.dispatch(payload, channel).await
    }

    /// Handles a click with this session as the navigator: a conversation
    /// target opens it, anything else closes the open one.
    pub async fn open_notification(
        &self,
        notification: &NotificationOptions,
    ) -> Result<ClickTarget> {
        self.dispatcher.handle_click(notification, self).await
    }
}

#[async_trait]
impl Navigator for MessagingSession {
    async fn open_conversation(&self, conversation: ConversationId) -> Result<()> {
        MessagingSession::open_conversation(self, conversation)
            .await
            .map(|_| ())
    }

    async fn open_route(&self, route: &str) -> Result<()> {
        debug!(%route, "route navigation requested; closing open conversation");
        self.close_conversation().await;
        Ok(())
    }

    async fn open_home(&self) -> Result<()> {
        self.close_conversation().await;
        Ok(())
    }
}
