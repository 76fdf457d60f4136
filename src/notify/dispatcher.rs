//! Decides whether an incoming push becomes an OS notification.
//!
//! The same push can arrive twice: once through the foreground message
//! channel while a page is open, and once through the background push
//! channel. Both paths go through one [`NotificationDispatcher`], which
//! shows a given tag at most once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ApiError, Result};
use crate::model::ConversationId;
use crate::notify::payload::{ClientEnvelope, NotificationOptions, PushPayload};
use crate::notify::seen::SeenKeys;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Foreground,
    Background,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Shown { tag: String },
    /// Key already handled by this dispatcher; dropped silently.
    Duplicate { tag: String },
    /// The tray already holds a notification with this tag.
    AlreadyDisplayed { tag: String },
    /// Notifications are disabled after a permission refusal.
    Suppressed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickTarget {
    Conversation(ConversationId),
    Route(String),
    Home,
}

/// The OS notification tray.
#[async_trait]
pub trait NotificationTray: Send + Sync {
    async fn has_tag(&self, tag: &str) -> Result<bool>;

    /// Returns [`ApiError::PermissionDenied`] when the user refused notifications.
    async fn show(&self, options: &NotificationOptions) -> Result<()>;
}

/// Open page clients that receive `postMessage` envelopes.
#[async_trait]
pub trait ClientChannel: Send + Sync {
    async fn post(&self, envelope: ClientEnvelope) -> Result<()>;
}

/// Navigation capability handed to click handling.
#[async_trait]
pub trait Navigator: Send + Sync {
    async fn open_conversation(&self, conversation: ConversationId) -> Result<()>;

    async fn open_route(&self, route: &str) -> Result<()>;

    async fn open_home(&self) -> Result<()>;
}

pub struct NotificationDispatcher {
    seen: Mutex<SeenKeys>,
    tray: Arc<dyn NotificationTray>,
    clients: Arc<dyn ClientChannel>,
    disabled: AtomicBool,
}

impl NotificationDispatcher {
    pub fn new(
        capacity: usize,
        tray: Arc<dyn NotificationTray>,
        clients: Arc<dyn ClientChannel>,
    ) -> Self {
        Self {
            seen: Mutex::new(SeenKeys::with_capacity(capacity)),
            tray,
            clients,
            disabled: AtomicBool::new(false),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub async fn seen_len(&self) -> usize {
        self.seen.lock().await.len()
    }

    pub async fn dispatch(&self, payload: &PushPayload, channel: Channel) -> Result<Dispatch> {
        let options = payload.to_options();
        let tag = options.tag.clone();

        // Claimed under the lock so the two channels cannot both get past
        // this point for the same push.
        if !self.seen.lock().await.insert(&tag) {
            debug!(%tag, ?channel, "duplicate notification dropped");
            return Ok(Dispatch::Duplicate { tag });
        }

        if channel == Channel::Foreground {
            // Page clients render their own in-app banner regardless of the tray.
            if let Err(err) = self
                .clients
                .post(ClientEnvelope::ForegroundNotification {
                    payload: payload.clone(),
                })
                .await
            {
                debug!(?err, "no page client accepted the foreground notification");
            }
        }

        if self.is_disabled() {
            return Ok(Dispatch::Suppressed);
        }

        match self.tray.has_tag(&tag).await {
            Ok(true) => {
                debug!(%tag, ?channel, "notification already in tray");
                return Ok(Dispatch::AlreadyDisplayed { tag });
            }
            Ok(false) => {}
            Err(err) => warn!(%tag, ?err, "tray lookup failed; showing anyway"),
        }

        match self.tray.show(&options).await {
            Ok(()) => {
                info!(%tag, ?channel, "notification shown");
                Ok(Dispatch::Shown { tag })
            }
            Err(ApiError::PermissionDenied(reason)) => {
                self.disabled.store(true, Ordering::Release);
                info!(%reason, "notification permission denied; notifications disabled");
                Ok(Dispatch::Suppressed)
            }
            Err(err) => {
                // Let a redelivery try again.
                self.seen.lock().await.remove(&tag);
                Err(err)
            }
        }
    }

    /// Tells page clients about the click and navigates to what the
    /// notification points at.
    pub async fn handle_click(
        &self,
        notification: &NotificationOptions,
        navigator: &dyn Navigator,
    ) -> Result<ClickTarget> {
        if let Err(err) = self
            .clients
            .post(ClientEnvelope::NotificationClick {
                notification: notification.clone(),
            })
            .await
        {
            debug!(?err, "no page client accepted the click");
        }

        let payload = PushPayload {
            data: notification.data.clone(),
            ..PushPayload::default()
        };
        let target = match payload.conversation() {
            Some(conversation) => ClickTarget::Conversation(conversation),
            None => match notification.data.get("screen").and_then(|value| value.as_str()) {
                Some(route) if !route.trim().is_empty() => {
                    ClickTarget::Route(route.trim().to_string())
                }
                _ => ClickTarget::Home,
            },
        };

        match &target {
            ClickTarget::Conversation(conversation) => {
                navigator.open_conversation(*conversation).await?
            }
            ClickTarget::Route(route) => navigator.open_route(route).await?,
            ClickTarget::Home => navigator.open_home().await?,
        }

        debug!(tag = %notification.tag, ?target, "notification click handled");
        Ok(target)
    }
}
