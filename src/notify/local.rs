//! In-process tray and client channel for hosts without a desktop tray.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{ApiError, Result};
use crate::notify::dispatcher::{ClientChannel, NotificationTray};
use crate::notify::payload::{ClientEnvelope, NotificationOptions};

/// Keeps the most recent notifications in memory, newest last.
pub struct MemoryTray {
    limit: usize,
    shown: Mutex<VecDeque<NotificationOptions>>,
    permitted: bool,
}

impl MemoryTray {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            shown: Mutex::new(VecDeque::new()),
            permitted: true,
        }
    }

    /// A tray whose permission prompt was refused.
    pub fn denied() -> Self {
        Self {
            permitted: false,
            ..Self::new(1)
        }
    }

    pub fn shown(&self) -> Vec<NotificationOptions> {
        let shown = self.shown.lock().unwrap_or_else(PoisonError::into_inner);
        shown.iter().cloned().collect()
    }

    pub fn dismiss(&self, tag: &str) {
        let mut shown = self.shown.lock().unwrap_or_else(PoisonError::into_inner);
        shown.retain(|options| options.tag != tag);
    }
}

#[async_trait]
impl NotificationTray for MemoryTray {
    async fn has_tag(&self, tag: &str) -> Result<bool> {
        let shown = self.shown.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(shown.iter().any(|options| options.tag == tag))
    }

    async fn show(&self, options: &NotificationOptions) -> Result<()> {
        if !self.permitted {
            return Err(ApiError::PermissionDenied("notifications".to_string()));
        }
        let mut shown = self.shown.lock().unwrap_or_else(PoisonError::into_inner);
        if shown.len() == self.limit {
            shown.pop_front();
        }
        shown.push_back(options.clone());
        Ok(())
    }
}

/// Fans envelopes out to every subscribed page client.
pub struct BroadcastClients {
    tx: broadcast::Sender<ClientEnvelope>,
}

impl BroadcastClients {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEnvelope> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl ClientChannel for BroadcastClients {
    async fn post(&self, envelope: ClientEnvelope) -> Result<()> {
        self.tx
            .send(envelope)
            .map(|_| ())
            .map_err(|_| ApiError::NotFound("page client".to_string()))
    }
}
