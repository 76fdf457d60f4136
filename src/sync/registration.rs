use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backend::MessagingBackend;
use crate::error::{ApiError, Result};
use crate::model::{Platform, PushToken, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Created(PushToken),
    /// The token existed but belonged to another user or platform.
    Reassigned(PushToken),
    AlreadyRegistered,
}

impl Registration {
    pub fn label(&self) -> &'static str {
        match self {
            Registration::Created(_) => "created",
            Registration::Reassigned(_) => "reassigned",
            Registration::AlreadyRegistered => "already_registered",
        }
    }
}

/// Registers this device's push token with the backend once per token and
/// platform for the life of the process.
pub struct TokenRegistrar {
    backend: Arc<dyn MessagingBackend>,
    owner: UserId,
    registered: Mutex<HashSet<(String, Platform)>>,
}

impl TokenRegistrar {
    pub fn new(backend: Arc<dyn MessagingBackend>, owner: UserId) -> Self {
        Self {
            backend,
            owner,
            registered: Mutex::new(HashSet::new()),
        }
    }

    pub async fn register(&self, token: &str, platform: Platform) -> Result<Registration> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ApiError::validation("push token must not be empty"));
        }

        // Held across the round trips so two registrations never race.
        let mut registered = self.registered.lock().await;
        let key = (token.to_string(), platform);
        if registered.contains(&key) {
            debug!(platform = platform.as_str(), "push token already registered; skipping");
            return Ok(Registration::AlreadyRegistered);
        }

        let registration = match self.backend.find_push_token(token).await? {
            Some(existing)
                if existing.owner == Some(self.owner) && existing.platform == platform =>
            {
                Registration::AlreadyRegistered
            }
            Some(existing) => {
                let updated = self
                    .backend
                    .assign_push_token(existing.id, platform, self.owner)
                    .await?;
                Registration::Reassigned(updated)
            }
            None => {
                let created = self
                    .backend
                    .create_push_token(token, platform, self.owner)
                    .await?;
                Registration::Created(created)
            }
        };

        info!(
            owner = %self.owner,
            platform = platform.as_str(),
            outcome = registration.label(),
            "push token registered"
        );
        registered.insert(key);
        Ok(registration)
    }
}
