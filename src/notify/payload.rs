//! Push payloads and the envelopes exchanged with page clients.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::model::ConversationId;

const DEFAULT_TITLE: &str = "New notification";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushNotification {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub badge: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

/// A message as delivered by the push service, on either channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(default)]
    pub notification: PushNotification,
    #[serde(default)]
    pub data: Map<String, Value>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => non_empty(Some(text.as_str())).map(str::to_string),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

impl PushPayload {
    /// Data-only pushes carry their text in `data` instead.
    pub fn title(&self) -> String {
        non_empty(self.notification.title.as_deref())
            .map(str::to_string)
            .or_else(|| self.data.get("title").and_then(scalar_text))
            .unwrap_or_else(|| DEFAULT_TITLE.to_string())
    }

    pub fn body(&self) -> String {
        non_empty(self.notification.body.as_deref())
            .map(str::to_string)
            .or_else(|| self.data.get("body").and_then(scalar_text))
            .unwrap_or_default()
    }

    pub fn timestamp(&self) -> Option<String> {
        ["timestamp", "sentAt"]
            .iter()
            .find_map(|field| self.data.get(*field).and_then(scalar_text))
    }

    /// Stable identity of the notification: its tag, or a tag derived from
    /// title, body and timestamp when the sender did not set one.
    pub fn key(&self) -> String {
        if let Some(tag) = non_empty(self.notification.tag.as_deref()) {
            return tag.to_string();
        }
        let synthesized = format!(
            "{}\u{1f}{}\u{1f}{}",
            self.title(),
            self.body(),
            self.timestamp().unwrap_or_default()
        );
        Uuid::new_v5(&Uuid::NAMESPACE_URL, synthesized.as_bytes()).to_string()
    }

    pub fn conversation(&self) -> Option<ConversationId> {
        self.data
            .get("conversationId")
            .and_then(scalar_text)
            .and_then(|id| id.parse().ok())
            .map(ConversationId)
    }

    pub fn to_options(&self) -> NotificationOptions {
        NotificationOptions {
            title: self.title(),
            body: self.body(),
            icon: self.notification.icon.clone(),
            badge: self.notification.badge.clone(),
            tag: self.key(),
            data: self.data.clone(),
            renotify: false,
            require_interaction: false,
        }
    }
}

/// What gets handed to the OS notification tray.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOptions {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
    pub tag: String,
    pub data: Map<String, Value>,
    pub renotify: bool,
    pub require_interaction: bool,
}

/// `postMessage` envelope between the notification worker and page clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEnvelope {
    ForegroundNotification { payload: PushPayload },
    NotificationClick { notification: NotificationOptions },
}
