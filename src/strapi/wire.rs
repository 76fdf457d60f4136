//! Strapi v4 response shapes and their mapping onto the domain model.
//!
//! Every record arrives as `{ id, attributes }`, collections as
//! `{ data: [...], meta: { pagination } }` and relations as
//! `{ data: { id, attributes } }` (or `{ data: [...] }` for to-many).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    Attachment, AttachmentId, Conversation, ConversationId, Message, MessageId, MessageSummary,
    Participant, Platform, PushToken, UserId,
};

#[derive(Debug, Deserialize)]
pub struct Collection<T> {
    pub data: Vec<Entity<T>>,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Deserialize)]
pub struct Single<T> {
    pub data: Entity<T>,
}

#[derive(Debug, Deserialize)]
pub struct Entity<T> {
    pub id: u64,
    pub attributes: T,
}

#[derive(Debug, Default, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub page_count: Option<usize>,
    pub total: u64,
}

#[derive(Debug, Deserialize)]
pub struct ToOne<T> {
    pub data: Option<Entity<T>>,
}

/// `data` is `null` when the relation was cleared.
#[derive(Debug, Deserialize)]
pub struct ToMany<T> {
    pub data: Option<Vec<Entity<T>>>,
}

impl<T> Default for ToMany<T> {
    fn default() -> Self {
        Self { data: None }
    }
}

impl<T> ToMany<T> {
    pub fn into_entities(self) -> Vec<Entity<T>> {
        self.data.unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
pub struct UserAttributes {
    pub username: String,
    #[serde(default, rename = "displayName", alias = "fullName")]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MediaAttributes {
    pub url: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Kilobytes, as Strapi's upload plugin records it.
    #[serde(default)]
    pub size: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct IdOnly {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAttributes {
    #[serde(default)]
    pub text: Option<String>,
    /// Strapi sends `null` for attributes that were never set.
    #[serde(default)]
    pub read: Option<bool>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sender: Option<ToOne<UserAttributes>>,
    #[serde(default)]
    pub conversation: Option<ToOne<IdOnly>>,
    #[serde(default)]
    pub attachments: Option<ToMany<MediaAttributes>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationAttributes {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub participants: Option<ToMany<UserAttributes>>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: Option<u32>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct PushTokenAttributes {
    pub token: String,
    pub platform: Platform,
    #[serde(default)]
    pub user: Option<ToOne<IdOnly>>,
}

/// Response of the optional server-side "mark read up to" route.
#[derive(Debug, Deserialize)]
pub struct BulkReadResult {
    pub marked: usize,
}

/// Request and single-result bodies are wrapped as `{ data: ... }`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Payload<T> {
    pub data: T,
}

fn participant(entity: Entity<UserAttributes>) -> Participant {
    Participant {
        id: UserId(entity.id),
        username: entity.attributes.username,
        display_name: entity.attributes.display_name,
    }
}

fn attachment(entity: Entity<MediaAttributes>) -> Attachment {
    Attachment {
        id: AttachmentId(entity.id),
        url: entity.attributes.url,
        mime_type: entity.attributes.mime,
        file_name: entity.attributes.name,
        size_bytes: entity
            .attributes
            .size
            .filter(|kb| kb.is_finite() && *kb >= 0.0)
            .map(|kb| (kb * 1000.0).round() as u64),
    }
}

/// Relations that were not populated fall back to the ids the caller knows.
pub fn into_message(
    entity: Entity<MessageAttributes>,
    conversation: ConversationId,
    fallback_sender: Option<UserId>,
) -> Message {
    let attrs = entity.attributes;
    let sender = attrs
        .sender
        .and_then(|relation| relation.data)
        .map(participant)
        .unwrap_or_else(|| Participant {
            id: fallback_sender.unwrap_or(UserId(0)),
            username: String::new(),
            display_name: None,
        });
    let conversation_id = attrs
        .conversation
        .and_then(|relation| relation.data)
        .map(|data| ConversationId(data.id))
        .unwrap_or(conversation);

    Message {
        id: MessageId(entity.id),
        conversation_id,
        sender,
        text: attrs.text.unwrap_or_default(),
        attachments: attrs
            .attachments
            .unwrap_or_default()
            .into_entities()
            .into_iter()
            .map(attachment)
            .collect(),
        read: attrs.read.unwrap_or(false),
        created_at: attrs.created_at,
    }
}

pub fn into_conversation(entity: Entity<ConversationAttributes>) -> Conversation {
    let attrs = entity.attributes;
    let last_message = attrs.last_message.map(|text| MessageSummary {
        text,
        sent_at: attrs.last_message_at,
    });

    Conversation {
        id: ConversationId(entity.id),
        group_name: attrs.name,
        participants: attrs
            .participants
            .unwrap_or_default()
            .into_entities()
            .into_iter()
            .map(participant)
            .collect(),
        last_message,
        unread_count: attrs.unread_count.unwrap_or(0),
        updated_at: attrs.updated_at,
    }
}

pub fn into_push_token(entity: Entity<PushTokenAttributes>) -> PushToken {
    PushToken {
        id: entity.id,
        token: entity.attributes.token,
        platform: entity.attributes.platform,
        owner: entity
            .attributes
            .user
            .and_then(|relation| relation.data)
            .map(|data| UserId(data.id)),
    }
}
