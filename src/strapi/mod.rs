//! REST client for the Strapi collections backing intranet messaging.

mod query;
mod wire;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::backend::{mark_each_read, MessagingBackend, ReadPass};
use crate::error::{ApiError, Result};
use crate::model::{Conversation, ConversationId, Message, MessageId, Platform, PushToken, UserId};

pub use query::Query;
use wire::{
    into_conversation, into_message, into_push_token, BulkReadResult, Collection,
    ConversationAttributes, MessageAttributes, Payload, PushTokenAttributes, Single,
};

const MESSAGE_RELATIONS: [&str; 3] = ["sender", "conversation", "attachments"];

#[derive(Debug, Clone)]
pub struct StrapiClient {
    http: reqwest::Client,
    base_url: String,
    bulk_read_route: Option<String>,
}

impl StrapiClient {
    pub fn new(base_url: &str, api_token: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", api_token.trim()))
            .map_err(|_| ApiError::validation("api token contains invalid header characters"))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            bulk_read_route: None,
        })
    }

    /// Route (relative to `/api/`) of a custom controller that marks a whole
    /// conversation read in one call. `{conversation}` is substituted.
    pub fn with_bulk_read_route(mut self, route: Option<String>) -> Self {
        self.bulk_read_route = route
            .map(|route| route.trim_matches('/').to_string())
            .filter(|route| !route.is_empty());
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/api/{}", self.base_url, path.trim_start_matches('/'));
        self.http.request(method, url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes).trim().to_string();
            return Err(ApiError::status(status, body));
        }

        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &Query) -> Result<T> {
        self.send(self.request(Method::GET, path).query(query.pairs()))
            .await
    }

    async fn write<B, T>(&self, method: Method, path: &str, query: &Query, data: B) -> Result<T>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        self.send(
            self.request(method, path)
                .query(query.pairs())
                .json(&Payload { data }),
        )
        .await
    }

    fn message_query() -> Query {
        MESSAGE_RELATIONS
            .iter()
            .fold(Query::new(), |query, relation| query.populate(relation))
    }

    fn unread_query(conversation: ConversationId, reader: UserId) -> Query {
        Query::new()
            .filter(&["conversation", "id", "$eq"], conversation)
            .filter(&["read", "$eq"], false)
            .filter(&["sender", "id", "$ne"], reader)
    }
}

#[async_trait]
impl MessagingBackend for StrapiClient {
    async fn list_conversations(&self, user: UserId) -> Result<Vec<Conversation>> {
        let query = Query::new()
            .filter(&["participants", "id", "$eq"], user)
            .populate("participants")
            .sort("updatedAt:desc")
            .page_size(100);
        let collection: Collection<ConversationAttributes> =
            self.get("conversations", &query).await?;

        debug!(%user, count = collection.data.len(), "conversations listed");
        Ok(collection.data.into_iter().map(into_conversation).collect())
    }

    async fn get_conversation(&self, conversation: ConversationId) -> Result<Conversation> {
        let query = Query::new().populate("participants");
        let single: Single<ConversationAttributes> = self
            .get(&format!("conversations/{conversation}"), &query)
            .await?;
        Ok(into_conversation(single.data))
    }

    async fn fetch_recent(
        &self,
        conversation: ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let query = Self::message_query()
            .filter(&["conversation", "id", "$eq"], conversation)
            .sort("id:desc")
            .page_size(limit);

        let collection: Collection<MessageAttributes> = self.get("messages", &query).await?;
        let mut messages: Vec<Message> = collection
            .data
            .into_iter()
            .map(|entity| into_message(entity, conversation, None))
            .collect();
        messages.reverse();
        Ok(messages)
    }

    async fn fetch_messages_after(
        &self,
        conversation: ConversationId,
        after: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let mut query = Self::message_query().filter(&["conversation", "id", "$eq"], conversation);
        if let Some(after) = after {
            query = query.filter(&["id", "$gt"], after);
        }
        let query = query.sort("id:asc").page_size(limit);

        let collection: Collection<MessageAttributes> = self.get("messages", &query).await?;
        Ok(collection
            .data
            .into_iter()
            .map(|entity| into_message(entity, conversation, None))
            .collect())
    }

    async fn send_message(
        &self,
        conversation: ConversationId,
        sender: UserId,
        text: &str,
    ) -> Result<Message> {
        let created: Single<MessageAttributes> = self
            .write(
                Method::POST,
                "messages",
                &Self::message_query(),
                json!({
                    "text": text,
                    "conversation": conversation.0,
                    "sender": sender.0,
                    "read": false,
                }),
            )
            .await?;
        let message = into_message(created.data, conversation, Some(sender));

        // The message is stored by now; only the list preview goes stale.
        let summary = message.summary();
        if let Err(err) = self
            .write::<_, serde_json::Value>(
                Method::PUT,
                &format!("conversations/{conversation}"),
                &Query::new(),
                json!({
                    "lastMessage": summary.text,
                    "lastMessageAt": summary.sent_at,
                }),
            )
            .await
        {
            warn!(%conversation, message = %message.id, ?err, "failed to update conversation summary");
        }

        debug!(%conversation, message = %message.id, "message sent");
        Ok(message)
    }

    async fn list_unread(
        &self,
        conversation: ConversationId,
        reader: UserId,
        up_to: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let mut query = Self::unread_query(conversation, reader);
        if let Some(up_to) = up_to {
            query = query.filter(&["id", "$lte"], up_to);
        }
        let query = query.sort("id:asc").page_size(limit).populate("sender");

        let collection: Collection<MessageAttributes> = self.get("messages", &query).await?;
        Ok(collection
            .data
            .into_iter()
            .map(|entity| into_message(entity, conversation, None))
            .collect())
    }

    async fn count_unread(&self, conversation: ConversationId, reader: UserId) -> Result<u32> {
        let query = Self::unread_query(conversation, reader).page_size(1);
        let collection: Collection<MessageAttributes> = self.get("messages", &query).await?;
        let total = collection
            .meta
            .pagination
            .map(|pagination| pagination.total)
            .unwrap_or(collection.data.len() as u64);
        Ok(u32::try_from(total).unwrap_or(u32::MAX))
    }

    async fn mark_message_read(&self, message: MessageId) -> Result<()> {
        let _: serde_json::Value = self
            .write(
                Method::PUT,
                &format!("messages/{message}"),
                &Query::new(),
                json!({ "read": true }),
            )
            .await?;
        Ok(())
    }

    async fn set_unread_count(&self, conversation: ConversationId, count: u32) -> Result<()> {
        let _: serde_json::Value = self
            .write(
                Method::PUT,
                &format!("conversations/{conversation}"),
                &Query::new(),
                json!({ "unreadCount": count }),
            )
            .await?;
        Ok(())
    }

    async fn mark_read_up_to(
        &self,
        conversation: ConversationId,
        reader: UserId,
        up_to: Option<MessageId>,
        limit: usize,
    ) -> Result<ReadPass> {
        let Some(route) = self.bulk_read_route.as_deref() else {
            return mark_each_read(self, conversation, reader, up_to, limit).await;
        };

        let path = route.replace("{conversation}", &conversation.to_string());
        let result: Payload<BulkReadResult> = self
            .write(
                Method::PUT,
                &path,
                &Query::new(),
                json!({ "reader": reader.0, "upTo": up_to.map(|id| id.0) }),
            )
            .await?;

        debug!(%conversation, marked = result.data.marked, "bulk read route finished");
        Ok(ReadPass {
            attempted: result.data.marked,
            marked: result.data.marked,
            failed: Vec::new(),
        })
    }

    async fn find_push_token(&self, token: &str) -> Result<Option<PushToken>> {
        let query = Query::new()
            .filter(&["token", "$eq"], token)
            .populate("user")
            .page_size(1);
        let collection: Collection<PushTokenAttributes> =
            self.get("push-tokens", &query).await?;
        Ok(collection.data.into_iter().next().map(into_push_token))
    }

    async fn create_push_token(
        &self,
        token: &str,
        platform: Platform,
        owner: UserId,
    ) -> Result<PushToken> {
        let created: Single<PushTokenAttributes> = self
            .write(
                Method::POST,
                "push-tokens",
                &Query::new().populate("user"),
                json!({ "token": token, "platform": platform, "user": owner.0 }),
            )
            .await?;
        Ok(into_push_token(created.data))
    }

    async fn assign_push_token(
        &self,
        id: u64,
        platform: Platform,
        owner: UserId,
    ) -> Result<PushToken> {
        let updated: Single<PushTokenAttributes> = self
            .write(
                Method::PUT,
                &format!("push-tokens/{id}"),
                &Query::new().populate("user"),
                json!({ "platform": platform, "user": owner.0 }),
            )
            .await?;
        Ok(into_push_token(updated.data))
    }
}
