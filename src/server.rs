use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rust_mcp_sdk::mcp_server::{server_runtime, ServerHandler};
use rust_mcp_sdk::schema::schema_utils::CallToolError;
use rust_mcp_sdk::schema::{
    CallToolRequest, CallToolResult, Implementation, InitializeResult, ListResourcesRequest,
    ListResourcesResult, ListToolsRequest, ListToolsResult, ReadResourceRequest,
    ReadResourceResult, Resource, ServerCapabilities, ServerCapabilitiesResources,
    ServerCapabilitiesTools, TextContent, TextResourceContents, Tool, ToolAnnotations,
    ToolInputSchema, LATEST_PROTOCOL_VERSION,
};
use rust_mcp_sdk::{McpServer, StdioTransport, TransportOptions};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use intranet_messaging::backend::MessagingBackend;
use intranet_messaging::error::ApiError;
use intranet_messaging::model::{ConversationId, Message, Platform};
use intranet_messaging::notify::{
    BroadcastClients, Channel, ClickTarget, ClientEnvelope, Dispatch, MemoryTray, PushPayload,
};
use intranet_messaging::settings::{Settings, ENV_PREFIX};
use intranet_messaging::strapi::StrapiClient;
use intranet_messaging::sync::Registration;
use intranet_messaging::{MessagingSession, SessionConfig};

const LIST_CONVERSATIONS_TOOL: &str = "intranet_list_conversations";
const OPEN_CONVERSATION_TOOL: &str = "intranet_open_conversation";
const READ_NEW_MESSAGES_TOOL: &str = "intranet_read_new_messages";
const SEND_MESSAGE_TOOL: &str = "intranet_send_message";
const CLOSE_CONVERSATION_TOOL: &str = "intranet_close_conversation";
const REGISTER_PUSH_TOKEN_TOOL: &str = "intranet_register_push_token";
const DISPATCH_NOTIFICATION_TOOL: &str = "intranet_dispatch_notification";
const OPEN_NOTIFICATION_TOOL: &str = "intranet_open_notification";
const RESOURCE_OVERVIEW_URI: &str = "resource://intranet/overview";

const CLIENT_CHANNEL_CAPACITY: usize = 32;

pub struct Server {
    settings: Settings,
    session: Arc<MessagingSession>,
    tray: Arc<MemoryTray>,
    clients: Arc<BroadcastClients>,
}

impl Server {
    pub async fn new(settings: Settings) -> Result<Self> {
        info!(api = %settings.api_base_url, user = %settings.user_id, "initializing server components");

        let backend: Arc<dyn MessagingBackend> = Arc::new(
            StrapiClient::new(
                &settings.api_base_url,
                &settings.api_token,
                settings.request_timeout(),
            )
            .context("failed to build CMS client")?
            .with_bulk_read_route(settings.bulk_read_route.clone()),
        );
        let tray = Arc::new(MemoryTray::new(settings.dedup_capacity));
        let clients = Arc::new(BroadcastClients::new(CLIENT_CHANNEL_CAPACITY));

        let session = Arc::new(MessagingSession::new(
            backend,
            SessionConfig::from(&settings),
            tray.clone(),
            clients.clone(),
        ));

        Ok(Self {
            settings,
            session,
            tray,
            clients,
        })
    }

    pub async fn run(&self) -> Result<()> {
        let transport = StdioTransport::new(TransportOptions::default())
            .map_err(|err| anyhow!("failed to create stdio transport: {err}"))?;

        tokio::spawn(log_client_envelopes(self.clients.subscribe()));

        let server_details = self.build_server_details();
        let handler = IntranetMcpHandler::new(self.session.clone(), self.tray.clone());

        let runtime = server_runtime::create_server(server_details, transport, handler);
        info!("intranet MCP server runtime started; waiting for MCP client initialization");

        runtime
            .start()
            .await
            .map_err(|err| anyhow!("mcp runtime error: {err}"))
    }

    pub async fn shutdown(&self) {
        if let Some(conversation) = self.session.close_conversation().await {
            debug!(%conversation, "closed conversation on shutdown");
        }
    }

    fn build_server_details(&self) -> InitializeResult {
        InitializeResult {
            server_info: Implementation {
                name: "intranet-messaging-mcp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("Intranet Messaging MCP Server".to_string()),
            },
            capabilities: self.server_capabilities(),
            instructions: Some(self.server_instructions()),
            meta: None,
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
        }
    }

    fn server_capabilities(&self) -> ServerCapabilities {
        let mut capabilities = ServerCapabilities::default();
        capabilities.tools = Some(ServerCapabilitiesTools {
            list_changed: Some(false),
        });
        capabilities.resources = Some(ServerCapabilitiesResources {
            list_changed: Some(false),
            subscribe: Some(false),
        });
        capabilities
    }

    fn server_instructions(&self) -> String {
        format!(
            "Intranet messaging for user {} on {}. Use `{}` to find a conversation, `{}` to start following it, `{}` to fetch what arrived since, and `{}` to reply. Read `{}` for setup guidance.",
            self.settings.user_id,
            self.settings.api_base_url,
            LIST_CONVERSATIONS_TOOL,
            OPEN_CONVERSATION_TOOL,
            READ_NEW_MESSAGES_TOOL,
            SEND_MESSAGE_TOOL,
            RESOURCE_OVERVIEW_URI
        )
    }
}

async fn log_client_envelopes(mut envelopes: broadcast::Receiver<ClientEnvelope>) {
    loop {
        match envelopes.recv().await {
            Ok(ClientEnvelope::ForegroundNotification { payload }) => {
                debug!(tag = %payload.key(), "foreground notification posted to clients");
            }
            Ok(ClientEnvelope::NotificationClick { notification }) => {
                debug!(tag = %notification.tag, "notification click posted to clients");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "client envelope log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

struct IntranetMcpHandler {
    session: Arc<MessagingSession>,
    tray: Arc<MemoryTray>,
    tools: Vec<Tool>,
    resources: Vec<ResourceEntry>,
}

#[derive(Debug, Deserialize)]
struct OpenConversationArgs {
    conversation_id: u64,
}

#[derive(Debug, Deserialize)]
struct SendMessageArgs {
    conversation_id: u64,
    text: String,
}

#[derive(Debug, Deserialize)]
struct RegisterPushTokenArgs {
    token: String,
    platform: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ChannelArg {
    Foreground,
    #[default]
    Background,
}

#[derive(Debug, Deserialize)]
struct DispatchNotificationArgs {
    payload: PushPayload,
    #[serde(default)]
    channel: ChannelArg,
}

#[derive(Debug, Deserialize)]
struct OpenNotificationArgs {
    tag: String,
}

struct ResourceEntry {
    descriptor: Resource,
    body: String,
}

impl IntranetMcpHandler {
    fn new(session: Arc<MessagingSession>, tray: Arc<MemoryTray>) -> Self {
        let tools = vec![
            build_list_conversations_tool(),
            build_open_conversation_tool(),
            build_read_new_messages_tool(),
            build_send_message_tool(),
            build_close_conversation_tool(),
            build_register_push_token_tool(),
            build_dispatch_notification_tool(),
            build_open_notification_tool(),
        ];
        let resources = build_resource_entries();
        Self {
            session,
            tray,
            tools,
            resources,
        }
    }

    async fn invoke_list_conversations(
        &self,
    ) -> std::result::Result<CallToolResult, CallToolError> {
        let conversations = self
            .session
            .list_conversations()
            .await
            .map_err(|err| tool_error("listing conversations", err))?;

        if conversations.is_empty() {
            return Ok(text_result("No conversations found.".to_string()));
        }

        let user = self.session.user();
        let lines: Vec<String> = conversations
            .iter()
            .map(|conversation| {
                let mut line = format!(
                    "{}: {} (unread: {})",
                    conversation.id,
                    conversation.display_name(user),
                    conversation.unread_count
                );
                if let Some(summary) = &conversation.last_message {
                    line.push_str(&format!(", last: {}", summary.text));
                }
                line
            })
            .collect();
        Ok(text_result(lines.join("\n")))
    }

    async fn invoke_open_conversation(
        &self,
        args: OpenConversationArgs,
    ) -> std::result::Result<CallToolResult, CallToolError> {
        let opened = self
            .session
            .open_conversation(ConversationId(args.conversation_id))
            .await
            .map_err(|err| tool_error("opening conversation", err))?;

        let mut lines = vec![format!(
            "Opened {} ({}); polling for new messages.",
            opened.conversation.display_name(self.session.user()),
            opened.conversation.id
        )];
        match &opened.reconciliation {
            Some(reconciliation) => lines.push(format!(
                "Marked {} message(s) read; unread now {}.",
                reconciliation.marked, reconciliation.unread_count
            )),
            None => lines.push("Read state could not be updated; will retry.".to_string()),
        }
        lines.extend(opened.messages.iter().map(format_message));
        Ok(text_result(lines.join("\n")))
    }

    async fn invoke_read_new_messages(
        &self,
    ) -> std::result::Result<CallToolResult, CallToolError> {
        let update = self
            .session
            .read_new_messages()
            .await
            .map_err(|err| tool_error("reading new messages", err))?;

        if update.messages.is_empty() {
            return Ok(text_result(format!(
                "No new messages in conversation {}.",
                update.conversation
            )));
        }
        let lines: Vec<String> = update.messages.iter().map(format_message).collect();
        Ok(text_result(lines.join("\n")))
    }

    async fn invoke_send_message(
        &self,
        args: SendMessageArgs,
    ) -> std::result::Result<CallToolResult, CallToolError> {
        let message = self
            .session
            .send_message(ConversationId(args.conversation_id), &args.text)
            .await
            .map_err(|err| tool_error("sending message", err))?;

        Ok(text_result(format!(
            "Message {} delivered to conversation {}",
            message.id, message.conversation_id
        )))
    }

    async fn invoke_close_conversation(
        &self,
    ) -> std::result::Result<CallToolResult, CallToolError> {
        let body = match self.session.close_conversation().await {
            Some(conversation) => format!("Stopped polling conversation {conversation}."),
            None => "No conversation was open.".to_string(),
        };
        Ok(text_result(body))
    }

    async fn invoke_register_push_token(
        &self,
        args: RegisterPushTokenArgs,
    ) -> std::result::Result<CallToolResult, CallToolError> {
        let platform: Platform = args
            .platform
            .parse()
            .map_err(|err: String| CallToolError::from_message(err))?;

        let registration = self
            .session
            .register_push_token(&args.token, platform)
            .await
            .map_err(|err| tool_error("registering push token", err))?;

        let body = match registration {
            Registration::Created(token) => format!("Registered push token {}.", token.id),
            Registration::Reassigned(token) => {
                format!("Push token {} reassigned to this user.", token.id)
            }
            Registration::AlreadyRegistered => "Push token already registered.".to_string(),
        };
        Ok(text_result(body))
    }

    async fn invoke_dispatch_notification(
        &self,
        args: DispatchNotificationArgs,
    ) -> std::result::Result<CallToolResult, CallToolError> {
        let channel = match args.channel {
            ChannelArg::Foreground => Channel::Foreground,
            ChannelArg::Background => Channel::Background,
        };
        let dispatch = self
            .session
            .dispatch_notification(&args.payload, channel)
            .await
            .map_err(|err| tool_error("dispatching notification", err))?;

        let body = match dispatch {
            Dispatch::Shown { tag } => format!("Shown notification `{tag}`."),
            Dispatch::Duplicate { tag } => format!("Dropped duplicate notification `{tag}`."),
            Dispatch::AlreadyDisplayed { tag } => {
                format!("Notification `{tag}` is already displayed.")
            }
            Dispatch::Suppressed => "Notifications are disabled.".to_string(),
        };
        Ok(text_result(body))
    }

    async fn invoke_open_notification(
        &self,
        args: OpenNotificationArgs,
    ) -> std::result::Result<CallToolResult, CallToolError> {
        let notification = self
            .tray
            .shown()
            .into_iter()
            .find(|shown| shown.tag == args.tag)
            .ok_or_else(|| {
                CallToolError::from_message(format!("no displayed notification `{}`", args.tag))
            })?;

        let target = self
            .session
            .open_notification(&notification)
            .await
            .map_err(|err| tool_error("opening notification", err))?;
        self.tray.dismiss(&notification.tag);

        let body = match target {
            ClickTarget::Conversation(conversation) => {
                format!("Opened conversation {conversation}.")
            }
            ClickTarget::Route(route) => format!("Notification points at `{route}`."),
            ClickTarget::Home => "Notification has no target; returned home.".to_string(),
        };
        Ok(text_result(body))
    }
}

#[async_trait]
impl ServerHandler for IntranetMcpHandler {
    async fn handle_list_tools_request(
        &self,
        _request: ListToolsRequest,
        runtime: Arc<dyn McpServer>,
    ) -> std::result::Result<ListToolsResult, rust_mcp_sdk::schema::RpcError> {
        let method = ListToolsRequest::method_name();
        runtime.assert_server_request_capabilities(&method)?;

        Ok(ListToolsResult {
            tools: self.tools.clone(),
            meta: None,
            next_cursor: None,
        })
    }

    async fn handle_list_resources_request(
        &self,
        _request: ListResourcesRequest,
        runtime: Arc<dyn McpServer>,
    ) -> std::result::Result<ListResourcesResult, rust_mcp_sdk::schema::RpcError> {
        let method = ListResourcesRequest::method_name();
        runtime.assert_server_request_capabilities(&method)?;

        let resources = self
            .resources
            .iter()
            .map(|entry| entry.descriptor.clone())
            .collect();

        Ok(ListResourcesResult {
            resources,
            meta: None,
            next_cursor: None,
        })
    }

    async fn handle_call_tool_request(
        &self,
        request: CallToolRequest,
        runtime: Arc<dyn McpServer>,
    ) -> std::result::Result<CallToolResult, CallToolError> {
        let method = CallToolRequest::method_name();
        runtime
            .assert_server_request_capabilities(&method)
            .map_err(CallToolError::new)?;

        let params = request.params;
        let name = params.name;
        match name.as_str() {
            LIST_CONVERSATIONS_TOOL => self.invoke_list_conversations().await,
            OPEN_CONVERSATION_TOOL => {
                let args = parse_arguments::<OpenConversationArgs>(params.arguments)?;
                self.invoke_open_conversation(args).await
            }
            READ_NEW_MESSAGES_TOOL => self.invoke_read_new_messages().await,
            SEND_MESSAGE_TOOL => {
                let args = parse_arguments::<SendMessageArgs>(params.arguments)?;
                self.invoke_send_message(args).await
            }
            CLOSE_CONVERSATION_TOOL => self.invoke_close_conversation().await,
            REGISTER_PUSH_TOKEN_TOOL => {
                let args = parse_arguments::<RegisterPushTokenArgs>(params.arguments)?;
                self.invoke_register_push_token(args).await
            }
            DISPATCH_NOTIFICATION_TOOL => {
                let args = parse_arguments::<DispatchNotificationArgs>(params.arguments)?;
                self.invoke_dispatch_notification(args).await
            }
            OPEN_NOTIFICATION_TOOL => {
                let args = parse_arguments::<OpenNotificationArgs>(params.arguments)?;
                self.invoke_open_notification(args).await
            }
            _ => Err(CallToolError::unknown_tool(name)),
        }
    }

    async fn handle_read_resource_request(
        &self,
        request: ReadResourceRequest,
        runtime: Arc<dyn McpServer>,
    ) -> std::result::Result<ReadResourceResult, rust_mcp_sdk::schema::RpcError> {
        let method = ReadResourceRequest::method_name();
        runtime.assert_server_request_capabilities(&method)?;

        let uri = request.params.uri;
        if let Some(entry) = self
            .resources
            .iter()
            .find(|entry| entry.descriptor.uri == uri)
        {
            let contents = TextResourceContents {
                meta: None,
                mime_type: Some("text/markdown".to_string()),
                text: entry.body.clone(),
                uri: uri.clone(),
            };

            Ok(ReadResourceResult {
                contents: vec![contents.into()],
                meta: None,
            })
        } else {
            Err(rust_mcp_sdk::schema::RpcError::invalid_params()
                .with_message(format!("Unknown resource URI: {}", uri)))
        }
    }
}

fn text_result(body: String) -> CallToolResult {
    CallToolResult::text_content(vec![TextContent::new(body, None, None)])
}

fn tool_error(action: &str, err: ApiError) -> CallToolError {
    warn!(?err, action, "tool invocation failed");
    let hint = if err.is_unauthorized() {
        " (check the API token)"
    } else if err.is_rate_limited() {
        " (rate limited, try again shortly)"
    } else {
        ""
    };
    CallToolError::from_message(format!("{action} failed: {err}{hint}"))
}

fn format_message(message: &Message) -> String {
    let sender = message.sender.label();
    let sender = if sender.is_empty() { "unknown" } else { sender };
    let mut line = format!(
        "[{}] #{} {}: {}",
        message.created_at.format("%Y-%m-%d %H:%M"),
        message.id,
        sender,
        message.text
    );
    if !message.attachments.is_empty() {
        line.push_str(&format!(" [{} attachment(s)]", message.attachments.len()));
    }
    line
}

fn property(kind: &str, description: &str) -> Map<String, Value> {
    let mut schema = Map::new();
    schema.insert("type".to_string(), Value::String(kind.into()));
    schema.insert(
        "description".to_string(),
        Value::String(description.into()),
    );
    schema
}

fn build_tool(
    name: &str,
    title: &str,
    description: &str,
    read_only: bool,
    properties: Vec<(&str, Map<String, Value>)>,
    required: &[&str],
) -> Tool {
    let mut annotations = ToolAnnotations::default();
    annotations.read_only_hint = Some(read_only);
    annotations.destructive_hint = Some(false);

    let input_schema = if properties.is_empty() {
        ToolInputSchema::new(Vec::new(), None)
    } else {
        let properties: HashMap<String, Map<String, Value>> = properties
            .into_iter()
            .map(|(key, schema)| (key.to_string(), schema))
            .collect();
        ToolInputSchema::new(
            required.iter().map(|key| key.to_string()).collect(),
            Some(properties),
        )
    };

    Tool {
        annotations: Some(annotations),
        description: Some(description.into()),
        input_schema,
        meta: None,
        name: name.to_string(),
        output_schema: None,
        title: Some(title.into()),
    }
}

fn build_list_conversations_tool() -> Tool {
    build_tool(
        LIST_CONVERSATIONS_TOOL,
        "List Conversations",
        "Return the conversations the configured user takes part in, newest first, with unread counts.",
        true,
        Vec::new(),
        &[],
    )
}

fn build_open_conversation_tool() -> Tool {
    build_tool(
        OPEN_CONVERSATION_TOOL,
        "Open Conversation",
        "Load recent messages, mark incoming messages read and start polling the conversation. Closes any previously open conversation.",
        false,
        vec![(
            "conversation_id",
            property("integer", "Numeric conversation id"),
        )],
        &["conversation_id"],
    )
}

fn build_read_new_messages_tool() -> Tool {
    build_tool(
        READ_NEW_MESSAGES_TOOL,
        "Read New Messages",
        "Return messages that arrived in the open conversation since the last call.",
        false,
        Vec::new(),
        &[],
    )
}

fn build_send_message_tool() -> Tool {
    build_tool(
        SEND_MESSAGE_TOOL,
        "Send Message",
        "Send a text message to a conversation.",
        false,
        vec![
            (
                "conversation_id",
                property("integer", "Numeric conversation id"),
            ),
            ("text", property("string", "Message body to send")),
        ],
        &["conversation_id", "text"],
    )
}

fn build_close_conversation_tool() -> Tool {
    build_tool(
        CLOSE_CONVERSATION_TOOL,
        "Close Conversation",
        "Stop polling the open conversation.",
        false,
        Vec::new(),
        &[],
    )
}

fn build_register_push_token_tool() -> Tool {
    build_tool(
        REGISTER_PUSH_TOKEN_TOOL,
        "Register Push Token",
        "Register a device push token for the configured user.",
        false,
        vec![
            ("token", property("string", "Push service registration token")),
            (
                "platform",
                property("string", "One of `android`, `ios` or `web`"),
            ),
        ],
        &["token", "platform"],
    )
}

fn build_dispatch_notification_tool() -> Tool {
    build_tool(
        DISPATCH_NOTIFICATION_TOOL,
        "Dispatch Notification",
        "Run a push payload through duplicate suppression and show it unless it was already shown.",
        false,
        vec![
            (
                "payload",
                property(
                    "object",
                    "Push payload with `notification.{title,body,icon,badge,tag}` and a `data` map",
                ),
            ),
            (
                "channel",
                property("string", "`foreground` or `background` (default)"),
            ),
        ],
        &["payload"],
    )
}

fn build_open_notification_tool() -> Tool {
    build_tool(
        OPEN_NOTIFICATION_TOOL,
        "Open Notification",
        "Act on a displayed notification as if it was clicked: open the conversation it refers to.",
        false,
        vec![("tag", property("string", "Tag of a displayed notification"))],
        &["tag"],
    )
}

fn parse_arguments<T>(
    arguments: Option<Map<String, Value>>,
) -> std::result::Result<T, CallToolError>
where
    T: DeserializeOwned,
{
    let map = arguments.unwrap_or_else(Map::new);
    let value = Value::Object(map);
    serde_json::from_value(value).map_err(|err| CallToolError::from_message(err.to_string()))
}

fn build_resource_entries() -> Vec<ResourceEntry> {
    let overview_body = format!(
        r#"
# Intranet Messaging MCP Server Overview

This MCP server follows intranet conversations stored in a Strapi CMS.

## Tools

- `{LIST_CONVERSATIONS_TOOL}` lists the user's conversations with unread counts.
- `{OPEN_CONVERSATION_TOOL}` loads recent history, marks incoming messages read and starts polling.
- `{READ_NEW_MESSAGES_TOOL}` returns messages that arrived since the previous call.
- `{SEND_MESSAGE_TOOL}` posts a text message.
- `{CLOSE_CONVERSATION_TOOL}` stops polling.
- `{REGISTER_PUSH_TOKEN_TOOL}` registers a device push token.
- `{DISPATCH_NOTIFICATION_TOOL}` shows a push payload once per tag.
- `{OPEN_NOTIFICATION_TOOL}` opens the conversation a displayed notification refers to.

## Configuration

Provide a `config.toml` (or `{ENV_PREFIX}__*` environment variables) with:

```
api_base_url = "https://cms.example.org"
api_token = "<strapi api token>"
user_id = 42
poll_interval_secs = 5
```

Optional: `page_size`, `reconcile_limit`, `dedup_capacity`,
`request_timeout_secs`, and `bulk_read_route` (for example
`conversations/{{conversation}}/read`) when the CMS exposes a custom route
that marks a conversation read in one call.
"#
    );

    let descriptor = Resource {
        annotations: None,
        description: Some(
            "Overview of available intranet messaging capabilities and configuration.".into(),
        ),
        meta: None,
        mime_type: Some("text/markdown".into()),
        name: "intranet.overview".into(),
        size: None,
        title: Some("Intranet Messaging MCP Overview".into()),
        uri: RESOURCE_OVERVIEW_URI.into(),
    };

    vec![ResourceEntry {
        descriptor,
        body: overview_body.trim().to_string(),
    }]
}
