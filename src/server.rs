use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_mcp_sdk::mcp_server::{server_runtime, ServerHandler};
use rust_mcp_sdk::schema::schema_utils::CallToolError;
use rust_mcp_sdk::schema::{
    CallToolRequest, CallToolResult, Implementation, InitializeResult, ListResourcesRequest,
    ListResourcesResult, ListToolsRequest, ListToolsResult, ReadResourceRequest,
    ReadResourceResult, Resource, RpcError, ServerCapabilities, ServerCapabilitiesResources,
    ServerCapabilitiesTools, TextContent, TextResourceContents, Tool, ToolAnnotations,
    ToolInputSchema, LATEST_PROTOCOL_VERSION,
};
use rust_mcp_sdk::{McpServer, StdioTransport, TransportOptions};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::api::HttpChatApi;
use crate::engine::ChatEngine;
use crate::model::{ConfirmationState, Conversation, ConversationId, Message, Sender};
use crate::settings::Settings;

const LIST_CONVERSATIONS_TOOL: &str = "chat_list_conversations";
const OPEN_CONVERSATION_TOOL: &str = "chat_open_conversation";
const READ_MESSAGES_TOOL: &str = "chat_read_messages";
const SEND_MESSAGE_TOOL: &str = "chat_send_message";
const CLOSE_CONVERSATION_TOOL: &str = "chat_close_conversation";
const RESOURCE_OVERVIEW_URI: &str = "resource://chat/overview";

pub struct Server {
    settings: Settings,
    engine: ChatEngine,
}

impl Server {
    pub async fn new(settings: Settings) -> Result<Self> {
        info!(api = %settings.api_base_url, "initializing chat engine");
        let api = Arc::new(HttpChatApi::new(&settings)?);
        let engine = ChatEngine::from_settings(api, &settings);
        Ok(Self { settings, engine })
    }

    pub async fn run(&self) -> Result<()> {
        let transport = StdioTransport::new(TransportOptions::default())
            .map_err(|err| anyhow!("failed to create stdio transport: {err}"))?;

        let server_details = self.build_server_details();
        let handler = ChatMcpHandler::new(self.engine.clone());

        self.engine.mount();
        let runtime = server_runtime::create_server(server_details, transport, handler);
        info!("chat MCP server runtime started; waiting for MCP client initialization");

        let outcome = runtime
            .start()
            .await
            .map_err(|err| anyhow!("mcp runtime error: {err}"));
        self.engine.unmount();
        outcome
    }

    fn build_server_details(&self) -> InitializeResult {
        InitializeResult {
            server_info: Implementation {
                name: "operator-chat-sync".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("Operator Chat Sync".to_string()),
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
            "Operator chat for {}. Use `{}` for the inbox, `{}` then `{}` to follow a conversation, `{}` to reply, or read `{}` for details.",
            self.settings.api_base_url,
            LIST_CONVERSATIONS_TOOL,
            OPEN_CONVERSATION_TOOL,
            READ_MESSAGES_TOOL,
            SEND_MESSAGE_TOOL,
            RESOURCE_OVERVIEW_URI
        )
    }
}

struct ChatMcpHandler {
    engine: ChatEngine,
    tools: Vec<Tool>,
    resources: Vec<ResourceEntry>,
}

#[derive(Debug, Deserialize)]
struct ConversationArgs {
    counterpart_id: String,
}

#[derive(Debug, Deserialize)]
struct ReadMessagesArgs {
    #[serde(default)]
    counterpart_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendMessageArgs {
    counterpart_id: String,
    message: String,
}

struct ResourceEntry {
    descriptor: Resource,
    body: String,
}

impl ResourceEntry {
    fn read(&self) -> ReadResourceResult {
        let contents = TextResourceContents {
            meta: None,
            mime_type: self.descriptor.mime_type.clone(),
            text: self.body.clone(),
            uri: self.descriptor.uri.clone(),
        };
        ReadResourceResult {
            contents: vec![contents.into()],
            meta: None,
        }
    }
}

impl ChatMcpHandler {
    fn new(engine: ChatEngine) -> Self {
        let tools = Self::new_tools();
        let resources = build_resource_entries();
        Self {
            engine,
            tools,
            resources,
        }
    }

    fn new_tools() -> Vec<Tool> {
        vec![
            build_list_conversations_tool(),
            build_open_conversation_tool(),
            build_read_messages_tool(),
            build_send_message_tool(),
            build_close_conversation_tool(),
        ]
    }

    async fn invoke_list_conversations(
        &self,
    ) -> std::result::Result<CallToolResult, CallToolError> {
        let conversations = match self.engine.refresh_conversations().await {
            Ok(conversations) => conversations,
            Err(err) if err.is_auth() => {
                return Err(CallToolError::from_message(format!(
                    "session rejected by the console API: {err}"
                )));
            }
            Err(err) => {
                warn!(?err, "conversation refresh failed; serving last known list");
                self.engine.conversations()
            }
        };

        if conversations.is_empty() {
            return Ok(text_result("No conversations found.".to_string()));
        }
        let lines: Vec<String> = conversations.iter().map(render_conversation).collect();
        Ok(text_result(lines.join("\n")))
    }

    fn invoke_open_conversation(
        &self,
        args: ConversationArgs,
    ) -> std::result::Result<CallToolResult, CallToolError> {
        let conversation = conversation_id(&args.counterpart_id)?;
        self.engine.open_conversation(&conversation);
        Ok(text_result(format!(
            "Following conversation {conversation}. Use `{READ_MESSAGES_TOOL}` to read it."
        )))
    }

    fn invoke_read_messages(
        &self,
        args: ReadMessagesArgs,
    ) -> std::result::Result<CallToolResult, CallToolError> {
        let conversation = match args.counterpart_id {
            Some(raw) => conversation_id(&raw)?,
            None => self.engine.active_conversation().ok_or_else(|| {
                CallToolError::from_message("no conversation is open".to_string())
            })?,
        };

        match self.engine.messages(&conversation) {
            None => Ok(text_result(format!(
                "Conversation {conversation} is not loaded yet. Open it with `{OPEN_CONVERSATION_TOOL}` first."
            ))),
            Some(messages) if messages.is_empty() => {
                Ok(text_result(format!("Conversation {conversation} has no messages.")))
            }
            Some(messages) => {
                let lines: Vec<String> = messages.iter().map(render_message).collect();
                Ok(text_result(lines.join("\n")))
            }
        }
    }

    async fn invoke_send_message(
        &self,
        args: SendMessageArgs,
    ) -> std::result::Result<CallToolResult, CallToolError> {
        let conversation = conversation_id(&args.counterpart_id)?;
        if self.engine.active_conversation().as_ref() != Some(&conversation) {
            self.engine.open_conversation(&conversation);
        }

        match self.engine.send(&conversation, &args.message).await {
            Ok(confirmed) => Ok(text_result(format!(
                "Message delivered to {conversation} (id {}, {})",
                confirmed.id,
                confirmed.timestamp.to_rfc3339()
            ))),
            Err(err) => {
                warn!(?err, "send failed from tool invocation");
                let draft = self.engine.draft(&conversation);
                Err(CallToolError::from_message(format!(
                    "send failed: {err}. Draft kept: {draft:?}"
                )))
            }
        }
    }

    fn invoke_close_conversation(&self) -> std::result::Result<CallToolResult, CallToolError> {
        match self.engine.active_conversation() {
            Some(conversation) => {
                self.engine.close_conversation();
                Ok(text_result(format!("Stopped following {conversation}.")))
            }
            None => Ok(text_result("No conversation was open.".to_string())),
        }
    }
}

#[async_trait]
impl ServerHandler for ChatMcpHandler {
    async fn handle_list_tools_request(
        &self,
        _request: ListToolsRequest,
        runtime: &dyn McpServer,
    ) -> std::result::Result<ListToolsResult, RpcError> {
        runtime.assert_server_request_capabilities(&ListToolsRequest::method_name())?;
        Ok(ListToolsResult {
            tools: self.tools.clone(),
            meta: None,
            next_cursor: None,
        })
    }

    async fn handle_list_resources_request(
        &self,
        _request: ListResourcesRequest,
        runtime: &dyn McpServer,
    ) -> std::result::Result<ListResourcesResult, RpcError> {
        runtime.assert_server_request_capabilities(&ListResourcesRequest::method_name())?;
        Ok(ListResourcesResult {
            resources: self.resources.iter().map(|r| r.descriptor.clone()).collect(),
            meta: None,
            next_cursor: None,
        })
    }

    async fn handle_call_tool_request(
        &self,
        request: CallToolRequest,
        runtime: &dyn McpServer,
    ) -> std::result::Result<CallToolResult, CallToolError> {
        runtime
            .assert_server_request_capabilities(&CallToolRequest::method_name())
            .map_err(CallToolError::new)?;

        let params = request.params;
        let args = params.arguments;
        match params.name.as_str() {
            LIST_CONVERSATIONS_TOOL => self.invoke_list_conversations().await,
            OPEN_CONVERSATION_TOOL => self.invoke_open_conversation(tool_args(args)?),
            READ_MESSAGES_TOOL => self.invoke_read_messages(tool_args(args)?),
            SEND_MESSAGE_TOOL => {
                let args = tool_args(args)?;
                self.invoke_send_message(args).await
            }
            CLOSE_CONVERSATION_TOOL => self.invoke_close_conversation(),
            _ => Err(CallToolError::unknown_tool(params.name)),
        }
    }

    async fn handle_read_resource_request(
        &self,
        request: ReadResourceRequest,
        runtime: &dyn McpServer,
    ) -> std::result::Result<ReadResourceResult, RpcError> {
        runtime.assert_server_request_capabilities(&ReadResourceRequest::method_name())?;
        let uri = request.params.uri;
        self.resources
            .iter()
            .find(|entry| entry.descriptor.uri == uri)
            .map(ResourceEntry::read)
            .ok_or_else(|| {
                RpcError::invalid_params().with_message(format!("no chat resource at {uri}"))
            })
    }
}

fn text_result(body: String) -> CallToolResult {
    CallToolResult::text_content(vec![TextContent::new(body, None, None)])
}

fn conversation_id(raw: &str) -> std::result::Result<ConversationId, CallToolError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CallToolError::from_message(
            "counterpart_id must not be empty".to_string(),
        ));
    }
    Ok(ConversationId::from(trimmed))
}

fn render_conversation(conversation: &Conversation) -> String {
    let preview = conversation
        .last_message
        .as_ref()
        .map(|m| m.text.as_str())
        .unwrap_or("");
    format!(
        "{} — {} [unread: {}] {}",
        conversation.counterpart_id,
        conversation.counterpart_display_name,
        conversation.unread_count,
        preview
    )
    .trim_end()
    .to_string()
}

fn render_message(message: &Message) -> String {
    let who = match message.sender {
        Sender::User => "user",
        Sender::Operator => "operator",
    };
    let mut flags = Vec::new();
    match message.confirmation {
        ConfirmationState::Pending => flags.push("sending"),
        ConfirmationState::Failed => flags.push("failed"),
        ConfirmationState::Confirmed => {}
    }
    if message.is_unread() {
        flags.push("unread");
    }
    let suffix = if flags.is_empty() {
        String::new()
    } else {
        format!(" ({})", flags.join(", "))
    };
    format!(
        "[{}] {}: {}{}",
        message.timestamp.format("%Y-%m-%d %H:%M:%S"),
        who,
        message.text,
        suffix
    )
}

fn string_property(description: &str) -> Map<String, Value> {
    let mut schema = Map::new();
    schema.insert("type".to_string(), Value::String("string".into()));
    schema.insert(
        "description".to_string(),
        Value::String(description.to_string()),
    );
    schema
}

fn counterpart_property() -> (String, Map<String, Value>) {
    (
        "counterpart_id".to_string(),
        string_property("Id of the user on the other side of the conversation"),
    )
}

fn build_tool(
    name: &str,
    title: &str,
    description: &str,
    read_only: bool,
    required: Vec<String>,
    properties: HashMap<String, Map<String, Value>>,
) -> Tool {
    let mut annotations = ToolAnnotations::default();
    annotations.read_only_hint = Some(read_only);
    annotations.destructive_hint = Some(false);

    let properties = if properties.is_empty() {
        None
    } else {
        Some(properties)
    };

    Tool {
        annotations: Some(annotations),
        description: Some(description.into()),
        input_schema: ToolInputSchema::new(required, properties),
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
        "Refresh and return the operator inbox, most recent activity first, with unread counts.",
        true,
        Vec::new(),
        HashMap::new(),
    )
}

fn build_open_conversation_tool() -> Tool {
    build_tool(
        OPEN_CONVERSATION_TOOL,
        "Open Conversation",
        "Start following a conversation. Its messages are polled and unread ones are marked read.",
        false,
        vec!["counterpart_id".to_string()],
        HashMap::from([counterpart_property()]),
    )
}

fn build_read_messages_tool() -> Tool {
    build_tool(
        READ_MESSAGES_TOOL,
        "Read Messages",
        "Return the locally synchronized log of a conversation (defaults to the open one).",
        true,
        Vec::new(),
        HashMap::from([counterpart_property()]),
    )
}

fn build_send_message_tool() -> Tool {
    build_tool(
        SEND_MESSAGE_TOOL,
        "Send Message",
        "Send an operator reply. The conversation is opened first if it is not already.",
        false,
        vec!["counterpart_id".to_string(), "message".to_string()],
        HashMap::from([
            counterpart_property(),
            ("message".to_string(), string_property("Message body to send")),
        ]),
    )
}

fn build_close_conversation_tool() -> Tool {
    build_tool(
        CLOSE_CONVERSATION_TOOL,
        "Close Conversation",
        "Stop following the open conversation and drop its local log.",
        false,
        Vec::new(),
        HashMap::new(),
    )
}

/// Decode a tool's arguments; a call without arguments decodes from `{}`.
fn tool_args<T: DeserializeOwned>(
    arguments: Option<Map<String, Value>>,
) -> std::result::Result<T, CallToolError> {
    serde_json::from_value(Value::Object(arguments.unwrap_or_default()))
        .map_err(|err| CallToolError::from_message(format!("invalid arguments: {err}")))
}

fn build_resource_entries() -> Vec<ResourceEntry> {
    let overview_body = r#"
# Operator Chat Overview

This MCP server keeps a live view of the console's chat inbox by polling the
console API and merging each snapshot into a local log.

## Tools

- `chat_list_conversations` — inbox with unread counts. Counts come from the local log for the open conversation, from the server otherwise.
- `chat_open_conversation` — follow one conversation; its messages are polled on a short interval and unread user messages are marked read.
- `chat_read_messages` — the merged log. Messages still in flight are flagged `sending`.
- `chat_send_message` — reply as the operator. The reply shows up immediately and is reconciled with the server's copy; on failure the text is kept as a draft.
- `chat_close_conversation` — stop following the open conversation.

## Configuration

Provide a `config.toml` (or `CHAT_SYNC__*` environment variables) with:

```
api_base_url = "https://console.example.com/api"
api_token = "..."
conversation_poll_interval_ms = 10000
message_poll_interval_ms = 3000
```
"#;

    let descriptor = Resource {
        annotations: None,
        description: Some("Overview of the operator chat tools and configuration.".into()),
        meta: None,
        mime_type: Some("text/markdown".into()),
        name: "chat.overview".into(),
        size: None,
        title: Some("Operator Chat Overview".into()),
        uri: RESOURCE_OVERVIEW_URI.into(),
    };

    vec![ResourceEntry {
        descriptor,
        body: overview_body.trim().to_string(),
    }]
}
