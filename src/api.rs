use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{ChatError, ChatResult};
use crate::model::{Conversation, ConversationId, Message, MessageId};
use crate::normalize;
use crate::settings::Settings;

/// Remote operations the chat engine depends on. Implementations hand back
/// canonical model types; payload quirks stay behind this trait.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(&self) -> ChatResult<Vec<Conversation>>;

    /// Full snapshot of a conversation, oldest first.
    async fn list_messages(&self, counterpart: &ConversationId) -> ChatResult<Vec<Message>>;

    /// Returns the confirmed message with its server-assigned id and timestamp.
    async fn send_message(&self, counterpart: &ConversationId, text: &str) -> ChatResult<Message>;

    /// Idempotent: acknowledging an already-read message succeeds.
    async fn acknowledge_read(&self, message: &MessageId) -> ChatResult<()>;
}

#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpChatApi {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let mut builder = Client::builder();
        if let Some(ms) = settings.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            token: settings.api_token.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(&self, builder: RequestBuilder, what: &str) -> ChatResult<Value> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, what, body.trim()));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|err| ChatError::Transport(format!("{what}: malformed response body: {err}")))
    }
}

fn classify(status: StatusCode, what: &str, body: &str) -> ChatError {
    let detail = format!("{what} returned {status}: {body}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ChatError::Auth(detail),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ChatError::Validation(detail),
        _ => ChatError::Transport(detail),
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self) -> ChatResult<Vec<Conversation>> {
        let body = self
            .execute(self.request(Method::GET, "/chat/conversations"), "listConversations")
            .await?;
        let conversations = normalize::conversations(body);
        debug!(count = conversations.len(), "conversations listed");
        Ok(conversations)
    }

    async fn list_messages(&self, counterpart: &ConversationId) -> ChatResult<Vec<Message>> {
        let path = format!("/chat/conversations/{}/messages", counterpart.0);
        let body = self
            .execute(self.request(Method::GET, &path), "listMessages")
            .await?;
        let messages = normalize::messages(body, counterpart);
        debug!(%counterpart, count = messages.len(), "messages listed");
        Ok(messages)
    }

    async fn send_message(&self, counterpart: &ConversationId, text: &str) -> ChatResult<Message> {
        if text.trim().is_empty() {
            return Err(ChatError::Validation("message text must not be empty".to_string()));
        }
        let path = format!("/chat/conversations/{}/messages", counterpart.0);
        let body = self
            .execute(
                self.request(Method::POST, &path).json(&json!({ "text": text })),
                "sendMessage",
            )
            .await?;
        let raw = normalize::single_item(body);
        let message = normalize::message(&raw, counterpart).ok_or_else(|| {
            ChatError::Transport("sendMessage: response carried no message id".to_string())
        })?;
        debug!(%counterpart, id = %message.id, "message sent");
        Ok(message)
    }

    async fn acknowledge_read(&self, message: &MessageId) -> ChatResult<()> {
        let path = format!("/chat/messages/{}/read", message.0);
        self.execute(self.request(Method::POST, &path), "acknowledgeRead")
            .await
            .map(|_| ())
    }
}
