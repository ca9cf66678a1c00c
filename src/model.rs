use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const LOCAL_ID_PREFIX: &str = "local-";

/// Remote user on the other side of a conversation. A conversation is keyed by
/// its counterpart, so this doubles as the conversation id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(pub String);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub String);

impl MessageId {
    /// Placeholder id for an optimistic message. Lives in its own namespace so it
    /// can never be mistaken for a server-assigned id.
    pub fn local() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Operator,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationState {
    Pending,
    #[default]
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Only meaningful for `Sender::User`; operator messages are implicitly read.
    pub read: bool,
    pub confirmation: ConfirmationState,
}

impl Message {
    /// Local echo of an outgoing operator message, stamped with the wall clock.
    pub fn pending(conversation_id: ConversationId, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::local(),
            conversation_id,
            sender: Sender::Operator,
            text: text.into(),
            timestamp: Utc::now(),
            read: true,
            confirmation: ConfirmationState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.confirmation == ConfirmationState::Pending
    }

    pub fn is_unread(&self) -> bool {
        self.sender == Sender::User && !self.read
    }
}

/// Conversation row shown to the operator. As returned by the list endpoint
/// `unread_count` is the server's figure; `ConversationIndex` replaces it with
/// the live count whenever the conversation's log is loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub counterpart_id: ConversationId,
    pub counterpart_display_name: String,
    pub last_message: Option<Message>,
    pub unread_count: u32,
}
