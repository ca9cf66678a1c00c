use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;

use crate::api::ChatApi;
use crate::error::{ChatError, ChatResult};
use crate::model::{ConfirmationState, Conversation, ConversationId, Message, MessageId, Sender};

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn server_message(
    conversation: &str,
    id: &str,
    sender: Sender,
    text: &str,
    secs: i64,
    read: bool,
) -> Message {
    Message {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation),
        sender,
        text: text.to_string(),
        timestamp: at(secs),
        read,
        confirmation: ConfirmationState::Confirmed,
    }
}

pub fn summary(id: &str, unread: u32) -> Conversation {
    Conversation {
        counterpart_id: ConversationId::from(id),
        counterpart_display_name: format!("User {id}"),
        last_message: None,
        unread_count: unread,
    }
}

/// In-memory stand-in for the console API.
#[derive(Default)]
pub struct FakeChatApi {
    conversations: Mutex<Vec<Conversation>>,
    conversations_error: Mutex<Option<ChatError>>,
    messages: Mutex<HashMap<ConversationId, Vec<Message>>>,
    messages_error: Mutex<Option<ChatError>>,
    send_error: Mutex<Option<ChatError>>,
    ack_failures: Mutex<HashSet<MessageId>>,
    acked: Mutex<Vec<MessageId>>,
    ack_attempts: Mutex<Vec<MessageId>>,
    gates: Mutex<HashMap<ConversationId, Arc<Notify>>>,
    send_gate: Mutex<Option<Arc<Notify>>>,
    next_id: AtomicU64,
    list_conversation_calls: AtomicUsize,
    list_message_calls: AtomicUsize,
    send_calls: AtomicUsize,
}

impl FakeChatApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1000),
            ..Self::default()
        })
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        *self.conversations.lock().unwrap() = conversations;
    }

    pub fn fail_conversations(&self, error: Option<ChatError>) {
        *self.conversations_error.lock().unwrap() = error;
    }

    pub fn set_messages(&self, conversation: &str, messages: Vec<Message>) {
        self.messages
            .lock()
            .unwrap()
            .insert(ConversationId::from(conversation), messages);
    }

    pub fn fail_messages(&self, error: Option<ChatError>) {
        *self.messages_error.lock().unwrap() = error;
    }

    pub fn fail_sends(&self, error: Option<ChatError>) {
        *self.send_error.lock().unwrap() = error;
    }

    pub fn fail_ack(&self, id: &str) {
        self.ack_failures.lock().unwrap().insert(MessageId::from(id));
    }

    pub fn acked(&self) -> Vec<MessageId> {
        self.acked.lock().unwrap().clone()
    }

    /// Every acknowledgment request, including the refused ones.
    pub fn ack_attempts(&self, id: &str) -> usize {
        let id = MessageId::from(id);
        self.ack_attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|attempt| **attempt == id)
            .count()
    }

    /// Park `list_messages` for a conversation until the returned handle is notified.
    pub fn hold_messages(&self, conversation: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(ConversationId::from(conversation), gate.clone());
        gate
    }

    pub fn hold_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn list_conversation_calls(&self) -> usize {
        self.list_conversation_calls.load(Ordering::SeqCst)
    }

    pub fn list_message_calls(&self) -> usize {
        self.list_message_calls.load(Ordering::SeqCst)
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn list_conversations(&self) -> ChatResult<Vec<Conversation>> {
        self.list_conversation_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.conversations_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn list_messages(&self, counterpart: &ConversationId) -> ChatResult<Vec<Message>> {
        self.list_message_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().unwrap().get(counterpart).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(err) = self.messages_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(counterpart)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(&self, counterpart: &ConversationId, text: &str) -> ChatResult<Message> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.send_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(err) = self.send_error.lock().unwrap().clone() {
            return Err(err);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = Message {
            id: MessageId(id.to_string()),
            conversation_id: counterpart.clone(),
            sender: Sender::Operator,
            text: text.to_string(),
            timestamp: Utc::now(),
            read: true,
            confirmation: ConfirmationState::Confirmed,
        };
        self.messages
            .lock()
            .unwrap()
            .entry(counterpart.clone())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn acknowledge_read(&self, message: &MessageId) -> ChatResult<()> {
        self.ack_attempts.lock().unwrap().push(message.clone());
        if self.ack_failures.lock().unwrap().contains(message) {
            return Err(ChatError::Transport(format!("ack {message} refused")));
        }
        self.acked.lock().unwrap().push(message.clone());
        Ok(())
    }
}
