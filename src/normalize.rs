//! Boundary between the console API's loosely shaped JSON and the canonical
//! model. Every accepted spelling of a field is resolved here, once; nothing
//! past this module looks at raw payloads.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::warn;

use crate::model::{ConfirmationState, Conversation, ConversationId, Message, MessageId, Sender};

const ENVELOPE_KEYS: &[&str] = &["data", "items", "messages", "conversations", "results"];
const ID_KEYS: &[&str] = &["id", "_id", "message_id", "messageId"];
const TEXT_KEYS: &[&str] = &["text", "content", "message", "body"];
const SENDER_KEYS: &[&str] = &["sender", "sender_type", "senderType", "from", "role"];
const OPERATOR_FLAG_KEYS: &[&str] = &["is_admin", "isAdmin", "from_admin", "is_operator", "from_me"];
const TIMESTAMP_KEYS: &[&str] = &["created_at", "createdAt", "timestamp", "sent_at", "sentAt"];
const READ_KEYS: &[&str] = &["is_read", "isRead", "read"];
const READ_AT_KEYS: &[&str] = &["read_at", "readAt"];
const COUNTERPART_ID_KEYS: &[&str] = &["user_id", "userId", "counterpart_id", "counterpartId", "id"];
const COUNTERPART_NAME_KEYS: &[&str] = &[
    "user_name",
    "userName",
    "display_name",
    "displayName",
    "name",
    "username",
];
const LAST_MESSAGE_KEYS: &[&str] = &["last_message", "lastMessage", "latest_message"];
const UNREAD_KEYS: &[&str] = &["unread_count", "unreadCount", "unread"];

/// Unwrap `{ "data": [...] }` style envelopes; a bare array passes through.
pub fn list_items(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            for key in ENVELOPE_KEYS {
                if let Some(inner) = map.remove(*key) {
                    return list_items(inner);
                }
            }
            warn!("response object carried no recognised list envelope");
            Vec::new()
        }
        _ => Vec::new(),
    }
}

/// Unwrap a single-object envelope such as `{ "data": {...} }`.
pub fn single_item(body: Value) -> Value {
    match body {
        Value::Object(mut map) => {
            for key in ["data", "message", "item"] {
                if matches!(map.get(key), Some(Value::Object(_))) {
                    if let Some(inner) = map.remove(key) {
                        return inner;
                    }
                }
            }
            Value::Object(map)
        }
        other => other,
    }
}

pub fn message(raw: &Value, conversation_id: &ConversationId) -> Option<Message> {
    let Some(id) = first_id(raw, ID_KEYS) else {
        warn!(conversation = %conversation_id, "dropping message without an id");
        return None;
    };
    let text = first_str(raw, TEXT_KEYS).unwrap_or_default().to_string();
    let sender = sender(raw);
    let read = match sender {
        Sender::Operator => true,
        Sender::User => read_flag(raw),
    };

    Some(Message {
        id: MessageId(id),
        conversation_id: conversation_id.clone(),
        sender,
        text,
        timestamp: timestamp(raw),
        read,
        confirmation: ConfirmationState::Confirmed,
    })
}

pub fn messages(body: Value, conversation_id: &ConversationId) -> Vec<Message> {
    list_items(body)
        .iter()
        .filter_map(|raw| message(raw, conversation_id))
        .collect()
}

pub fn conversation(raw: &Value) -> Option<Conversation> {
    let Some(id) = first_id(raw, COUNTERPART_ID_KEYS) else {
        warn!("dropping conversation without a counterpart id");
        return None;
    };
    let counterpart_id = ConversationId(id);
    let counterpart_display_name = first_str(raw, COUNTERPART_NAME_KEYS)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| counterpart_id.0.clone());

    let last_message = LAST_MESSAGE_KEYS
        .iter()
        .find_map(|key| raw.get(*key))
        .and_then(|value| match value {
            Value::Object(_) => message(value, &counterpart_id),
            // A bare string is only a preview; there is no id to key it by.
            Value::String(text) if !text.is_empty() => Some(Message {
                id: MessageId(format!("summary-{}", counterpart_id.0)),
                conversation_id: counterpart_id.clone(),
                sender: Sender::User,
                text: text.clone(),
                timestamp: timestamp(raw),
                read: true,
                confirmation: ConfirmationState::Confirmed,
            }),
            _ => None,
        });

    let unread_count = UNREAD_KEYS
        .iter()
        .find_map(|key| raw.get(*key))
        .and_then(as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(0);

    Some(Conversation {
        counterpart_id,
        counterpart_display_name,
        last_message,
        unread_count,
    })
}

pub fn conversations(body: Value) -> Vec<Conversation> {
    list_items(body).iter().filter_map(conversation).collect()
}

fn sender(raw: &Value) -> Sender {
    if let Some(label) = first_str(raw, SENDER_KEYS) {
        return match label.trim().to_ascii_lowercase().as_str() {
            "admin" | "operator" | "staff" | "agent" | "support" | "system" => Sender::Operator,
            _ => Sender::User,
        };
    }
    let operator_flag = OPERATOR_FLAG_KEYS
        .iter()
        .find_map(|key| raw.get(*key))
        .and_then(as_bool)
        .unwrap_or(false);
    if operator_flag {
        Sender::Operator
    } else {
        Sender::User
    }
}

fn read_flag(raw: &Value) -> bool {
    if let Some(flag) = READ_KEYS.iter().find_map(|key| raw.get(*key)).and_then(as_bool) {
        return flag;
    }
    READ_AT_KEYS
        .iter()
        .find_map(|key| raw.get(*key))
        .is_some_and(|value| !value.is_null())
}

/// Creation time of a payload. Anything missing or unparseable becomes "now" so
/// a bad timestamp can never fail a merge.
pub fn timestamp(raw: &Value) -> DateTime<Utc> {
    TIMESTAMP_KEYS
        .iter()
        .find_map(|key| raw.get(*key))
        .and_then(parse_instant)
        .unwrap_or_else(Utc::now)
}

pub fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => {
            let text = text.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.with_timezone(&Utc));
            }
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
                return Some(naive.and_utc());
            }
            text.parse::<i64>().ok().and_then(from_epoch)
        }
        Value::Number(number) => number.as_i64().and_then(from_epoch),
        _ => None,
    }
}

// Values past year 2286 in seconds are taken to be milliseconds.
fn from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    if raw.abs() >= 10_000_000_000 {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}

fn first_str<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| raw.get(*key).and_then(Value::as_str))
}

fn first_id(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match raw.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
