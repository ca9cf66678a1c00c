use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::model::{ConversationId, Message, MessageId, Sender};

/// Per-conversation message logs. Every mutation replaces a conversation's log
/// wholesale, so a reader never observes a half-applied merge.
///
/// A log only counts as loaded once a server snapshot has been merged into it.
/// Local echoes alone never make it authoritative for unread counts.
#[derive(Debug, Default)]
pub struct MessageStore {
    logs: HashMap<ConversationId, Vec<Message>>,
    loaded: HashSet<ConversationId>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a complete server snapshot (oldest first) into the local log.
    ///
    /// Pending operator messages are consumed by newly seen confirmed messages
    /// carrying the same text, oldest pending first. Confirmed messages are
    /// unique by id with the snapshot's copy winning. Confirmed messages the
    /// snapshot no longer lists are kept.
    pub fn merge(&mut self, conversation_id: &ConversationId, snapshot: Vec<Message>) -> &[Message] {
        let current = self.logs.remove(conversation_id).unwrap_or_default();
        let known: HashSet<&MessageId> = current
            .iter()
            .filter(|m| !m.is_pending())
            .map(|m| &m.id)
            .collect();

        // Collapse overlapping ranges: first position wins, last payload wins.
        let mut incoming: Vec<Message> = Vec::with_capacity(snapshot.len());
        let mut incoming_pos: HashMap<MessageId, usize> = HashMap::new();
        for message in snapshot {
            match incoming_pos.get(&message.id) {
                Some(&pos) => incoming[pos] = message,
                None => {
                    incoming_pos.insert(message.id.clone(), incoming.len());
                    incoming.push(message);
                }
            }
        }

        let mut unmatched_texts: Vec<&str> = incoming
            .iter()
            .filter(|m| m.sender == Sender::Operator && !known.contains(&m.id))
            .map(|m| m.text.as_str())
            .collect();

        let mut reconciled = 0usize;
        let mut consumed: HashSet<MessageId> = HashSet::new();
        for message in current.iter().filter(|m| m.is_pending()) {
            if let Some(pos) = unmatched_texts.iter().position(|t| *t == message.text) {
                unmatched_texts.swap_remove(pos);
                consumed.insert(message.id.clone());
                reconciled += 1;
            }
        }

        let mut merged: Vec<Message> = Vec::with_capacity(current.len() + incoming.len());
        let mut placed: HashSet<MessageId> = HashSet::new();
        for message in current {
            if consumed.contains(&message.id) {
                continue;
            }
            match incoming_pos.get(&message.id) {
                Some(&pos) if !message.is_pending() => {
                    placed.insert(message.id.clone());
                    merged.push(incoming[pos].clone());
                }
                _ => merged.push(message),
            }
        }
        let before = merged.len();
        merged.extend(incoming.into_iter().filter(|m| !placed.contains(&m.id)));
        merged.sort_by_key(|m| m.timestamp);

        trace!(
            conversation = %conversation_id,
            reconciled,
            added = merged.len() - before,
            total = merged.len(),
            "snapshot merged"
        );
        self.loaded.insert(conversation_id.clone());
        self.logs.entry(conversation_id.clone()).or_insert(merged)
    }

    /// Append a local echo. Creates the log if the conversation was not loaded yet.
    pub fn insert_pending(&mut self, message: Message) {
        let log = self.logs.entry(message.conversation_id.clone()).or_default();
        let at = log.partition_point(|m| m.timestamp <= message.timestamp);
        log.insert(at, message);
    }

    /// Swap a pending entry for its confirmed counterpart.
    ///
    /// Returns `false` when nothing changed: either a merge already brought the
    /// confirmed message in (the pending entry is dropped if still present), or
    /// the conversation was cleared in the meantime.
    pub fn reconcile(&mut self, local_id: &MessageId, confirmed: Message) -> bool {
        let Some(current) = self.logs.get(&confirmed.conversation_id) else {
            debug!(%local_id, "conversation no longer loaded; confirmation ignored");
            return false;
        };
        let already_merged = current.iter().any(|m| m.id == confirmed.id);
        let pending_at = current.iter().position(|m| &m.id == local_id);

        let mut next: Vec<Message> = current.clone();
        let changed = match (already_merged, pending_at) {
            (true, Some(pos)) => {
                next.remove(pos);
                false
            }
            (true, None) => return false,
            (false, Some(pos)) => {
                next[pos] = confirmed.clone();
                true
            }
            (false, None) => {
                // Merge consumed the echo with a different confirmed entry; the
                // one we were handed will arrive with the next snapshot.
                return false;
            }
        };
        next.sort_by_key(|m| m.timestamp);
        self.logs.insert(confirmed.conversation_id, next);
        changed
    }

    pub fn remove(&mut self, conversation_id: &ConversationId, id: &MessageId) -> Option<Message> {
        let log = self.logs.get_mut(conversation_id)?;
        let pos = log.iter().position(|m| &m.id == id)?;
        Some(log.remove(pos))
    }

    pub fn log(&self, conversation_id: &ConversationId) -> Option<&[Message]> {
        self.logs.get(conversation_id).map(Vec::as_slice)
    }

    pub fn is_loaded(&self, conversation_id: &ConversationId) -> bool {
        self.loaded.contains(conversation_id)
    }

    /// Drop the local view of a conversation. Server state is untouched.
    pub fn clear(&mut self, conversation_id: &ConversationId) {
        self.loaded.remove(conversation_id);
        if self.logs.remove(conversation_id).is_some() {
            debug!(conversation = %conversation_id, "local log cleared");
        }
    }

    pub fn clear_all(&mut self) {
        self.logs.clear();
        self.loaded.clear();
    }

    /// Unread count from the local log, or `None` until a snapshot has been
    /// merged for the conversation.
    pub fn unread_count(&self, conversation_id: &ConversationId) -> Option<usize> {
        if !self.is_loaded(conversation_id) {
            return None;
        }
        self.logs
            .get(conversation_id)
            .map(|log| log.iter().filter(|m| m.is_unread()).count())
    }
}
