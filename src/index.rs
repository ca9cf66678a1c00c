use tracing::debug;

use crate::model::Conversation;
use crate::store::MessageStore;

/// Conversation list in server order. Membership and summaries are whatever
/// the last successful list fetch said.
#[derive(Debug, Default)]
pub struct ConversationIndex {
    conversations: Vec<Conversation>,
}

impl ConversationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list wholesale with a fresh server response.
    pub fn replace(&mut self, conversations: Vec<Conversation>) {
        debug!(count = conversations.len(), "conversation index replaced");
        self.conversations = conversations;
    }

    /// The list as the operator should see it: server order, with each unread
    /// badge taken from the loaded log when there is one.
    pub fn view(&self, store: &MessageStore) -> Vec<Conversation> {
        self.conversations
            .iter()
            .map(|conversation| Conversation {
                unread_count: resolve_unread(store, conversation),
                ..conversation.clone()
            })
            .collect()
    }
}

fn resolve_unread(store: &MessageStore, conversation: &Conversation) -> u32 {
    store
        .unread_count(&conversation.counterpart_id)
        .map(|live| u32::try_from(live).unwrap_or(u32::MAX))
        .unwrap_or(conversation.unread_count)
}
