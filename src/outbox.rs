use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use crate::api::ChatApi;
use crate::error::ChatError;
use crate::lock;
use crate::model::{ConfirmationState, ConversationId, Message};
use crate::store::MessageStore;

#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct SendError {
    #[source]
    pub error: ChatError,
    /// The optimistic entry that was withdrawn, tagged `Failed`. `None` when the
    /// send was rejected before anything was shown.
    pub attempt: Option<Message>,
}

impl SendError {
    fn rejected(error: ChatError) -> Self {
        Self {
            error,
            attempt: None,
        }
    }
}

/// Outgoing sends with local echo. Each send shows up in the store at once as
/// a pending operator message and is reconciled against the server response.
pub struct OptimisticSendQueue {
    api: Arc<dyn ChatApi>,
    store: Arc<Mutex<MessageStore>>,
    drafts: Mutex<HashMap<ConversationId, String>>,
}

impl OptimisticSendQueue {
    pub fn new(api: Arc<dyn ChatApi>, store: Arc<Mutex<MessageStore>>) -> Self {
        Self {
            api,
            store,
            drafts: Mutex::new(HashMap::new()),
        }
    }

    pub fn draft(&self, conversation: &ConversationId) -> String {
        lock(&self.drafts).get(conversation).cloned().unwrap_or_default()
    }

    pub fn set_draft(&self, conversation: &ConversationId, text: impl Into<String>) {
        lock(&self.drafts).insert(conversation.clone(), text.into());
    }

    pub fn clear_drafts(&self) {
        lock(&self.drafts).clear();
    }

    /// Send `text` to `conversation`.
    ///
    /// Blank text is rejected before any request. Otherwise the compose buffer
    /// is cleared and a pending echo is stored; on success the echo is swapped
    /// for the confirmed message, on failure it is withdrawn and the text goes
    /// back into the compose buffer.
    pub async fn send(&self, conversation: &ConversationId, text: &str) -> Result<Message, SendError> {
        let body = text.trim();
        if body.is_empty() {
            return Err(SendError::rejected(ChatError::Validation(
                "message text must not be empty".to_string(),
            )));
        }

        let echo = Message::pending(conversation.clone(), body);
        let local_id = echo.id.clone();
        lock(&self.store).insert_pending(echo);
        lock(&self.drafts).remove(conversation);
        debug!(%conversation, %local_id, "optimistic message queued");

        match self.api.send_message(conversation, body).await {
            Ok(confirmed) => {
                let replaced = lock(&self.store).reconcile(&local_id, confirmed.clone());
                debug!(%conversation, %local_id, id = %confirmed.id, replaced, "send confirmed");
                Ok(confirmed)
            }
            Err(error) => {
                let attempt = lock(&self.store)
                    .remove(conversation, &local_id)
                    .map(|mut message| {
                        message.confirmation = ConfirmationState::Failed;
                        message
                    });
                self.restore_draft(conversation, text);
                warn!(%conversation, %local_id, ?error, "send failed; draft restored");
                Err(SendError { error, attempt })
            }
        }
    }

    // Anything typed while the send was in flight stays after the restored text.
    fn restore_draft(&self, conversation: &ConversationId, text: &str) {
        let mut drafts = lock(&self.drafts);
        let draft = drafts.entry(conversation.clone()).or_default();
        if draft.is_empty() {
            *draft = text.to_string();
        } else {
            *draft = format!("{text}\n{draft}");
        }
    }
}
