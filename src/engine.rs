//! The chat screen's engine: owns the message store, conversation index,
//! send queue, read tracking and poll scheduling, and is the only way in to
//! any of them.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::error::{ChatError, ChatResult};
use crate::index::ConversationIndex;
use crate::lock;
use crate::model::{Conversation, ConversationId, Message};
use crate::outbox::{OptimisticSendQueue, SendError};
use crate::read_state::ReadStateTracker;
use crate::scheduler::{PollJob, PollScheduler, PollState, PollTarget};
use crate::settings::Settings;
use crate::store::MessageStore;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum ChatEvent {
    ConversationsUpdated(Vec<Conversation>),
    MessagesUpdated {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    SendFailed {
        conversation_id: ConversationId,
        error: ChatError,
        draft: String,
    },
    /// The API rejected the session. Polling has stopped; tearing the session
    /// down is up to the subscriber.
    SessionExpired,
}

#[derive(Debug, Clone, Copy)]
pub struct PollIntervals {
    pub conversations: Duration,
    pub messages: Duration,
}

impl From<&Settings> for PollIntervals {
    fn from(settings: &Settings) -> Self {
        Self {
            conversations: settings.conversation_poll_interval(),
            messages: settings.message_poll_interval(),
        }
    }
}

struct Shared {
    api: Arc<dyn ChatApi>,
    store: Arc<Mutex<MessageStore>>,
    index: Mutex<ConversationIndex>,
    outbox: OptimisticSendQueue,
    reads: ReadStateTracker,
    scheduler: PollScheduler,
    active: Mutex<Option<ConversationId>>,
    events: broadcast::Sender<ChatEvent>,
    intervals: PollIntervals,
}

#[derive(Clone)]
pub struct ChatEngine {
    shared: Arc<Shared>,
}

impl ChatEngine {
    pub fn new(api: Arc<dyn ChatApi>, intervals: PollIntervals) -> Self {
        let store = Arc::new(Mutex::new(MessageStore::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Shared {
            outbox: OptimisticSendQueue::new(api.clone(), store.clone()),
            api,
            store,
            index: Mutex::new(ConversationIndex::new()),
            reads: ReadStateTracker::new(),
            scheduler: PollScheduler::new(),
            active: Mutex::new(None),
            events,
            intervals,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn from_settings(api: Arc<dyn ChatApi>, settings: &Settings) -> Self {
        Self::new(api, PollIntervals::from(settings))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.shared.events.subscribe()
    }

    /// Chat screen shown: start polling the conversation list.
    pub fn mount(&self) {
        let job = Arc::new(ConversationListJob {
            shared: Arc::downgrade(&self.shared),
        });
        if self.shared.scheduler.start(
            PollTarget::ConversationList,
            self.shared.intervals.conversations,
            job,
        ) {
            info!("chat screen mounted");
        }
    }

    /// Chat screen left: stop every poll and forget local state.
    pub fn unmount(&self) {
        self.shared.scheduler.stop_all();
        lock(&self.shared.active).take();
        lock(&self.shared.store).clear_all();
        self.shared.outbox.clear_drafts();
        info!("chat screen unmounted");
    }

    /// Select `conversation`, replacing whatever was open. Its log is fetched
    /// immediately and then on the message interval.
    pub fn open_conversation(&self, conversation: &ConversationId) {
        let mut active = lock(&self.shared.active);
        let target = PollTarget::Messages(conversation.clone());
        if active.as_ref() == Some(conversation) && self.shared.scheduler.is_running(&target) {
            return;
        }
        if let Some(previous) = active.take() {
            self.shared.release(&previous);
        }

        let job = Arc::new(MessageLogJob {
            shared: Arc::downgrade(&self.shared),
            conversation: conversation.clone(),
        });
        self.shared
            .scheduler
            .start(target, self.shared.intervals.messages, job);
        *active = Some(conversation.clone());
        info!(%conversation, "conversation opened");
    }

    pub fn close_conversation(&self) {
        if let Some(previous) = lock(&self.shared.active).take() {
            self.shared.release(&previous);
            info!(conversation = %previous, "conversation closed");
        }
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        lock(&self.shared.active).clone()
    }

    /// Out-of-band conversation list refresh.
    pub async fn refresh_conversations(&self) -> ChatResult<Vec<Conversation>> {
        self.shared.refresh_conversations(None).await
    }

    /// Send through the optimistic queue. Any send that reached the API, confirmed
    /// or not, also refreshes the conversation list in the background.
    pub async fn send(&self, conversation: &ConversationId, text: &str) -> Result<Message, SendError> {
        let outcome = self.shared.outbox.send(conversation, text).await;
        self.shared.publish_messages(conversation);

        if let Err(err) = &outcome {
            self.shared.emit(ChatEvent::SendFailed {
                conversation_id: conversation.clone(),
                error: err.error.clone(),
                draft: self.shared.outbox.draft(conversation),
            });
        }
        let attempted = match &outcome {
            Ok(_) => true,
            Err(err) => err.attempt.is_some(),
        };
        if attempted {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(err) = shared.refresh_conversations(None).await {
                    warn!(?err, "conversation refresh after send failed");
                }
            });
        }
        outcome
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.shared.conversation_view()
    }

    pub fn messages(&self, conversation: &ConversationId) -> Option<Vec<Message>> {
        lock(&self.shared.store).log(conversation).map(<[Message]>::to_vec)
    }

    pub fn unread_count(&self, conversation: &ConversationId) -> Option<u32> {
        self.conversations()
            .into_iter()
            .find(|c| &c.counterpart_id == conversation)
            .map(|c| c.unread_count)
    }

    pub fn poll_state(&self, target: &PollTarget) -> PollState {
        self.shared.scheduler.state(target)
    }

    pub fn draft(&self, conversation: &ConversationId) -> String {
        self.shared.outbox.draft(conversation)
    }

    pub fn set_draft(&self, conversation: &ConversationId, text: impl Into<String>) {
        self.shared.outbox.set_draft(conversation, text);
    }
}

impl Shared {
    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // Stop before clearing: a fetch that lands after the clear must already
    // see its token cancelled.
    fn release(&self, conversation: &ConversationId) {
        self.scheduler
            .stop(&PollTarget::Messages(conversation.clone()));
        lock(&self.store).clear(conversation);
    }

    fn conversation_view(&self) -> Vec<Conversation> {
        let store = lock(&self.store);
        let index = lock(&self.index);
        index.view(&store)
    }

    fn publish_messages(&self, conversation: &ConversationId) {
        let messages = lock(&self.store).log(conversation).map(<[Message]>::to_vec);
        if let Some(messages) = messages {
            self.emit(ChatEvent::MessagesUpdated {
                conversation_id: conversation.clone(),
                messages,
            });
        }
    }

    fn expire_session(&self, err: &ChatError) {
        if err.is_auth() {
            self.emit(ChatEvent::SessionExpired);
        }
    }

    async fn refresh_conversations(
        &self,
        token: Option<&CancellationToken>,
    ) -> ChatResult<Vec<Conversation>> {
        let fetched = match self.api.list_conversations().await {
            Ok(fetched) => fetched,
            Err(err) => {
                self.expire_session(&err);
                return Err(err);
            }
        };

        let view = {
            let store = lock(&self.store);
            if token.is_some_and(CancellationToken::is_cancelled) {
                debug!("discarding conversation list from stopped poll");
                return Ok(Vec::new());
            }
            let mut index = lock(&self.index);
            index.replace(fetched);
            index.view(&store)
        };
        self.emit(ChatEvent::ConversationsUpdated(view.clone()));
        Ok(view)
    }

    async fn refresh_messages(
        &self,
        conversation: &ConversationId,
        token: &CancellationToken,
    ) -> ChatResult<()> {
        let snapshot = match self.api.list_messages(conversation).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.expire_session(&err);
                return Err(err);
            }
        };

        let (messages, unread) = {
            let mut store = lock(&self.store);
            if token.is_cancelled() {
                debug!(%conversation, "discarding snapshot for a conversation no longer open");
                return Ok(());
            }
            let log = store.merge(conversation, snapshot);
            (log.to_vec(), ReadStateTracker::scan_unread(log))
        };

        self.emit(ChatEvent::MessagesUpdated {
            conversation_id: conversation.clone(),
            messages,
        });
        self.emit(ChatEvent::ConversationsUpdated(self.conversation_view()));
        if !unread.is_empty() {
            self.reads.acknowledge(self.api.clone(), unread);
        }
        Ok(())
    }
}

struct ConversationListJob {
    shared: Weak<Shared>,
}

#[async_trait]
impl PollJob for ConversationListJob {
    async fn run(&self, token: &CancellationToken) -> ChatResult<()> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        shared.refresh_conversations(Some(token)).await.map(|_| ())
    }
}

struct MessageLogJob {
    shared: Weak<Shared>,
    conversation: ConversationId,
}

#[async_trait]
impl PollJob for MessageLogJob {
    async fn run(&self, token: &CancellationToken) -> ChatResult<()> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        shared.refresh_messages(&self.conversation, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageId, Sender};
    use crate::testing::{server_message, summary, FakeChatApi};
    use tokio::time;

    const LIST_EVERY: Duration = Duration::from_secs(10);
    const MESSAGES_EVERY: Duration = Duration::from_secs(3);

    fn engine(api: &Arc<FakeChatApi>) -> ChatEngine {
        ChatEngine::new(
            api.clone(),
            PollIntervals {
                conversations: LIST_EVERY,
                messages: MESSAGES_EVERY,
            },
        )
    }

    fn id(raw: &str) -> ConversationId {
        ConversationId::from(raw)
    }

    async fn settle() {
        time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn loaded_log_overrides_server_unread_count() {
        let api = FakeChatApi::new();
        api.set_conversations(vec![summary("a", 3), summary("b", 0), summary("c", 1)]);
        api.set_messages(
            "a",
            vec![
                server_message("a", "1", Sender::User, "x", 1, false),
                server_message("a", "2", Sender::User, "y", 2, false),
                server_message("a", "3", Sender::User, "z", 3, true),
            ],
        );
        let engine = engine(&api);
        engine.mount();
        settle().await;
        let before: Vec<u32> = engine.conversations().iter().map(|c| c.unread_count).collect();
        assert_eq!(before, vec![3, 0, 1]);

        engine.open_conversation(&id("a"));
        settle().await;
        assert_eq!(engine.unread_count(&id("a")), Some(2));
        assert_eq!(engine.unread_count(&id("c")), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn switching_conversations_discards_late_snapshot() {
        let api = FakeChatApi::new();
        api.set_messages("a", vec![server_message("a", "1", Sender::User, "from a", 1, true)]);
        api.set_messages("b", vec![server_message("b", "2", Sender::User, "from b", 1, true)]);
        let gate = api.hold_messages("a");
        let engine = engine(&api);

        engine.open_conversation(&id("a"));
        settle().await;
        engine.open_conversation(&id("b"));
        settle().await;

        gate.notify_one();
        settle().await;

        assert!(engine.messages(&id("a")).is_none());
        let b = engine.messages(&id("b")).unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].text, "from b");
        assert_eq!(engine.poll_state(&PollTarget::Messages(id("a"))), PollState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_server_state_polled_repeatedly_does_not_grow() {
        let api = FakeChatApi::new();
        api.set_messages(
            "a",
            vec![
                server_message("a", "1", Sender::User, "x", 1, true),
                server_message("a", "2", Sender::Operator, "y", 2, true),
            ],
        );
        let engine = engine(&api);
        engine.open_conversation(&id("a"));

        time::sleep(MESSAGES_EVERY * 9 + Duration::from_millis(10)).await;
        assert_eq!(api.list_message_calls(), 10);
        assert_eq!(engine.messages(&id("a")).unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unread_messages_are_acknowledged_and_failures_retried() {
        let api = FakeChatApi::new();
        api.set_messages(
            "a",
            vec![
                server_message("a", "1", Sender::User, "x", 1, false),
                server_message("a", "2", Sender::User, "y", 2, false),
            ],
        );
        api.fail_ack("1");
        let engine = engine(&api);
        engine.open_conversation(&id("a"));
        settle().await;
        assert_eq!(api.acked(), vec![MessageId::from("2")]);

        assert_eq!(api.ack_attempts("1"), 1);

        // Server never flipped the flags, so both scan as unread next cycle.
        time::sleep(MESSAGES_EVERY).await;
        assert_eq!(api.ack_attempts("1"), 2);
        assert_eq!(api.ack_attempts("2"), 2);
        assert_eq!(
            api.acked(),
            vec![MessageId::from("2"), MessageId::from("2")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_refreshes_conversation_list() {
        let api = FakeChatApi::new();
        api.set_conversations(vec![summary("a", 0)]);
        let engine = engine(&api);
        engine.mount();
        engine.open_conversation(&id("a"));
        settle().await;
        let calls = api.list_conversation_calls();

        engine.send(&id("a"), "hello").await.unwrap();
        settle().await;
        assert_eq!(api.list_conversation_calls(), calls + 1);

        // The next message poll sees the sent message; it must not duplicate.
        time::sleep(MESSAGES_EVERY).await;
        let log = engine.messages(&id("a")).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_restores_draft_and_reports() {
        let api = FakeChatApi::new();
        api.fail_sends(Some(ChatError::Transport("timeout".into())));
        let engine = engine(&api);
        let mut events = engine.subscribe();
        engine.open_conversation(&id("a"));
        settle().await;

        engine.set_draft(&id("a"), "hi");
        let err = engine.send(&id("a"), "hi").await.unwrap_err();
        assert!(matches!(err.error, ChatError::Transport(_)));
        assert_eq!(engine.draft(&id("a")), "hi");
        assert!(engine.messages(&id("a")).unwrap().is_empty());

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let ChatEvent::SendFailed { draft, .. } = event {
                assert_eq!(draft, "hi");
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_still_refreshes_conversation_list() {
        let api = FakeChatApi::new();
        api.fail_sends(Some(ChatError::Transport("timeout".into())));
        let engine = engine(&api);
        engine.mount();
        settle().await;
        let calls = api.list_conversation_calls();

        engine.send(&id("a"), "hi").await.unwrap_err();
        settle().await;
        assert_eq!(api.list_conversation_calls(), calls + 1);

        // Blank text never reaches the API, so nothing to refresh.
        engine.send(&id("a"), "  ").await.unwrap_err();
        settle().await;
        assert_eq!(api.list_conversation_calls(), calls + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_to_unopened_conversation_keeps_server_unread_count() {
        let api = FakeChatApi::new();
        api.set_conversations(vec![summary("a", 5)]);
        let engine = engine(&api);
        engine.mount();
        settle().await;

        engine.send(&id("a"), "hello").await.unwrap();
        time::sleep(Duration::from_secs(30)).await;

        assert!(engine.active_conversation().is_none());
        assert_eq!(engine.unread_count(&id("a")), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn server_count_holds_until_first_snapshot_lands() {
        let api = FakeChatApi::new();
        api.set_conversations(vec![summary("a", 2)]);
        api.set_messages(
            "a",
            vec![
                server_message("a", "1", Sender::User, "x", 1, false),
                server_message("a", "2", Sender::User, "y", 2, false),
            ],
        );
        let gate = api.hold_messages("a");
        let engine = engine(&api);
        engine.mount();
        settle().await;

        engine.open_conversation(&id("a"));
        engine.send(&id("a"), "on it").await.unwrap();
        settle().await;
        assert_eq!(engine.unread_count(&id("a")), Some(2));

        gate.notify_one();
        settle().await;
        assert_eq!(engine.unread_count(&id("a")), Some(2));
        assert_eq!(engine.messages(&id("a")).unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_session_stops_polling() {
        let api = FakeChatApi::new();
        api.fail_conversations(Some(ChatError::Auth("token expired".into())));
        let engine = engine(&api);
        let mut events = engine.subscribe();
        engine.mount();
        engine.open_conversation(&id("a"));
        settle().await;

        assert_eq!(engine.poll_state(&PollTarget::ConversationList), PollState::Idle);
        assert_eq!(engine.poll_state(&PollTarget::Messages(id("a"))), PollState::Idle);

        let mut expired = false;
        while let Ok(event) = events.try_recv() {
            expired |= matches!(event, ChatEvent::SessionExpired);
        }
        assert!(expired);

        time::sleep(LIST_EVERY * 2).await;
        assert_eq!(api.list_conversation_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_keeps_last_good_log() {
        let api = FakeChatApi::new();
        api.set_messages("a", vec![server_message("a", "1", Sender::User, "x", 1, true)]);
        let engine = engine(&api);
        engine.open_conversation(&id("a"));
        settle().await;

        api.fail_messages(Some(ChatError::Transport("502".into())));
        time::sleep(MESSAGES_EVERY * 2).await;
        assert_eq!(engine.messages(&id("a")).unwrap().len(), 1);
        assert_eq!(
            engine.poll_state(&PollTarget::Messages(id("a"))),
            PollState::Scheduled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn closing_returns_target_to_idle_and_clears_log() {
        let api = FakeChatApi::new();
        api.set_messages("a", vec![server_message("a", "1", Sender::User, "x", 1, true)]);
        let engine = engine(&api);
        engine.mount();
        engine.open_conversation(&id("a"));
        settle().await;
        assert!(engine.messages(&id("a")).is_some());

        engine.close_conversation();
        assert!(engine.active_conversation().is_none());
        assert!(engine.messages(&id("a")).is_none());
        assert_eq!(engine.poll_state(&PollTarget::Messages(id("a"))), PollState::Idle);
        assert_eq!(
            engine.poll_state(&PollTarget::ConversationList),
            PollState::Scheduled
        );

        engine.unmount();
        assert_eq!(engine.poll_state(&PollTarget::ConversationList), PollState::Idle);
    }
}
