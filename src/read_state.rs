use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::ChatApi;
use crate::lock;
use crate::model::{Message, MessageId};

/// Finds counterpart messages the operator has now seen and tells the server.
///
/// Local read flags are never flipped here: a message keeps scanning as unread
/// until a snapshot reports it read, which is what gives failed
/// acknowledgments their retry on the next merge.
#[derive(Debug, Clone, Default)]
pub struct ReadStateTracker {
    in_flight: Arc<Mutex<HashSet<MessageId>>>,
}

impl ReadStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scan_unread(log: &[Message]) -> HashSet<MessageId> {
        log.iter()
            .filter(|m| m.is_unread())
            .map(|m| m.id.clone())
            .collect()
    }

    /// Fire one acknowledgment per id. Ids whose earlier acknowledgment is still
    /// outstanding are skipped. Never blocks the caller; failures are logged.
    pub fn acknowledge(
        &self,
        api: Arc<dyn ChatApi>,
        ids: HashSet<MessageId>,
    ) -> Vec<JoinHandle<()>> {
        let fresh: Vec<MessageId> = {
            let mut in_flight = lock(&self.in_flight);
            ids.into_iter().filter(|id| in_flight.insert(id.clone())).collect()
        };
        if fresh.is_empty() {
            return Vec::new();
        }
        debug!(count = fresh.len(), "acknowledging unread messages");

        fresh
            .into_iter()
            .map(|id| {
                let api = api.clone();
                let in_flight = self.in_flight.clone();
                tokio::spawn(async move {
                    if let Err(err) = api.acknowledge_read(&id).await {
                        warn!(%id, ?err, "read acknowledgment failed; retrying next cycle");
                    }
                    lock(&in_flight).remove(&id);
                })
            })
            .collect()
    }
}
