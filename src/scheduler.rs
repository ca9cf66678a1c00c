//! Fixed-interval polling with one lifecycle per target.
//!
//! Each target runs `Idle -> Scheduled -> Fetching -> Scheduled` until it is
//! stopped. A tick that lands while the previous fetch is still outstanding is
//! dropped, never queued. Stopping cancels the timer but leaves an in-flight
//! fetch running; the job sees its token cancelled and discards the result.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::ChatResult;
use crate::lock;
use crate::model::ConversationId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PollTarget {
    ConversationList,
    Messages(ConversationId),
}

impl fmt::Display for PollTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollTarget::ConversationList => f.write_str("conversations"),
            PollTarget::Messages(id) => write!(f, "messages/{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Scheduled,
    Fetching,
}

/// One fetch-and-apply cycle for a target.
#[async_trait]
pub trait PollJob: Send + Sync + 'static {
    /// `token` is cancelled once the target is stopped; a job must check it
    /// before applying anything it fetched.
    async fn run(&self, token: &CancellationToken) -> ChatResult<()>;
}

struct TargetHandle {
    token: CancellationToken,
    state: Arc<Mutex<PollState>>,
}

type Targets = Arc<Mutex<HashMap<PollTarget, TargetHandle>>>;

#[derive(Clone, Default)]
pub struct PollScheduler {
    targets: Targets,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin polling `target`, fetching immediately and then every `period`.
    /// Returns `false` if the target is already running.
    pub fn start(&self, target: PollTarget, period: Duration, job: Arc<dyn PollJob>) -> bool {
        let mut targets = lock(&self.targets);
        if targets.contains_key(&target) {
            debug!(%target, "poll target already running");
            return false;
        }

        let token = CancellationToken::new();
        let state = Arc::new(Mutex::new(PollState::Scheduled));
        targets.insert(
            target.clone(),
            TargetHandle {
                token: token.clone(),
                state: state.clone(),
            },
        );
        drop(targets);

        debug!(%target, period_ms = period.as_millis() as u64, "poll target started");
        tokio::spawn(run_target(
            target,
            period,
            job,
            token,
            state,
            self.targets.clone(),
        ));
        true
    }

    /// Return `target` to Idle. An outstanding fetch keeps running but its
    /// result will be discarded.
    pub fn stop(&self, target: &PollTarget) {
        let handle = lock(&self.targets).remove(target);
        if let Some(handle) = handle {
            shut(target, &handle);
        }
    }

    pub fn stop_all(&self) {
        stop_all_targets(&self.targets);
    }

    pub fn state(&self, target: &PollTarget) -> PollState {
        lock(&self.targets)
            .get(target)
            .map(|handle| *lock(&handle.state))
            .unwrap_or(PollState::Idle)
    }

    pub fn is_running(&self, target: &PollTarget) -> bool {
        lock(&self.targets).contains_key(target)
    }
}

async fn run_target(
    target: PollTarget,
    period: Duration,
    job: Arc<dyn PollJob>,
    token: CancellationToken,
    state: Arc<Mutex<PollState>>,
    targets: Targets,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                {
                    let mut current = lock(&state);
                    if *current == PollState::Fetching {
                        trace!(%target, "tick skipped; fetch still in flight");
                        continue;
                    }
                    *current = PollState::Fetching;
                }

                let job = job.clone();
                let token = token.clone();
                let state = state.clone();
                let targets = targets.clone();
                let target = target.clone();
                // Detached so that stopping the target never aborts the request.
                tokio::spawn(async move {
                    let outcome = job.run(&token).await;
                    {
                        let mut current = lock(&state);
                        if !token.is_cancelled() {
                            *current = PollState::Scheduled;
                        }
                    }
                    match outcome {
                        Ok(()) => trace!(%target, "poll cycle complete"),
                        Err(err) if err.is_auth() => {
                            error!(%target, ?err, "session rejected; stopping all polling");
                            stop_all_targets(&targets);
                        }
                        Err(err) => warn!(%target, ?err, "poll cycle failed; waiting for next tick"),
                    }
                });
            }
        }
    }
    debug!(%target, "poll loop exited");
}

fn stop_all_targets(targets: &Targets) {
    let drained: Vec<(PollTarget, TargetHandle)> = lock(targets).drain().collect();
    for (target, handle) in drained {
        shut(&target, &handle);
    }
}

fn shut(target: &PollTarget, handle: &TargetHandle) {
    handle.token.cancel();
    *lock(&handle.state) = PollState::Idle;
    debug!(%target, "poll target stopped");
}
