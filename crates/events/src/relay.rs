//! Per-request progress topics.
//!
//! Each request id maps to its own [`Topic`] wrapping a bounded
//! [`broadcast`] channel, so publishing for one request never contends
//! with another request's subscribers. The map lock is only taken to
//! look up, create or drop a topic.
//!
//! A topic is created on the first [`ProgressRelay::open`] or
//! [`ProgressRelay::subscribe`] and removed once it has neither an active
//! [`Publisher`] nor a live [`Subscription`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use manga_core::types::RequestId;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::update::ProgressUpdate;

/// Default per-subscriber buffer. A subscriber further behind than this
/// skips intermediate updates.
pub const DEFAULT_CAPACITY: usize = 64;

/// Errors returned by [`ProgressRelay::subscribe`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("Progress relay is shut down")]
    Closed,

    #[error("Subscription deadline already elapsed")]
    DeadlineElapsed,
}

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TopicState {
    publishers: usize,
    subscribers: usize,
    /// Set by the first terminal publish; later publishes are dropped.
    terminal: Option<ProgressUpdate>,
}

impl TopicState {
    fn is_idle(&self) -> bool {
        self.publishers == 0 && self.subscribers == 0
    }
}

struct Topic {
    sender: broadcast::Sender<ProgressUpdate>,
    state: Mutex<TopicState>,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            state: Mutex::new(TopicState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, TopicState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn terminal(&self) -> Option<ProgressUpdate> {
        self.state().terminal.clone()
    }

    fn send(&self, update: ProgressUpdate) {
        let mut state = self.state();
        if state.terminal.is_some() {
            tracing::debug!(
                request_id = %update.request_id,
                "Dropping progress update published after terminal event"
            );
            return;
        }
        if update.is_terminal() {
            state.terminal = Some(update.clone());
        }
        // Sending under the state lock keeps retained-terminal and channel
        // order consistent. A send error only means zero receivers.
        let _ = self.sender.send(update);
    }
}

#[derive(Clone, Copy)]
enum Role {
    Publisher,
    Subscriber,
}

// ---------------------------------------------------------------------------
// ProgressRelay
// ---------------------------------------------------------------------------

struct RelayInner {
    topics: RwLock<HashMap<RequestId, Arc<Topic>>>,
    capacity: usize,
    shutdown: CancellationToken,
}

impl RelayInner {
    fn acquire(&self, request_id: RequestId, role: Role) -> Arc<Topic> {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let topic = topics
            .entry(request_id)
            .or_insert_with(|| Arc::new(Topic::new(self.capacity)))
            .clone();
        let mut state = topic.state();
        match role {
            Role::Publisher => state.publishers += 1,
            Role::Subscriber => state.subscribers += 1,
        }
        drop(state);
        topic
    }

    fn release(&self, request_id: RequestId, topic: &Arc<Topic>, role: Role) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let idle = {
            let mut state = topic.state();
            match role {
                Role::Publisher => state.publishers = state.publishers.saturating_sub(1),
                Role::Subscriber => state.subscribers = state.subscribers.saturating_sub(1),
            }
            state.is_idle()
        };
        if idle && topics.get(&request_id).is_some_and(|t| Arc::ptr_eq(t, topic)) {
            topics.remove(&request_id);
            tracing::trace!(request_id = %request_id, "Progress topic collected");
        }
    }

    fn lookup(&self, request_id: &RequestId) -> Option<Arc<Topic>> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(request_id)
            .cloned()
    }
}

/// In-process fan-out of [`ProgressUpdate`]s keyed by request id.
///
/// Cheap to clone; all clones share the same topics.
///
/// ```rust
/// use manga_db::models::status::RequestStatus;
/// use manga_events::{ProgressRelay, ProgressUpdate};
///
/// let relay = ProgressRelay::default();
/// let id = manga_core::types::RequestId::nil();
/// let publisher = relay.open(id);
/// publisher.publish(ProgressUpdate::new(id, RequestStatus::Processing, 5, "AI pipeline ready"));
/// ```
#[derive(Clone)]
pub struct ProgressRelay {
    inner: Arc<RelayInner>,
}

impl ProgressRelay {
    /// Create a relay whose subscribers buffer up to `capacity` updates.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                topics: RwLock::new(HashMap::new()),
                capacity: capacity.max(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Publish to the request's topic, fire-and-forget.
    ///
    /// With no topic (nobody publishing or listening) the update is
    /// dropped: late subscribers read the stored request instead.
    pub fn publish(&self, update: ProgressUpdate) {
        match self.inner.lookup(&update.request_id) {
            Some(topic) => topic.send(update),
            None => tracing::trace!(
                request_id = %update.request_id,
                "No progress topic, update dropped"
            ),
        }
    }

    /// Register an active publisher for a request.
    ///
    /// Keeps the topic alive while the job runs, so a subscriber that
    /// connects between two updates still sees the retained terminal one.
    pub fn open(&self, request_id: RequestId) -> Publisher {
        let topic = self.inner.acquire(request_id, Role::Publisher);
        Publisher {
            relay: Arc::clone(&self.inner),
            request_id,
            topic,
        }
    }

    /// Subscribe to a request's updates until `deadline`.
    pub fn subscribe(
        &self,
        request_id: RequestId,
        deadline: Instant,
    ) -> Result<Subscription, SubscribeError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SubscribeError::Closed);
        }
        if deadline <= Instant::now() {
            return Err(SubscribeError::DeadlineElapsed);
        }

        let topic = self.inner.acquire(request_id, Role::Subscriber);
        let receiver = topic.sender.subscribe();
        // Read after subscribing so a concurrent terminal publish is seen
        // either here or on the receiver.
        let pending_terminal = topic.terminal();

        Ok(Subscription {
            relay: Arc::clone(&self.inner),
            request_id,
            topic,
            receiver,
            deadline,
            pending_terminal,
            finished: false,
        })
    }

    /// End every live subscription and refuse new ones.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    /// Number of live topics.
    pub fn topic_count(&self) -> usize {
        self.inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of live subscriptions on a request's topic.
    pub fn subscriber_count(&self, request_id: RequestId) -> usize {
        self.inner
            .lookup(&request_id)
            .map_or(0, |topic| topic.state().subscribers)
    }
}

impl Default for ProgressRelay {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// An active publisher on one request's topic. Dropping it releases the topic.
pub struct Publisher {
    relay: Arc<RelayInner>,
    request_id: RequestId,
    topic: Arc<Topic>,
}

impl Publisher {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Send an update to every current subscriber.
    pub fn publish(&self, update: ProgressUpdate) {
        self.topic.send(update);
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.relay
            .release(self.request_id, &self.topic, Role::Publisher);
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A live stream of one request's updates.
///
/// Ends after a terminal update, when the deadline passes, or when the
/// relay is closed. Dropping it is how a subscriber disconnects.
pub struct Subscription {
    relay: Arc<RelayInner>,
    request_id: RequestId,
    topic: Arc<Topic>,
    receiver: broadcast::Receiver<ProgressUpdate>,
    deadline: Instant,
    pending_terminal: Option<ProgressUpdate>,
    finished: bool,
}

impl Subscription {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// `true` once [`next`](Self::next) has returned the last item.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Wait for the next update. `None` means the subscription ended.
    ///
    /// Cancel-safe: dropping the future loses no update.
    pub async fn next(&mut self) -> Option<ProgressUpdate> {
        if self.finished {
            return None;
        }
        if let Some(update) = self.pending_terminal.take() {
            self.finished = true;
            return Some(update);
        }

        loop {
            tokio::select! {
                biased;

                _ = self.relay.shutdown.cancelled() => {
                    self.finished = true;
                    return None;
                }
                _ = tokio::time::sleep_until(self.deadline) => {
                    tracing::debug!(request_id = %self.request_id, "Progress subscription deadline reached");
                    self.finished = true;
                    return None;
                }
                received = self.receiver.recv() => match received {
                    Ok(update) => {
                        if update.is_terminal() {
                            self.finished = true;
                        }
                        return Some(update);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            request_id = %self.request_id,
                            skipped,
                            "Progress subscriber lagged, intermediate updates skipped"
                        );
                        if let Some(update) = self.topic.terminal() {
                            self.finished = true;
                            return Some(update);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.finished = true;
                        return None;
                    }
                },
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.relay
            .release(self.request_id, &self.topic, Role::Subscriber);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
