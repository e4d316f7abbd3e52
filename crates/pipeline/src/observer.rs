//! Progress streams for observers, framed as Server-Sent Events.
//!
//! An observer of a live request gets `connected`, then `progress`
//! events, then exactly one of `complete` / `error`, with keep-alive
//! comments while idle. An observer of an already finished request gets a
//! single terminal event built from the stored record.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use manga_core::error::CoreError;
use manga_core::stream_events::{
    EVENT_COMPLETE, EVENT_CONNECTED, EVENT_ERROR, EVENT_PROGRESS, KEEPALIVE_INTERVAL_SECS,
    MAX_SUBSCRIPTION_SECS,
};
use manga_core::types::RequestId;
use manga_db::models::request::Request;
use manga_db::models::status::RequestStatus;
use manga_events::{ProgressRelay, ProgressUpdate, SubscribeError, Subscription};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::store::JobStore;

/// Keep-alive comment frame.
pub const KEEPALIVE_FRAME: &str = ": keepalive\n\n";

const CONNECTED_MESSAGE: &str = "Connected to progress stream";

#[derive(Debug, thiserror::Error)]
pub enum ObserveError {
    #[error("Request {0} not found")]
    NotFound(RequestId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),

    #[error(transparent)]
    Invalid(#[from] CoreError),
}

/// Body of every non-keep-alive event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventData {
    pub status: RequestStatus,
    pub progress: u8,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Connected(EventData),
    Progress(EventData),
    Complete(EventData),
    Error(EventData),
    KeepAlive,
}

impl StreamEvent {
    fn from_update(update: ProgressUpdate) -> Self {
        let data = EventData {
            status: update.status,
            progress: update.progress,
            message: update.message,
        };
        match data.status {
            RequestStatus::Completed => Self::Complete(data),
            RequestStatus::Failed => Self::Error(data),
            _ => Self::Progress(data),
        }
    }

    /// Final event for a request that was already finished when observed.
    fn from_record(request: &Request, status: RequestStatus) -> Self {
        let progress = u8::try_from(request.progress.clamp(0, 100)).unwrap_or(0);
        match status {
            RequestStatus::Failed => Self::Error(EventData {
                status,
                progress,
                message: match &request.error_message {
                    Some(error) => format!("Translation failed: {error}"),
                    None => "Translation failed".to_string(),
                },
            }),
            _ => Self::Complete(EventData {
                status,
                progress,
                message: format!("Translation {status}"),
            }),
        }
    }

    /// SSE event name; `None` for the keep-alive comment.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Self::Connected(_) => Some(EVENT_CONNECTED),
            Self::Progress(_) => Some(EVENT_PROGRESS),
            Self::Complete(_) => Some(EVENT_COMPLETE),
            Self::Error(_) => Some(EVENT_ERROR),
            Self::KeepAlive => None,
        }
    }

    pub fn data(&self) -> Option<&EventData> {
        match self {
            Self::Connected(data)
            | Self::Progress(data)
            | Self::Complete(data)
            | Self::Error(data) => Some(data),
            Self::KeepAlive => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error(_))
    }

    /// `event: <name>\ndata: <json>\n\n`, or the keep-alive comment.
    pub fn to_sse(&self) -> String {
        match (self.name(), self.data()) {
            (Some(name), Some(data)) => {
                let json = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
                format!("event: {name}\ndata: {json}\n\n")
            }
            _ => KEEPALIVE_FRAME.to_string(),
        }
    }
}

/// Opens [`ObserverStream`]s over the relay and the store.
#[derive(Clone)]
pub struct ProgressObserver {
    store: Arc<dyn JobStore>,
    relay: ProgressRelay,
    keepalive: Duration,
    max_lifetime: Duration,
}

impl ProgressObserver {
    pub fn new(store: Arc<dyn JobStore>, relay: ProgressRelay) -> Self {
        Self {
            store,
            relay,
            keepalive: Duration::from_secs(KEEPALIVE_INTERVAL_SECS),
            max_lifetime: Duration::from_secs(MAX_SUBSCRIPTION_SECS),
        }
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = max_lifetime;
        self
    }

    /// Start observing a request.
    pub async fn observe(&self, request_id: RequestId) -> Result<ObserverStream, ObserveError> {
        // Subscribe before reading the record: a terminal update that lands
        // in between is then visible in at least one of the two.
        let subscription = self
            .relay
            .subscribe(request_id, Instant::now() + self.max_lifetime)?;
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or(ObserveError::NotFound(request_id))?;
        let status = request.status()?;

        let mut pending = VecDeque::with_capacity(1);
        let subscription = if status.is_terminal() {
            tracing::debug!(request_id = %request_id, status = %status, "Observed finished request");
            pending.push_back(StreamEvent::from_record(&request, status));
            None
        } else {
            tracing::debug!(request_id = %request_id, "Observer connected");
            pending.push_back(StreamEvent::Connected(EventData {
                status,
                progress: u8::try_from(request.progress.clamp(0, 100)).unwrap_or(0),
                message: CONNECTED_MESSAGE.to_string(),
            }));
            Some(subscription)
        };

        Ok(ObserverStream {
            request_id,
            pending,
            subscription,
            keepalive: self.keepalive,
            finished: false,
        })
    }
}

/// Events for one observer, ending after the terminal event or at the
/// subscription deadline.
pub struct ObserverStream {
    request_id: RequestId,
    pending: VecDeque<StreamEvent>,
    subscription: Option<Subscription>,
    keepalive: Duration,
    finished: bool,
}

impl std::fmt::Debug for ObserverStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverStream")
            .field("request_id", &self.request_id)
            .field("pending", &self.pending)
            .field("keepalive", &self.keepalive)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl ObserverStream {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        if let Some(event) = self.pending.pop_front() {
            return Some(self.emit(event));
        }

        let subscription = self.subscription.as_mut()?;
        match tokio::time::timeout(self.keepalive, subscription.next()).await {
            Err(_) => Some(StreamEvent::KeepAlive),
            Ok(Some(update)) => Some(self.emit(StreamEvent::from_update(update))),
            Ok(None) => {
                tracing::debug!(request_id = %self.request_id, "Observer stream ended");
                self.finish();
                None
            }
        }
    }

    /// Adapt into a [`Stream`] for transports that want one.
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            let event = stream.next().await?;
            Some((event, stream))
        })
    }

    fn emit(&mut self, event: StreamEvent) -> StreamEvent {
        if event.is_terminal() {
            self.finish();
        }
        event
    }

    fn finish(&mut self) {
        self.finished = true;
        self.subscription = None;
    }
}
