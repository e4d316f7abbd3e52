//! Event names used on the progress stream boundary.
//!
//! Observers receive `connected` once, any number of `progress` events,
//! and finally exactly one of `complete` / `error`.

/// Sent once when a live subscription is established.
pub const EVENT_CONNECTED: &str = "connected";

/// Intermediate progress while the request is processing.
pub const EVENT_PROGRESS: &str = "progress";

/// Terminal event for a completed request.
pub const EVENT_COMPLETE: &str = "complete";

/// Terminal event for a failed request.
pub const EVENT_ERROR: &str = "error";

/// Idle keep-alive interval on a live stream (seconds).
pub const KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Upper bound on a single subscription's lifetime (seconds).
pub const MAX_SUBSCRIPTION_SECS: u64 = 15 * 60;
