//! Live progress fan-out for translation requests.
//!
//! - [`ProgressRelay`]: per-request publish/subscribe topics backed by
//!   `tokio::sync::broadcast`, created lazily and dropped when idle.
//! - [`ProgressUpdate`]: the ephemeral message carried on a topic.

pub mod relay;
pub mod update;

pub use relay::{ProgressRelay, Publisher, SubscribeError, Subscription};
pub use update::ProgressUpdate;
