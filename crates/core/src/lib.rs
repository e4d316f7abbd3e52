//! Pure domain types shared by every crate in the translation backend.
//!
//! Nothing in here touches the database, the filesystem or the network,
//! which keeps the parsing and path logic unit-testable in isolation.

pub mod error;
pub mod file_kind;
pub mod paths;
pub mod progress;
pub mod stream_events;
pub mod task;
pub mod types;
