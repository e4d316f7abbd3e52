//! Durable, priority-laned task queue.
//!
//! - [`TaskQueue`]: enqueue side, used at intake.
//! - [`Dispatcher`]: bounded pool of execution slots that claims tasks
//!   from a [`TaskStore`] and runs a [`TaskHandler`] on each.
//! - [`PgTaskStore`]: Postgres-backed store over `queue_tasks`.
//! - [`MemoryTaskStore`]: in-process store with the same semantics.

pub mod dispatcher;
pub mod handler;
pub mod lane;
pub mod memory;
pub mod queue;
pub mod retry;
pub mod store;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use handler::{TaskContext, TaskFailure, TaskHandler};
pub use lane::{Lane, LaneScheduler, LaneWeights};
pub use memory::MemoryTaskStore;
pub use queue::{EnqueueError, TaskHandle, TaskQueue};
pub use retry::RetryPolicy;
pub use store::{ClaimedTask, PgTaskStore, TaskStore, TaskStoreError};
