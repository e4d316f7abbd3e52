//! Translation job pipeline.
//!
//! Wires one queued task through the external worker and back into the
//! store:
//!
//! - [`supervisor`]: runs the worker process, streams parsed progress.
//! - [`catalog`]: turns worker output into ordered page results.
//! - [`lifecycle`]: request state transitions plus relay publishing.
//! - [`handler`]: the queue [`TaskHandler`](manga_queue::TaskHandler) tying them together.
//! - [`intake`]: creates a request and enqueues its task.
//! - [`observer`]: the progress stream seen by clients.

pub mod catalog;
pub mod error;
pub mod handler;
pub mod intake;
pub mod lifecycle;
pub mod memory;
pub mod observer;
pub mod store;
pub mod supervisor;

pub use catalog::OutputCataloger;
pub use error::{CatalogError, HandlerError, StoreError, SupervisorError};
pub use handler::TranslationHandler;
pub use intake::{Intake, IntakeError};
pub use lifecycle::{JobLifecycle, JobRun};
pub use memory::MemoryJobStore;
pub use observer::{EventData, ObserveError, ObserverStream, ProgressObserver, StreamEvent};
pub use store::{JobStore, PgJobStore};
pub use supervisor::{JobContext, PageOutput, SupervisorConfig, WorkerOutput, WorkerSupervisor};
