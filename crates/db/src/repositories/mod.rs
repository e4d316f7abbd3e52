//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async CRUD methods
//! that accept `&PgPool` as the first argument.

pub mod request_repo;
pub mod result_repo;
pub mod task_repo;

pub use request_repo::RequestRepo;
pub use result_repo::ResultRepo;
pub use task_repo::TaskRepo;
