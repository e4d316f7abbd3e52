//! Domain model structs and DTOs.
//!
//! Each submodule contains a `FromRow` + `Serialize` entity struct
//! matching the database row, plus the DTOs used for inserts.

pub mod request;
pub mod result;
pub mod status;
pub mod task;
