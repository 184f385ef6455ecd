//! Persistence layer.
//!
//! - `traits`: the backend-agnostic `Database` trait
//! - `memory`: in-process backend used by the binary and the tests

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::Database;
