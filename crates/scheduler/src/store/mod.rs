//! Durable job storage boundary.
//!
//! The scheduler talks to storage only through [`JobStore`]: atomic batches
//! of [`StoreOp`]s plus the range queries that workers and operators need.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
pub use query::{DueFilter, JobQuery, Page};
pub use r#trait::{JobStore, JobStoreError, StoreOp};
