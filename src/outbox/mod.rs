//! Durable outbox for writes attempted while offline.
//!
//! The page enqueues a `PendingOperation` when the API is unreachable; a
//! background-sync trigger drains the queue by replaying each entry.

mod store;
mod sync;

pub use store::{OutboxStore, PendingOperation, SqliteOutbox};
pub use sync::{DrainReport, Endpoints, OutboxSync};
