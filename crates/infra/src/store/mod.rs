//! Storage boundary: aggregate rows and the transactional outbox.
//!
//! Both live behind the same backend so one commit can write state changes and
//! their outbox entries atomically.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryStore;
pub use postgres::PgStore;
pub use r#trait::{
    AggregateRow, ClaimRequest, Lease, NewOutboxEntry, OutboxEntry, OutboxStats, OutboxStatus,
    OutboxStore, RowWrite, Storage, StoreError, WriteSet,
};
