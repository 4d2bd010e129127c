//! Infrastructure for reliable domain-event dispatch.
//!
//! Aggregates are persisted through a [`UnitOfWork`](unit_of_work::UnitOfWork);
//! the [`CommitInterceptor`](interceptor::CommitInterceptor) stages their pending
//! events as outbox rows in the same storage commit. Delivery happens twice:
//! the [`ImmediateDispatcher`](immediate::ImmediateDispatcher) right after commit,
//! and the [`OutboxSweeper`](sweeper::OutboxSweeper) as the durable backstop.

pub mod config;
pub mod dispatch;
pub mod immediate;
pub mod interceptor;
pub mod metrics;
pub mod repository;
pub mod retry;
pub mod store;
pub mod sweeper;
pub mod unit_of_work;

#[cfg(test)]
mod testing;

pub use config::DispatchConfig;
pub use dispatch::{ConsumerFailure, DEFAULT_CONSUMER_THREADS, DeliveryFailure, Fanout};
pub use immediate::{DispatchReport, ImmediateDispatcher};
pub use interceptor::CommitInterceptor;
pub use metrics::{DispatchMetrics, LatencySummary, MetricsSnapshot, TypeMetrics};
pub use repository::{Repository, RepositoryError};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{
    AggregateRow, ClaimRequest, InMemoryStore, Lease, NewOutboxEntry, OutboxEntry, OutboxStats,
    OutboxStatus, OutboxStore, PgStore, RowWrite, Storage, StoreError, WriteSet,
};
pub use sweeper::{OutboxSweeper, SweepReport, SweeperHandle, SweeperStats};
pub use unit_of_work::{CommitError, CommitReceipt, Tracked, UnitOfWork};
