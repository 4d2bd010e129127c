//! `herald-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod concurrency;
pub mod error;
pub mod id;

pub use aggregate::AggregateRoot;
pub use concurrency::{ConcurrencyConflict, ConcurrencyToken};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, EventId};
