//! `herald-events`: domain event model and consumer registration.
//!
//! - [`Event`]: closed, tagged event kinds per domain
//! - [`EventBuffer`] / [`EventSource`]: per-aggregate buffer of raised events
//! - [`EventEnvelope`]: what consumers receive
//! - [`EventRegistry`]: tag → decoder, for reading serialized events back
//! - [`ConsumerRegistry`]: `subscribe(tag, handler)` fan-out table
//!
//! No IO happens in this crate.

pub mod buffer;
pub mod consumer;
pub mod dedup;
pub mod envelope;
pub mod event;
pub mod registry;

pub use buffer::{EventBuffer, EventSource, PendingEvent};
pub use consumer::{Consumer, ConsumerError, ConsumerRegistry, FnConsumer};
pub use dedup::Deduplicating;
pub use envelope::EventEnvelope;
pub use event::Event;
pub use registry::{DecodeError, DecodeFn, EventRegistry};
