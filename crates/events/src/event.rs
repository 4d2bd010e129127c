use serde_json::Value as JsonValue;

/// A domain event kind.
///
/// Implemented by a closed enum per domain (one variant per event type). Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - **tagged**: the type tag selects the decoder when reading the outbox back
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "ticket.created").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32 {
        1
    }

    /// Serialize the payload of this event (without the type tag).
    ///
    /// The inverse is the decoder registered for [`Event::event_type`] in an
    /// [`EventRegistry`](crate::EventRegistry).
    fn encode(&self) -> Result<JsonValue, serde_json::Error>;
}
