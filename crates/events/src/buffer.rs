//! Per-aggregate buffer of raised, not-yet-committed domain events.
//!
//! The buffer is transient: it is never persisted with the aggregate row. The
//! commit interceptor drains it while staging outbox entries, so after a
//! successful commit cycle it is always empty.

use chrono::{DateTime, Utc};

use herald_core::{AggregateRoot, EventId};

use crate::Event;

/// An event raised by an aggregate, stamped with its identity and time of occurrence.
#[derive(Debug, Clone)]
pub struct PendingEvent<E> {
    pub event_id: EventId,
    pub occurred_at: DateTime<Utc>,
    pub event: E,
}

impl<E> PartialEq for PendingEvent<E> {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
    }
}

impl<E> Eq for PendingEvent<E> {}

/// FIFO buffer of pending events.
///
/// Order matters: some consumers are order-sensitive (e.g. "assigned" must be seen
/// before "closed").
#[derive(Debug, Clone)]
pub struct EventBuffer<E> {
    pending: Vec<PendingEvent<E>>,
}

impl<E> Default for EventBuffer<E> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
        }
    }
}

impl<E> EventBuffer<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event occurring now.
    pub fn raise(&mut self, event: E) -> EventId {
        self.raise_at(event, Utc::now())
    }

    /// Append an event with an explicit occurrence time.
    ///
    /// Occurrence times never go backwards within one buffer: an earlier
    /// timestamp is clamped to the last raised one.
    pub fn raise_at(&mut self, event: E, occurred_at: DateTime<Utc>) -> EventId {
        let occurred_at = match self.pending.last() {
            Some(last) if last.occurred_at > occurred_at => last.occurred_at,
            _ => occurred_at,
        };
        let event_id = EventId::new();
        self.pending.push(PendingEvent {
            event_id,
            occurred_at,
            event,
        });
        event_id
    }

    /// Read-only snapshot, in raise order.
    pub fn pending(&self) -> &[PendingEvent<E>] {
        &self.pending
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Drain all pending events, in raise order.
    pub fn take(&mut self) -> Vec<PendingEvent<E>> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// An aggregate that records domain events for its own state changes.
///
/// Implementors only provide access to their buffer; the raise/inspect/clear
/// operations come for free.
pub trait EventSource: AggregateRoot {
    type Event: Event;

    fn event_buffer(&self) -> &EventBuffer<Self::Event>;

    fn event_buffer_mut(&mut self) -> &mut EventBuffer<Self::Event>;

    fn raise_event(&mut self, event: Self::Event) -> EventId {
        self.event_buffer_mut().raise(event)
    }

    fn pending_events(&self) -> &[PendingEvent<Self::Event>] {
        self.event_buffer().pending()
    }

    fn clear_events(&mut self) {
        self.event_buffer_mut().clear()
    }

    fn take_events(&mut self) -> Vec<PendingEvent<Self::Event>> {
        self.event_buffer_mut().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn take_drains_in_raise_order() {
        let mut buffer = EventBuffer::new();
        let a = buffer.raise("assigned");
        let b = buffer.raise("closed");

        assert_eq!(buffer.len(), 2);
        let drained = buffer.take();
        assert!(buffer.is_empty());
        assert_eq!(drained.iter().map(|p| p.event_id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(drained[0].event, "assigned");
        assert_eq!(drained[1].event, "closed");
    }

    #[test]
    fn clear_empties_buffer() {
        let mut buffer = EventBuffer::new();
        buffer.raise(1u8);
        buffer.clear();
        assert!(buffer.pending().is_empty());
    }

    #[test]
    fn occurrence_time_never_goes_backwards() {
        let mut buffer = EventBuffer::new();
        let now = Utc::now();
        buffer.raise_at('a', now);
        buffer.raise_at('b', now - Duration::seconds(10));

        let pending = buffer.pending();
        assert_eq!(pending[1].occurred_at, now);
    }

    #[test]
    fn pending_events_compare_by_id() {
        let mut buffer = EventBuffer::new();
        buffer.raise(1u8);
        buffer.raise(1u8);
        let pending = buffer.pending();
        assert_ne!(pending[0], pending[1]);
        assert_eq!(pending[0], pending[0].clone());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: the buffer is FIFO and drains to empty.
            #[test]
            fn buffer_preserves_order(values in proptest::collection::vec(any::<u32>(), 0..64)) {
                let mut buffer = EventBuffer::new();
                for v in &values {
                    buffer.raise(*v);
                }
                let drained: Vec<u32> = buffer.take().into_iter().map(|p| p.event).collect();
                prop_assert_eq!(drained, values);
                prop_assert!(buffer.is_empty());
            }
        }
    }
}
