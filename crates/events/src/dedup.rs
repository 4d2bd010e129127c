//! Best-effort duplicate suppression in front of a consumer.
//!
//! The outbox may deliver an event twice (immediate path + sweeper). Consumers
//! stay responsible for their own idempotency; this wrapper only avoids repeating
//! expensive work for duplicates seen by the same process recently.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tracing::debug;

use herald_core::EventId;

use crate::{Consumer, ConsumerError, EventEnvelope};

#[derive(Debug, Default)]
struct SeenLedger {
    ids: HashSet<EventId>,
    order: VecDeque<EventId>,
}

/// Wraps a consumer and skips events whose id was recently handled successfully.
///
/// Remembers at most `capacity` ids (oldest evicted first). Failed deliveries are
/// not remembered, so a retry reaches the inner consumer again.
pub struct Deduplicating<C> {
    inner: C,
    capacity: usize,
    seen: Mutex<SeenLedger>,
}

impl<C> Deduplicating<C> {
    pub fn new(inner: C, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            seen: Mutex::new(SeenLedger::default()),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn has_seen(&self, id: EventId) -> Result<bool, ConsumerError> {
        let seen = self
            .seen
            .lock()
            .map_err(|_| ConsumerError::new("dedup ledger lock poisoned"))?;
        Ok(seen.ids.contains(&id))
    }

    fn remember(&self, id: EventId) -> Result<(), ConsumerError> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| ConsumerError::new("dedup ledger lock poisoned"))?;
        if !seen.ids.insert(id) {
            return Ok(());
        }
        seen.order.push_back(id);
        while seen.order.len() > self.capacity {
            if let Some(evicted) = seen.order.pop_front() {
                seen.ids.remove(&evicted);
            }
        }
        Ok(())
    }
}

impl<E, C> Consumer<E> for Deduplicating<C>
where
    C: Consumer<E>,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn handle(&self, envelope: &EventEnvelope<E>) -> Result<(), ConsumerError> {
        let id = envelope.event_id();
        if self.has_seen(id)? {
            debug!(consumer = self.inner.name(), event_id = %id, "skipping duplicate delivery");
            return Ok(());
        }
        self.inner.handle(envelope)?;
        self.remember(id)
    }
}
