//! Ticket event consumers.
//!
//! All of these are idempotent per event id: delivering the same envelope twice
//! leaves the same observable state as delivering it once.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use herald_core::EventId;
use herald_events::{Consumer, ConsumerError, EventEnvelope};

use crate::ticket::{TicketEvent, TicketId};

/// Key of the cached read view for one ticket.
pub fn ticket_cache_key(ticket_id: TicketId) -> String {
    format!("ticket:{ticket_id}")
}

/// Key of the cached list of open tickets.
pub const OPEN_TICKETS_KEY: &str = "tickets:open";

/// Simple in-process key/value cache.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, JsonValue>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, value: JsonValue) -> Result<(), ConsumerError> {
        self.entries
            .write()
            .map_err(|_| ConsumerError::new("cache lock poisoned"))?
            .insert(key.into(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<JsonValue> {
        self.entries.read().ok()?.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove `key`. Unconditional, so repeating it is harmless.
    pub fn invalidate(&self, key: &str) -> Result<(), ConsumerError> {
        self.entries
            .write()
            .map_err(|_| ConsumerError::new("cache lock poisoned"))?
            .remove(key);
        Ok(())
    }
}

/// Drops cached ticket views whenever a ticket changes.
pub struct CacheInvalidator<C> {
    cache: C,
}

impl<C> CacheInvalidator<C>
where
    C: AsRef<InMemoryCache> + Send + Sync,
{
    pub fn new(cache: C) -> Self {
        Self { cache }
    }
}

impl<C> Consumer<TicketEvent> for CacheInvalidator<C>
where
    C: AsRef<InMemoryCache> + Send + Sync,
{
    fn name(&self) -> &str {
        "ticket-cache-invalidator"
    }

    fn handle(&self, envelope: &EventEnvelope<TicketEvent>) -> Result<(), ConsumerError> {
        let event = envelope.payload();
        let cache = self.cache.as_ref();
        cache.invalidate(&ticket_cache_key(event.ticket_id()))?;
        if matches!(event, TicketEvent::Created(_) | TicketEvent::Closed(_)) {
            cache.invalidate(OPEN_TICKETS_KEY)?;
        }
        debug!(event_id = %envelope.event_id(), ticket_id = %event.ticket_id(), "ticket cache invalidated");
        Ok(())
    }
}

/// One recorded ticket change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub event_id: EventId,
    pub ticket_id: TicketId,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct AuditLog {
    seen: HashSet<EventId>,
    records: Vec<AuditRecord>,
}

/// Append-only audit trail of ticket changes, keyed by event id.
#[derive(Debug, Default)]
pub struct AuditTrail {
    log: RwLock<AuditLog>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.log
            .read()
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    pub fn records_for(&self, ticket_id: TicketId) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.ticket_id == ticket_id)
            .collect()
    }
}

impl Consumer<TicketEvent> for AuditTrail {
    fn name(&self) -> &str {
        "ticket-audit-trail"
    }

    fn handle(&self, envelope: &EventEnvelope<TicketEvent>) -> Result<(), ConsumerError> {
        let mut log = self
            .log
            .write()
            .map_err(|_| ConsumerError::new("audit log lock poisoned"))?;
        if !log.seen.insert(envelope.event_id()) {
            return Ok(());
        }
        log.records.push(AuditRecord {
            event_id: envelope.event_id(),
            ticket_id: envelope.payload().ticket_id(),
            event_type: envelope.event_type().to_string(),
            occurred_at: envelope.occurred_at(),
        });
        Ok(())
    }
}

/// Tells the new assignee about a ticket. Only reacts to `ticket.assigned`.
///
/// Sending is a log line here; pair with
/// [`Deduplicating`](herald_events::Deduplicating) to avoid repeated notices.
#[derive(Debug, Default)]
pub struct AssignmentNotifier;

impl Consumer<TicketEvent> for AssignmentNotifier {
    fn name(&self) -> &str {
        "ticket-assignment-notifier"
    }

    fn handle(&self, envelope: &EventEnvelope<TicketEvent>) -> Result<(), ConsumerError> {
        if let TicketEvent::Assigned(e) = envelope.payload() {
            info!(
                event_id = %envelope.event_id(),
                ticket_id = %e.ticket_id,
                assignee = %e.assignee,
                "notifying assignee"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::{TicketClosed, TicketUpdated};
    use herald_core::AggregateId;
    use serde_json::json;
    use std::sync::Arc;

    fn envelope(event: TicketEvent) -> EventEnvelope<TicketEvent> {
        EventEnvelope::new(
            EventId::new(),
            event.ticket_id().0,
            "ticket",
            herald_events::Event::event_type(&event),
            Utc::now(),
            event,
        )
    }

    #[test]
    fn invalidator_drops_ticket_and_list_keys() {
        let cache = Arc::new(InMemoryCache::new());
        let ticket_id = TicketId::new(AggregateId::new());
        cache.put(ticket_cache_key(ticket_id), json!({"title": "old"})).unwrap();
        cache.put(OPEN_TICKETS_KEY, json!([])).unwrap();

        let invalidator = CacheInvalidator::new(cache.clone());
        let env = envelope(TicketEvent::Closed(TicketClosed {
            ticket_id,
            resolution: "done".into(),
        }));

        invalidator.handle(&env).unwrap();
        invalidator.handle(&env).unwrap();

        assert!(!cache.contains(&ticket_cache_key(ticket_id)));
        assert!(!cache.contains(OPEN_TICKETS_KEY));
    }

    #[test]
    fn update_keeps_open_list_cached() {
        let cache = Arc::new(InMemoryCache::new());
        let ticket_id = TicketId::new(AggregateId::new());
        cache.put(OPEN_TICKETS_KEY, json!([])).unwrap();

        CacheInvalidator::new(cache.clone())
            .handle(&envelope(TicketEvent::Updated(TicketUpdated {
                ticket_id,
                old_title: "a".into(),
                new_title: "b".into(),
            })))
            .unwrap();

        assert!(cache.contains(OPEN_TICKETS_KEY));
    }

    #[test]
    fn audit_trail_records_each_event_once() {
        let trail = AuditTrail::new();
        let ticket_id = TicketId::new(AggregateId::new());
        let env = envelope(TicketEvent::Closed(TicketClosed {
            ticket_id,
            resolution: "done".into(),
        }));

        trail.handle(&env).unwrap();
        trail.handle(&env).unwrap();

        let records = trail.records_for(ticket_id);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_id, env.event_id());
        assert_eq!(records[0].event_type, TicketEvent::CLOSED);
    }
}
