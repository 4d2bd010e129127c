//! Capture pending domain events into the outbox, inside the commit.

use serde_json::json;
use tracing::{debug, error};

use herald_events::{Event, EventEnvelope};

use crate::store::{NewOutboxEntry, OutboxStatus, WriteSet};
use crate::unit_of_work::{CommitReceipt, Tracked};

/// Runs right before the storage commit of a [`UnitOfWork`](crate::unit_of_work::UnitOfWork).
///
/// Every pending event of every tracked aggregate becomes an outbox entry in the
/// same write set, in raise order. Nothing here does I/O: if the storage commit
/// fails, neither state nor outbox rows are persisted and the aggregates keep
/// their buffers.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommitInterceptor;

impl CommitInterceptor {
    pub fn new() -> Self {
        Self
    }

    /// Stage outbox entries for `tracked` into `writes`.
    ///
    /// Returns the envelopes staged as `Pending` (for the immediate dispatcher)
    /// plus the ids of events that could not be serialized. Those are still
    /// inserted, as `Dead` entries carrying a diagnostic payload, so the failure
    /// stays visible in the outbox.
    pub fn before_commit<E: Event>(
        &self,
        tracked: &[&mut dyn Tracked<E>],
        writes: &mut WriteSet,
    ) -> CommitReceipt<E> {
        let mut receipt = CommitReceipt::default();

        for aggregate in tracked {
            let aggregate_type = aggregate.aggregate_type();
            let aggregate_id = aggregate.aggregate_id();

            for pending in aggregate.pending() {
                let event_type = pending.event.event_type();
                match pending.event.encode() {
                    Ok(payload) => {
                        writes.outbox.push(NewOutboxEntry {
                            event_id: pending.event_id,
                            aggregate_type: aggregate_type.to_string(),
                            aggregate_id,
                            event_type: event_type.to_string(),
                            payload,
                            occurred_at: pending.occurred_at,
                            status: OutboxStatus::Pending,
                            last_error: None,
                        });
                        receipt.envelopes.push(EventEnvelope::new(
                            pending.event_id,
                            aggregate_id,
                            aggregate_type,
                            event_type,
                            pending.occurred_at,
                            pending.event.clone(),
                        ));
                    }
                    Err(err) => {
                        error!(
                            event_id = %pending.event_id,
                            event_type,
                            aggregate_type,
                            aggregate_id = %aggregate_id,
                            error = %err,
                            "event serialization failed; staging dead outbox entry"
                        );
                        writes.outbox.push(NewOutboxEntry {
                            event_id: pending.event_id,
                            aggregate_type: aggregate_type.to_string(),
                            aggregate_id,
                            event_type: event_type.to_string(),
                            payload: json!({
                                "serialization_error": err.to_string(),
                                "debug": format!("{:?}", pending.event),
                            }),
                            occurred_at: pending.occurred_at,
                            status: OutboxStatus::Dead,
                            last_error: Some(format!("serialization failed: {err}")),
                        });
                        receipt.dead_lettered.push(pending.event_id);
                    }
                }
            }
        }

        debug!(
            staged = receipt.envelopes.len(),
            dead = receipt.dead_lettered.len(),
            "staged outbox entries"
        );
        receipt
    }
}
