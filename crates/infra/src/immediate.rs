//! Best-effort delivery right after a successful commit.

use std::io;
use std::thread;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use herald_events::Event;

use crate::dispatch::Fanout;
use crate::store::OutboxStore;
use crate::unit_of_work::CommitReceipt;

/// Outcome of one immediate dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    /// Not attempted: an earlier event of the same aggregate is still pending,
    /// or the entry is already settled. The sweeper keeps the order.
    pub deferred: usize,
}

/// Latency path: hands captured envelopes to consumers and marks fully
/// delivered entries `Delivered`.
///
/// Failures are logged and swallowed; they never reach the business caller and
/// never touch the retry counter. Whatever is left pending is picked up by the
/// [`OutboxSweeper`](crate::sweeper::OutboxSweeper).
///
/// An envelope is only delivered while its entry is the oldest pending one of
/// its aggregate, so a failure holds back the aggregate's later events.
pub struct ImmediateDispatcher<E, O> {
    fanout: Fanout<E>,
    outbox: O,
}

impl<E, O: Clone> Clone for ImmediateDispatcher<E, O> {
    fn clone(&self) -> Self {
        Self {
            fanout: self.fanout.clone(),
            outbox: self.outbox.clone(),
        }
    }
}

impl<E, O> ImmediateDispatcher<E, O>
where
    E: Event,
    O: OutboxStore,
{
    pub fn new(fanout: Fanout<E>, outbox: O) -> Self {
        Self { fanout, outbox }
    }

    /// Deliver on the caller's thread.
    pub fn dispatch(&self, receipt: &CommitReceipt<E>) -> DispatchReport {
        let mut report = DispatchReport::default();

        for envelope in receipt.envelopes() {
            match self
                .outbox
                .pending_head(envelope.aggregate_type(), envelope.aggregate_id())
            {
                Ok(Some(head)) if head == envelope.event_id() => {}
                Ok(_) => {
                    report.deferred += 1;
                    debug!(
                        event_id = %envelope.event_id(),
                        aggregate_id = %envelope.aggregate_id(),
                        "earlier event still pending; left for sweeper"
                    );
                    continue;
                }
                Err(err) => {
                    report.deferred += 1;
                    warn!(
                        event_id = %envelope.event_id(),
                        error = %err,
                        "could not check outbox order; left for sweeper"
                    );
                    continue;
                }
            }

            match self.fanout.deliver(envelope) {
                Ok(()) => {
                    report.delivered += 1;
                    if let Err(err) = self.outbox.mark_delivered(envelope.event_id(), Utc::now()) {
                        warn!(
                            event_id = %envelope.event_id(),
                            error = %err,
                            "delivered but could not mark outbox entry; sweeper will redeliver"
                        );
                    }
                }
                Err(failure) => {
                    report.failed += 1;
                    warn!(
                        event_id = %envelope.event_id(),
                        event_type = %envelope.event_type(),
                        error = %failure,
                        "immediate dispatch failed; left for sweeper"
                    );
                }
            }
        }

        if !receipt.is_empty() {
            info!(
                delivered = report.delivered,
                failed = report.failed,
                deferred = report.deferred,
                "immediate dispatch finished"
            );
        }
        report
    }

    /// Deliver on a detached worker thread; the caller does not wait.
    pub fn dispatch_detached(&self, receipt: CommitReceipt<E>) -> io::Result<thread::JoinHandle<DispatchReport>>
    where
        O: Clone + 'static,
    {
        let dispatcher = self.clone();
        thread::Builder::new()
            .name("immediate-dispatch".to_string())
            .spawn(move || dispatcher.dispatch(&receipt))
    }
}
