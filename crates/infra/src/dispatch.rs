//! Fan-out of one envelope to its consumers, shared by both delivery paths.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use herald_core::EventId;
use herald_events::{Consumer, ConsumerRegistry, Event, EventEnvelope};

use crate::metrics::DispatchMetrics;

/// One consumer that did not handle an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerFailure {
    pub consumer: String,
    pub reason: String,
}

/// At least one consumer failed; the whole entry counts as failed.
#[derive(Debug, Clone, Error)]
#[error("delivery of {event_id} failed for {} consumer(s): {}", .failures.len(), summarize(.failures))]
pub struct DeliveryFailure {
    pub event_id: EventId,
    pub failures: Vec<ConsumerFailure>,
}

fn summarize(failures: &[ConsumerFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.consumer, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Default cap on live consumer threads.
pub const DEFAULT_CONSUMER_THREADS: usize = 64;

/// Delivers envelopes to every matching consumer.
///
/// Each consumer call runs on its own thread and is abandoned after
/// `event_timeout`; an abandoned call counts as a failure. Consumers are
/// idempotent, so a late completion of an abandoned call is harmless.
///
/// An abandoned thread cannot be stopped and lives until its call returns.
/// Live threads are capped (see [`with_thread_limit`](Self::with_thread_limit));
/// at the cap, further calls fail at once instead of spawning.
pub struct Fanout<E> {
    consumers: Arc<ConsumerRegistry<E>>,
    metrics: Arc<DispatchMetrics>,
    event_timeout: Duration,
    thread_limit: usize,
    in_flight: Arc<AtomicUsize>,
}

impl<E> Clone for Fanout<E> {
    fn clone(&self) -> Self {
        Self {
            consumers: Arc::clone(&self.consumers),
            metrics: Arc::clone(&self.metrics),
            event_timeout: self.event_timeout,
            thread_limit: self.thread_limit,
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

/// Holds one slot of the thread cap until the consumer thread ends.
struct ThreadSlot(Arc<AtomicUsize>);

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<E: Event> Fanout<E> {
    pub fn new(
        consumers: Arc<ConsumerRegistry<E>>,
        metrics: Arc<DispatchMetrics>,
        event_timeout: Duration,
    ) -> Self {
        Self {
            consumers,
            metrics,
            event_timeout,
            thread_limit: DEFAULT_CONSUMER_THREADS,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cap on consumer threads alive at once, shared by all clones.
    pub fn with_thread_limit(mut self, limit: usize) -> Self {
        self.thread_limit = limit.max(1);
        self
    }

    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    /// Consumer threads still running, abandoned ones included.
    pub fn live_threads(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Hand `envelope` to every consumer subscribed to its type.
    ///
    /// All matching consumers are invoked even if an earlier one fails.
    pub fn deliver(&self, envelope: &EventEnvelope<E>) -> Result<(), DeliveryFailure> {
        let consumers = self.consumers.consumers_for(envelope.event_type());
        let mut failures = Vec::new();

        for consumer in consumers {
            let name = consumer.name().to_string();
            match self.invoke(consumer, envelope) {
                Ok(()) => {
                    debug!(event_id = %envelope.event_id(), consumer = %name, "consumer handled event");
                }
                Err(reason) => {
                    warn!(
                        event_id = %envelope.event_id(),
                        event_type = %envelope.event_type(),
                        consumer = %name,
                        reason = %reason,
                        "consumer failed"
                    );
                    failures.push(ConsumerFailure {
                        consumer: name,
                        reason,
                    });
                }
            }
        }

        if failures.is_empty() {
            let latency = (Utc::now() - envelope.occurred_at())
                .to_std()
                .unwrap_or_default();
            self.metrics
                .record_delivered(envelope.event_type(), latency);
            Ok(())
        } else {
            self.metrics.record_failed(envelope.event_type());
            Err(DeliveryFailure {
                event_id: envelope.event_id(),
                failures,
            })
        }
    }

    fn invoke(&self, consumer: Arc<dyn Consumer<E>>, envelope: &EventEnvelope<E>) -> Result<(), String> {
        let limit = self.thread_limit;
        if self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .is_err()
        {
            return Err(format!("consumer thread limit ({limit}) reached"));
        }
        let slot = ThreadSlot(Arc::clone(&self.in_flight));

        let (tx, rx) = mpsc::channel();
        let envelope = envelope.clone();
        let thread_name = format!("consumer-{}", consumer.name());

        thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let _slot = slot;
                let _ = tx.send(consumer.handle(&envelope));
            })
            .map_err(|e| format!("failed to spawn consumer thread: {e}"))?;

        match rx.recv_timeout(self.event_timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Err(format!("timed out after {}ms", self.event_timeout.as_millis()))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err("consumer panicked".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CounterEvent;
    use herald_core::AggregateId;
    use herald_events::ConsumerError;

    fn envelope() -> EventEnvelope<CounterEvent> {
        EventEnvelope::new(
            EventId::new(),
            AggregateId::new(),
            "counter",
            CounterEvent::BUMPED,
            Utc::now(),
            CounterEvent::Bumped { by: 1 },
        )
    }

    fn fanout(registry: ConsumerRegistry<CounterEvent>, timeout: Duration) -> Fanout<CounterEvent> {
        Fanout::new(Arc::new(registry), Arc::new(DispatchMetrics::new()), timeout)
    }

    #[test]
    fn every_matching_consumer_runs_even_after_a_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ConsumerRegistry::new();
        registry.subscribe("counter.*", |_| Err(ConsumerError::new("down")));
        let seen = calls.clone();
        registry.subscribe("*", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let fanout = fanout(registry, Duration::from_secs(1));
        let err = fanout.deliver(&envelope()).unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].consumer, "counter.*");
        assert_eq!(fanout.metrics().snapshot().for_type(CounterEvent::BUMPED).failed, 1);
    }

    #[test]
    fn slow_consumer_times_out() {
        let mut registry = ConsumerRegistry::new();
        registry.subscribe(CounterEvent::BUMPED, |_| {
            thread::sleep(Duration::from_millis(300));
            Ok(())
        });

        let err = fanout(registry, Duration::from_millis(20))
            .deliver(&envelope())
            .unwrap_err();
        assert!(err.failures[0].reason.contains("timed out"));
    }

    #[test]
    fn panicking_consumer_is_a_failure() {
        let mut registry = ConsumerRegistry::new();
        registry.subscribe(CounterEvent::BUMPED, |_| panic!("consumer bug"));

        let err = fanout(registry, Duration::from_secs(1))
            .deliver(&envelope())
            .unwrap_err();
        assert_eq!(err.failures[0].reason, "consumer panicked");
    }

    #[test]
    fn no_subscribers_counts_as_delivered() {
        let fanout = fanout(ConsumerRegistry::new(), Duration::from_secs(1));
        fanout.deliver(&envelope()).unwrap();
        assert_eq!(fanout.metrics().snapshot().delivered, 1);
    }

    #[test]
    fn hung_consumers_are_capped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut registry = ConsumerRegistry::new();
        registry.subscribe(CounterEvent::BUMPED, move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                thread::sleep(Duration::from_millis(300));
            }
            Ok(())
        });
        let fanout = fanout(registry, Duration::from_millis(20)).with_thread_limit(1);

        let err = fanout.deliver(&envelope()).unwrap_err();
        assert!(err.failures[0].reason.contains("timed out"));
        assert_eq!(fanout.live_threads(), 1);

        let err = fanout.deliver(&envelope()).unwrap_err();
        assert!(err.failures[0].reason.contains("thread limit"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        thread::sleep(Duration::from_millis(500));
        assert_eq!(fanout.live_threads(), 0);
        fanout.deliver(&envelope()).unwrap();
    }
}
