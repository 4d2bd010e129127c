//! Event consumers and their subscriptions.
//!
//! Delivery is **at-least-once**: the same event may reach a consumer through
//! the immediate path and again through the outbox sweeper. Consumers must be
//! idempotent; prefer naturally idempotent operations ("invalidate key X")
//! over counters.

use std::sync::Arc;

use thiserror::Error;

use crate::EventEnvelope;

/// A consumer failed to handle an event. The delivery will be retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ConsumerError(String);

impl ConsumerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Idempotent handler for events of one or more type tags.
pub trait Consumer<E>: Send + Sync {
    /// Name used in logs and error reports.
    fn name(&self) -> &str;

    /// Handle one event. Must be safe to call more than once for the same
    /// `event_id`.
    fn handle(&self, envelope: &EventEnvelope<E>) -> Result<(), ConsumerError>;
}

impl<E, C> Consumer<E> for Arc<C>
where
    C: Consumer<E> + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn handle(&self, envelope: &EventEnvelope<E>) -> Result<(), ConsumerError> {
        (**self).handle(envelope)
    }
}

/// Adapter turning a closure into a named consumer.
pub struct FnConsumer<F> {
    name: String,
    handler: F,
}

impl<F> FnConsumer<F> {
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

impl<E, F> Consumer<E> for FnConsumer<F>
where
    F: Fn(&EventEnvelope<E>) -> Result<(), ConsumerError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, envelope: &EventEnvelope<E>) -> Result<(), ConsumerError> {
        (self.handler)(envelope)
    }
}

struct Subscription<E> {
    pattern: String,
    consumer: Arc<dyn Consumer<E>>,
}

/// Consumer registrations, keyed by event type pattern.
///
/// Patterns:
/// - exact tag: `"ticket.closed"`
/// - family: `"ticket.*"` (any tag starting with `ticket.`)
/// - wildcard: `"*"`
///
/// Built once at process startup and then shared read-only between the
/// immediate dispatcher and the sweeper.
pub struct ConsumerRegistry<E> {
    subscriptions: Vec<Subscription<E>>,
}

impl<E> Default for ConsumerRegistry<E> {
    fn default() -> Self {
        Self {
            subscriptions: Vec::new(),
        }
    }
}

impl<E> core::fmt::Debug for ConsumerRegistry<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(
                self.subscriptions
                    .iter()
                    .map(|s| (s.pattern.as_str(), s.consumer.name())),
            )
            .finish()
    }
}

impl<E: 'static> ConsumerRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a closure to `pattern`. The pattern doubles as the consumer name.
    pub fn subscribe<F>(&mut self, pattern: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&EventEnvelope<E>) -> Result<(), ConsumerError> + Send + Sync + 'static,
    {
        let pattern = pattern.into();
        let consumer = Arc::new(FnConsumer::new(pattern.clone(), handler));
        self.subscriptions.push(Subscription { pattern, consumer });
        self
    }

    /// Subscribe a shared consumer to `pattern`.
    ///
    /// The same consumer may be subscribed to several patterns; it is invoked at
    /// most once per event even if more than one of its patterns match.
    pub fn subscribe_consumer(
        &mut self,
        pattern: impl Into<String>,
        consumer: Arc<dyn Consumer<E>>,
    ) -> &mut Self {
        self.subscriptions.push(Subscription {
            pattern: pattern.into(),
            consumer,
        });
        self
    }

    /// Consumers interested in `event_type`, in registration order.
    pub fn consumers_for(&self, event_type: &str) -> Vec<Arc<dyn Consumer<E>>> {
        let mut matched: Vec<Arc<dyn Consumer<E>>> = Vec::new();
        for sub in &self.subscriptions {
            if !pattern_matches(&sub.pattern, event_type) {
                continue;
            }
            let already = matched
                .iter()
                .any(|c| Arc::as_ptr(c) as *const () == Arc::as_ptr(&sub.consumer) as *const ());
            if !already {
                matched.push(Arc::clone(&sub.consumer));
            }
        }
        matched
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" || pattern == event_type {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use herald_core::{AggregateId, EventId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope(event_type: &str) -> EventEnvelope<()> {
        EventEnvelope::new(EventId::new(), AggregateId::new(), "ticket", event_type, Utc::now(), ())
    }

    #[test]
    fn pattern_matching() {
        assert!(pattern_matches("*", "ticket.closed"));
        assert!(pattern_matches("ticket.closed", "ticket.closed"));
        assert!(pattern_matches("ticket.*", "ticket.closed"));
        assert!(!pattern_matches("ticket.*", "tickets.closed"));
        assert!(!pattern_matches("ticket.*", "ticket"));
        assert!(!pattern_matches("ticket.created", "ticket.closed"));
    }

    #[test]
    fn fans_out_in_registration_order() {
        let mut registry = ConsumerRegistry::<()>::new();
        registry
            .subscribe("ticket.closed", |_| Ok(()))
            .subscribe("ticket.*", |_| Ok(()))
            .subscribe("invoice.*", |_| Ok(()))
            .subscribe("*", |_| Ok(()));

        let names: Vec<String> = registry
            .consumers_for("ticket.closed")
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["ticket.closed", "ticket.*", "*"]);
    }

    #[test]
    fn shared_consumer_invoked_once_per_event() {
        struct Counter(AtomicUsize);
        impl Consumer<()> for Counter {
            fn name(&self) -> &str {
                "counter"
            }
            fn handle(&self, _: &EventEnvelope<()>) -> Result<(), ConsumerError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let mut registry = ConsumerRegistry::<()>::new();
        registry
            .subscribe_consumer("ticket.closed", counter.clone())
            .subscribe_consumer("ticket.*", counter.clone());

        let consumers = registry.consumers_for("ticket.closed");
        assert_eq!(consumers.len(), 1);
        for c in consumers {
            c.handle(&envelope("ticket.closed")).unwrap();
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_match_yields_no_consumers() {
        let mut registry = ConsumerRegistry::<()>::new();
        registry.subscribe("ticket.created", |_| Err(ConsumerError::new("boom")));
        assert!(registry.consumers_for("ticket.closed").is_empty());
    }
}
