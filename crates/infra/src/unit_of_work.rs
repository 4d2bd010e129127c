//! Unit of work: one atomic commit over several aggregates.

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use herald_core::{AggregateId, ConcurrencyConflict, ConcurrencyToken, EventId};
use herald_events::{Event, EventEnvelope, EventSource, PendingEvent};

use crate::interceptor::CommitInterceptor;
use crate::store::{RowWrite, Storage, StoreError, WriteSet};

/// What a unit of work needs from an aggregate, object-safe.
///
/// Implemented for every serializable [`EventSource`] whose id converts into an
/// [`AggregateId`].
pub trait Tracked<E: Event> {
    fn aggregate_type(&self) -> &'static str;
    fn aggregate_id(&self) -> AggregateId;
    fn token(&self) -> ConcurrencyToken;
    fn set_token(&mut self, token: ConcurrencyToken);
    fn state(&self) -> Result<JsonValue, serde_json::Error>;
    fn pending(&self) -> &[PendingEvent<E>];
    fn clear_pending(&mut self);
}

impl<A> Tracked<A::Event> for A
where
    A: EventSource + Serialize,
    A::Id: Into<AggregateId>,
{
    fn aggregate_type(&self) -> &'static str {
        A::entity_name()
    }

    fn aggregate_id(&self) -> AggregateId {
        self.id().clone().into()
    }

    fn token(&self) -> ConcurrencyToken {
        herald_core::AggregateRoot::token(self)
    }

    fn set_token(&mut self, token: ConcurrencyToken) {
        herald_core::AggregateRoot::set_token(self, token)
    }

    fn state(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn pending(&self) -> &[PendingEvent<A::Event>] {
        self.pending_events()
    }

    fn clear_pending(&mut self) {
        self.clear_events()
    }
}

/// Commit failure. Nothing was persisted.
#[derive(Debug, Clone, Error)]
pub enum CommitError {
    #[error(transparent)]
    Conflict(ConcurrencyConflict),
    #[error("commit failed: {0}")]
    Store(StoreError),
}

impl From<StoreError> for CommitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(conflict) => CommitError::Conflict(conflict),
            other => CommitError::Store(other),
        }
    }
}

/// Result of a successful commit: the events it captured.
#[derive(Debug, Clone)]
pub struct CommitReceipt<E> {
    pub(crate) envelopes: Vec<EventEnvelope<E>>,
    pub(crate) dead_lettered: Vec<EventId>,
}

impl<E> Default for CommitReceipt<E> {
    fn default() -> Self {
        Self {
            envelopes: Vec::new(),
            dead_lettered: Vec::new(),
        }
    }
}

impl<E> CommitReceipt<E> {
    /// Envelopes persisted as pending, in raise order.
    pub fn envelopes(&self) -> &[EventEnvelope<E>] {
        &self.envelopes
    }

    pub fn into_envelopes(self) -> Vec<EventEnvelope<E>> {
        self.envelopes
    }

    /// Events persisted straight to `Dead` because they could not be serialized.
    pub fn dead_lettered(&self) -> &[EventId] {
        &self.dead_lettered
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}

/// Tracks mutably borrowed aggregates and commits them together.
///
/// On success every tracked aggregate carries its new token and an empty event
/// buffer. On failure the aggregates are left untouched (old token, events
/// still pending).
pub struct UnitOfWork<'a, E: Event> {
    tracked: Vec<&'a mut dyn Tracked<E>>,
    interceptor: CommitInterceptor,
}

impl<E: Event> Default for UnitOfWork<'_, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, E: Event> UnitOfWork<'a, E> {
    pub fn new() -> Self {
        Self::with_interceptor(CommitInterceptor::new())
    }

    pub fn with_interceptor(interceptor: CommitInterceptor) -> Self {
        Self {
            tracked: Vec::new(),
            interceptor,
        }
    }

    pub fn track<A>(&mut self, aggregate: &'a mut A) -> &mut Self
    where
        A: Tracked<E> + 'a,
    {
        self.tracked.push(aggregate);
        self
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Write every tracked row (conditional on its token) plus the outbox
    /// entries staged by the interceptor, atomically.
    pub fn commit<S>(mut self, storage: &S) -> Result<CommitReceipt<E>, CommitError>
    where
        S: Storage + ?Sized,
    {
        let mut writes = WriteSet::new();
        for aggregate in &self.tracked {
            let state = aggregate.state().map_err(|e| {
                StoreError::Serialization(format!(
                    "{} {}: {e}",
                    aggregate.aggregate_type(),
                    aggregate.aggregate_id()
                ))
            })?;
            writes.rows.push(RowWrite {
                aggregate_type: aggregate.aggregate_type().to_string(),
                aggregate_id: aggregate.aggregate_id(),
                expected: aggregate.token(),
                state,
            });
        }

        let receipt = self.interceptor.before_commit(&self.tracked, &mut writes);

        if let Err(err) = storage.commit(writes) {
            warn!(error = %err, aggregates = self.tracked.len(), "commit rejected");
            return Err(err.into());
        }

        for aggregate in self.tracked.iter_mut() {
            let next = aggregate.token().next();
            aggregate.set_token(next);
            aggregate.clear_pending();
        }

        debug!(
            aggregates = self.tracked.len(),
            events = receipt.len(),
            "unit of work committed"
        );
        Ok(receipt)
    }
}
