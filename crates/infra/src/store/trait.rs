use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use herald_core::{AggregateId, ConcurrencyConflict, ConcurrencyToken, EventId};

/// A persisted aggregate row: serialized state plus the token it was written with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub token: ConcurrencyToken,
    pub state: JsonValue,
}

/// Conditional write of one aggregate row.
///
/// `expected` is the token read at load time. The storage layer writes the row
/// only if the stored token still equals `expected` (or, for
/// [`ConcurrencyToken::UNSAVED`], only if no row exists), and stamps it with
/// `expected.next()`.
#[derive(Debug, Clone, PartialEq)]
pub struct RowWrite {
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub expected: ConcurrencyToken,
    pub state: JsonValue,
}

impl RowWrite {
    /// Token the row carries once the write is committed.
    pub fn next_token(&self) -> ConcurrencyToken {
        self.expected.next()
    }

    pub(crate) fn conflict(&self, actual: Option<ConcurrencyToken>) -> ConcurrencyConflict {
        ConcurrencyConflict::new(
            self.aggregate_type.clone(),
            self.aggregate_id,
            self.expected,
            actual,
        )
    }
}

/// Outbox entry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting for delivery (possibly after failed attempts)
    Pending,
    /// Every consumer handled it
    Delivered,
    /// Retry ceiling reached or payload unusable; kept for inspection
    Dead,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "delivered" => Some(OutboxStatus::Delivered),
            "dead" => Some(OutboxStatus::Dead),
            _ => None,
        }
    }
}

/// An outbox row as staged by the commit interceptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxEntry {
    pub event_id: EventId,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub event_type: String,
    pub payload: JsonValue,
    pub occurred_at: DateTime<Utc>,
    /// `Pending` normally; `Dead` when the event could not be serialized.
    pub status: OutboxStatus,
    pub last_error: Option<String>,
}

/// Claim held by one sweeper instance on an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub event_id: EventId,
    /// Insertion order across all commits.
    pub sequence: i64,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub event_type: String,
    pub payload: JsonValue,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub status: OutboxStatus,
    pub lease: Option<Lease>,
}

impl OutboxEntry {
    pub(crate) fn from_new(entry: NewOutboxEntry, sequence: i64, created_at: DateTime<Utc>) -> Self {
        Self {
            event_id: entry.event_id,
            sequence,
            aggregate_type: entry.aggregate_type,
            aggregate_id: entry.aggregate_id,
            event_type: entry.event_type,
            payload: entry.payload,
            occurred_at: entry.occurred_at,
            created_at,
            processed_at: None,
            last_error: entry.last_error,
            retry_count: 0,
            status: entry.status,
            lease: None,
        }
    }

    /// Whether a sweep with `request` may pick this entry up.
    pub fn is_claimable(&self, request: &ClaimRequest) -> bool {
        self.status == OutboxStatus::Pending
            && self.retry_count < request.max_retries
            && self.created_at <= request.created_before
            && self.lease.as_ref().is_none_or(|l| !l.is_active(request.now))
    }
}

/// Everything one storage commit writes, atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSet {
    pub rows: Vec<RowWrite>,
    pub outbox: Vec<NewOutboxEntry>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.outbox.is_empty()
    }
}

/// Parameters of one sweeper claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub owner: String,
    pub batch_size: usize,
    /// Entries with `retry_count >= max_retries` are never claimed.
    pub max_retries: u32,
    pub lease: Duration,
    /// Only entries created at or before this instant (grace period).
    pub created_before: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

impl ClaimRequest {
    pub fn lease_expires_at(&self) -> DateTime<Utc> {
        self.now + chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// Outbox depth counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub delivered: usize,
    pub dead: usize,
    /// Pending entries that already failed at least once.
    pub retrying: usize,
}

/// Storage operation error.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
    #[error("outbox entry not found: {0}")]
    NotFound(EventId),
    #[error("outbox entry already exists: {0}")]
    Duplicate(EventId),
    /// The entry's lease now belongs to another sweeper (or none); the
    /// update was not applied.
    #[error("lease on {event_id} no longer held by {owner}")]
    LeaseLost { event_id: EventId, owner: String },
    #[error("invalid state transition for {event_id}: {reason}")]
    InvalidTransition { event_id: EventId, reason: String },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Aggregate row storage with atomic, conditional commits.
pub trait Storage: Send + Sync {
    /// Load the current row for an aggregate, if it was ever persisted.
    fn load(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<AggregateRow>, StoreError>;

    /// Apply every row write and insert every outbox entry, or nothing.
    ///
    /// A stale token on any row rejects the whole set with
    /// [`StoreError::Conflict`].
    fn commit(&self, writes: WriteSet) -> Result<(), StoreError>;
}

/// The outbox as seen by the dispatch paths.
pub trait OutboxStore: Send + Sync {
    /// Lease up to `batch_size` claimable entries, oldest (lowest sequence) first.
    ///
    /// An entry is only taken when every earlier pending entry of the same
    /// aggregate is taken in the same claim.
    fn claim(&self, request: &ClaimRequest) -> Result<Vec<OutboxEntry>, StoreError>;

    /// `Pending → Delivered`. Already delivered or dead entries are left alone.
    fn mark_delivered(&self, event_id: EventId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Count a failed attempt made under `owner`'s lease. Returns the
    /// resulting status: `Dead` once the retry counter reaches `max_retries`,
    /// otherwise `Pending`. Entries no longer pending report their status
    /// unchanged; a pending entry leased to someone else is
    /// [`StoreError::LeaseLost`].
    fn record_failure(
        &self,
        event_id: EventId,
        owner: &str,
        error: &str,
        max_retries: u32,
    ) -> Result<OutboxStatus, StoreError>;

    /// Drop leases held by `owner` on the given entries.
    fn release(&self, event_ids: &[EventId], owner: &str) -> Result<(), StoreError>;

    /// Oldest pending entry of one aggregate, if any.
    fn pending_head(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<EventId>, StoreError>;

    fn get(&self, event_id: EventId) -> Result<Option<OutboxEntry>, StoreError>;

    fn stats(&self) -> Result<OutboxStats, StoreError>;

    /// Dead entries, oldest first.
    fn list_dead(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    /// `Dead → Pending` with the retry counter reset.
    fn requeue_dead(&self, event_id: EventId) -> Result<OutboxEntry, StoreError>;
}

impl<T> Storage for Arc<T>
where
    T: Storage + ?Sized,
{
    fn load(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<AggregateRow>, StoreError> {
        (**self).load(aggregate_type, aggregate_id)
    }

    fn commit(&self, writes: WriteSet) -> Result<(), StoreError> {
        (**self).commit(writes)
    }
}

impl<T> OutboxStore for Arc<T>
where
    T: OutboxStore + ?Sized,
{
    fn claim(&self, request: &ClaimRequest) -> Result<Vec<OutboxEntry>, StoreError> {
        (**self).claim(request)
    }

    fn mark_delivered(&self, event_id: EventId, at: DateTime<Utc>) -> Result<(), StoreError> {
        (**self).mark_delivered(event_id, at)
    }

    fn record_failure(
        &self,
        event_id: EventId,
        owner: &str,
        error: &str,
        max_retries: u32,
    ) -> Result<OutboxStatus, StoreError> {
        (**self).record_failure(event_id, owner, error, max_retries)
    }

    fn release(&self, event_ids: &[EventId], owner: &str) -> Result<(), StoreError> {
        (**self).release(event_ids, owner)
    }

    fn pending_head(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<EventId>, StoreError> {
        (**self).pending_head(aggregate_type, aggregate_id)
    }

    fn get(&self, event_id: EventId) -> Result<Option<OutboxEntry>, StoreError> {
        (**self).get(event_id)
    }

    fn stats(&self) -> Result<OutboxStats, StoreError> {
        (**self).stats()
    }

    fn list_dead(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        (**self).list_dead(limit)
    }

    fn requeue_dead(&self, event_id: EventId) -> Result<OutboxEntry, StoreError> {
        (**self).requeue_dead(event_id)
    }
}
