//! Aggregate root trait for state-stored domain models.

use crate::concurrency::ConcurrencyToken;

/// Aggregate root marker + minimal interface.
///
/// Aggregates are stored as rows (not event streams). The storage layer owns the
/// concurrency token: it is read at load time, carried through the mutation and
/// replaced with the new value once a write commits.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Stable entity name used for storage rows and conflict reports
    /// (e.g. "ticket").
    fn entity_name() -> &'static str;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Token observed when the aggregate was loaded
    /// ([`ConcurrencyToken::UNSAVED`] for a freshly created aggregate).
    fn token(&self) -> ConcurrencyToken;

    /// Record the token assigned by the storage layer after a successful write.
    fn set_token(&mut self, token: ConcurrencyToken);
}
