//! Optimistic concurrency primitives.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::AggregateId;

/// Per-row version stamp used to detect lost updates.
///
/// Monotonically increasing; bumped by the storage layer on every successful
/// write. `0` means the aggregate has never been persisted.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcurrencyToken(u64);

impl ConcurrencyToken {
    /// Token of an aggregate that has not been written yet.
    pub const UNSAVED: ConcurrencyToken = ConcurrencyToken(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_unsaved(self) -> bool {
        self == Self::UNSAVED
    }

    /// Token the storage layer assigns after a successful write.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Compare-and-swap check against the token currently stored.
    ///
    /// `stored` is `None` when no row exists yet.
    pub fn matches(self, stored: Option<ConcurrencyToken>) -> bool {
        match stored {
            None => self.is_unsaved(),
            Some(current) => current == self,
        }
    }
}

impl core::fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A write was attempted with a stale concurrency token.
///
/// Returned as a value so callers can re-read, reapply and retry, or surface
/// the conflict to the end user.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error(
    "{entity} {aggregate_id} was modified concurrently (expected {expected}, found {}); refresh and resubmit",
    display_actual(.actual)
)]
pub struct ConcurrencyConflict {
    pub entity: String,
    pub aggregate_id: AggregateId,
    pub expected: ConcurrencyToken,
    /// Token found in storage (`None` if the row does not exist).
    pub actual: Option<ConcurrencyToken>,
}

fn display_actual(actual: &Option<ConcurrencyToken>) -> String {
    match actual {
        Some(token) => token.to_string(),
        None => "no row".to_string(),
    }
}

impl ConcurrencyConflict {
    pub fn new(
        entity: impl Into<String>,
        aggregate_id: AggregateId,
        expected: ConcurrencyToken,
        actual: Option<ConcurrencyToken>,
    ) -> Self {
        Self {
            entity: entity.into(),
            aggregate_id,
            expected,
            actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsaved_token_only_matches_missing_row() {
        assert!(ConcurrencyToken::UNSAVED.matches(None));
        assert!(!ConcurrencyToken::UNSAVED.matches(Some(ConcurrencyToken::new(1))));
    }

    #[test]
    fn stale_token_does_not_match() {
        let t0 = ConcurrencyToken::new(3);
        let t1 = t0.next();
        assert!(t0.matches(Some(t0)));
        assert!(!t0.matches(Some(t1)));
        assert!(!t1.matches(None));
    }

    #[test]
    fn conflict_message_names_entity_and_guidance() {
        let id = AggregateId::new();
        let conflict = ConcurrencyConflict::new(
            "ticket",
            id,
            ConcurrencyToken::new(1),
            Some(ConcurrencyToken::new(2)),
        );
        let msg = conflict.to_string();
        assert!(msg.contains("ticket"));
        assert!(msg.contains(&id.to_string()));
        assert!(msg.contains("expected v1, found v2"));
        assert!(msg.contains("refresh and resubmit"));
    }

    #[test]
    fn token_serializes_as_plain_integer() {
        let json = serde_json::to_string(&ConcurrencyToken::new(7)).unwrap();
        assert_eq!(json, "7");
    }
}
