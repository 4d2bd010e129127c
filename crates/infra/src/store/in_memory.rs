use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use herald_core::{AggregateId, ConcurrencyToken, EventId};

use super::r#trait::{
    AggregateRow, ClaimRequest, OutboxEntry, OutboxStats, OutboxStatus, OutboxStore, Storage,
    StoreError, WriteSet,
};

#[derive(Debug, Default)]
struct State {
    rows: HashMap<(String, AggregateId), AggregateRow>,
    /// Append-only, in sequence order.
    outbox: Vec<OutboxEntry>,
    index: HashMap<EventId, usize>,
    next_sequence: i64,
}

impl State {
    fn entry_mut(&mut self, event_id: EventId) -> Result<&mut OutboxEntry, StoreError> {
        let idx = *self
            .index
            .get(&event_id)
            .ok_or(StoreError::NotFound(event_id))?;
        Ok(&mut self.outbox[idx])
    }
}

/// In-memory aggregate + outbox store.
///
/// Intended for tests/dev. A single lock covers rows and outbox, so commits are
/// atomic and claims by concurrent sweepers never overlap.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::storage("lock poisoned"))
    }

    /// Every outbox entry, in sequence order.
    pub fn entries(&self) -> Result<Vec<OutboxEntry>, StoreError> {
        Ok(self.lock()?.outbox.clone())
    }

    /// Number of aggregate rows.
    pub fn row_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.rows.len())
    }
}

impl Storage for InMemoryStore {
    fn load(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<AggregateRow>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .rows
            .get(&(aggregate_type.to_string(), aggregate_id))
            .cloned())
    }

    fn commit(&self, writes: WriteSet) -> Result<(), StoreError> {
        let mut state = self.lock()?;

        // Validate everything before touching anything. Each row is checked
        // against the token left by earlier writes in the same set.
        let mut staged: HashMap<(String, AggregateId), ConcurrencyToken> = HashMap::new();
        for write in &writes.rows {
            let key = (write.aggregate_type.clone(), write.aggregate_id);
            let stored = staged
                .get(&key)
                .copied()
                .or_else(|| state.rows.get(&key).map(|r| r.token));
            if !write.expected.matches(stored) {
                return Err(write.conflict(stored).into());
            }
            staged.insert(key, write.next_token());
        }
        for (i, entry) in writes.outbox.iter().enumerate() {
            let repeated = writes.outbox[..i].iter().any(|e| e.event_id == entry.event_id);
            if repeated || state.index.contains_key(&entry.event_id) {
                return Err(StoreError::Duplicate(entry.event_id));
            }
        }

        for write in writes.rows {
            let token = write.next_token();
            let key = (write.aggregate_type.clone(), write.aggregate_id);
            state.rows.insert(
                key,
                AggregateRow {
                    aggregate_type: write.aggregate_type,
                    aggregate_id: write.aggregate_id,
                    token,
                    state: write.state,
                },
            );
        }

        let created_at = Utc::now();
        for entry in writes.outbox {
            state.next_sequence += 1;
            let sequence = state.next_sequence;
            let event_id = entry.event_id;
            let idx = state.outbox.len();
            state
                .outbox
                .push(OutboxEntry::from_new(entry, sequence, created_at));
            state.index.insert(event_id, idx);
        }

        Ok(())
    }
}

impl OutboxStore for InMemoryStore {
    fn claim(&self, request: &ClaimRequest) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut state = self.lock()?;
        let expires_at = request.lease_expires_at();

        // An aggregate with an earlier pending entry this claim cannot take is
        // held back entirely, so its events never overtake one another.
        let mut held_back: HashSet<(String, AggregateId)> = HashSet::new();
        let mut claimed = Vec::new();
        for entry in state.outbox.iter_mut() {
            if claimed.len() >= request.batch_size {
                break;
            }
            if entry.status != OutboxStatus::Pending {
                continue;
            }
            let key = (entry.aggregate_type.clone(), entry.aggregate_id);
            if held_back.contains(&key) {
                continue;
            }
            if !entry.is_claimable(request) {
                held_back.insert(key);
                continue;
            }
            entry.lease = Some(super::Lease {
                owner: request.owner.clone(),
                expires_at,
            });
            claimed.push(entry.clone());
        }
        Ok(claimed)
    }

    fn mark_delivered(&self, event_id: EventId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let entry = state.entry_mut(event_id)?;
        if entry.status == OutboxStatus::Pending {
            entry.status = OutboxStatus::Delivered;
            entry.processed_at = Some(at);
            entry.lease = None;
        }
        Ok(())
    }

    fn record_failure(
        &self,
        event_id: EventId,
        owner: &str,
        error: &str,
        max_retries: u32,
    ) -> Result<OutboxStatus, StoreError> {
        let mut state = self.lock()?;
        let entry = state.entry_mut(event_id)?;
        if entry.status != OutboxStatus::Pending {
            return Ok(entry.status);
        }
        if !entry.lease.as_ref().is_some_and(|l| l.owner == owner) {
            return Err(StoreError::LeaseLost {
                event_id,
                owner: owner.to_string(),
            });
        }
        entry.retry_count += 1;
        entry.last_error = Some(error.to_string());
        entry.lease = None;
        if entry.retry_count >= max_retries {
            entry.status = OutboxStatus::Dead;
        }
        Ok(entry.status)
    }

    fn release(&self, event_ids: &[EventId], owner: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        for id in event_ids {
            let entry = state.entry_mut(*id)?;
            if entry.lease.as_ref().is_some_and(|l| l.owner == owner) {
                entry.lease = None;
            }
        }
        Ok(())
    }

    fn pending_head(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<EventId>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .outbox
            .iter()
            .find(|e| {
                e.status == OutboxStatus::Pending
                    && e.aggregate_id == aggregate_id
                    && e.aggregate_type == aggregate_type
            })
            .map(|e| e.event_id))
    }

    fn get(&self, event_id: EventId) -> Result<Option<OutboxEntry>, StoreError> {
        let state = self.lock()?;
        Ok(state.index.get(&event_id).map(|&i| state.outbox[i].clone()))
    }

    fn stats(&self) -> Result<OutboxStats, StoreError> {
        let state = self.lock()?;
        let mut stats = OutboxStats::default();
        for entry in &state.outbox {
            match entry.status {
                OutboxStatus::Pending => {
                    stats.pending += 1;
                    if entry.retry_count > 0 {
                        stats.retrying += 1;
                    }
                }
                OutboxStatus::Delivered => stats.delivered += 1,
                OutboxStatus::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }

    fn list_dead(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .outbox
            .iter()
            .filter(|e| e.status == OutboxStatus::Dead)
            .take(limit)
            .cloned()
            .collect())
    }

    fn requeue_dead(&self, event_id: EventId) -> Result<OutboxEntry, StoreError> {
        let mut state = self.lock()?;
        let entry = state.entry_mut(event_id)?;
        if entry.status != OutboxStatus::Dead {
            return Err(StoreError::InvalidTransition {
                event_id,
                reason: format!("entry is {}, not dead", entry.status.as_str()),
            });
        }
        entry.status = OutboxStatus::Pending;
        entry.retry_count = 0;
        entry.lease = None;
        Ok(entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewOutboxEntry, RowWrite};
    use serde_json::json;
    use std::time::Duration;

    fn new_entry(aggregate_id: AggregateId, event_type: &str) -> NewOutboxEntry {
        NewOutboxEntry {
            event_id: EventId::new(),
            aggregate_type: "ticket".into(),
            aggregate_id,
            event_type: event_type.into(),
            payload: json!({}),
            occurred_at: Utc::now(),
            status: OutboxStatus::Pending,
            last_error: None,
        }
    }

    fn row(aggregate_id: AggregateId, expected: ConcurrencyToken) -> RowWrite {
        RowWrite {
            aggregate_type: "ticket".into(),
            aggregate_id,
            expected,
            state: json!({"title": "t"}),
        }
    }

    fn claim_all(owner: &str) -> ClaimRequest {
        let now = Utc::now();
        ClaimRequest {
            owner: owner.into(),
            batch_size: 100,
            max_retries: 3,
            lease: Duration::from_secs(60),
            created_before: now,
            now,
        }
    }

    #[test]
    fn commit_stamps_next_token_and_sequences() {
        let store = InMemoryStore::new();
        let id = AggregateId::new();
        store
            .commit(WriteSet {
                rows: vec![row(id, ConcurrencyToken::UNSAVED)],
                outbox: vec![new_entry(id, "a"), new_entry(id, "b")],
            })
            .unwrap();

        let loaded = store.load("ticket", id).unwrap().unwrap();
        assert_eq!(loaded.token, ConcurrencyToken::new(1));

        let entries = store.entries().unwrap();
        assert_eq!(entries.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn stale_token_rejects_whole_write_set() {
        let store = InMemoryStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        store
            .commit(WriteSet {
                rows: vec![row(a, ConcurrencyToken::UNSAVED)],
                outbox: vec![],
            })
            .unwrap();

        let err = store
            .commit(WriteSet {
                rows: vec![row(b, ConcurrencyToken::UNSAVED), row(a, ConcurrencyToken::UNSAVED)],
                outbox: vec![new_entry(b, "x")],
            })
            .unwrap_err();

        match err {
            StoreError::Conflict(c) => {
                assert_eq!(c.aggregate_id, a);
                assert_eq!(c.actual, Some(ConcurrencyToken::new(1)));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(store.load("ticket", b).unwrap().is_none());
        assert!(store.entries().unwrap().is_empty());
    }

    #[test]
    fn leased_entries_are_not_claimed_twice() {
        let store = InMemoryStore::new();
        let id = AggregateId::new();
        store
            .commit(WriteSet {
                rows: vec![],
                outbox: vec![new_entry(id, "a")],
            })
            .unwrap();

        assert_eq!(store.claim(&claim_all("s1")).unwrap().len(), 1);
        assert!(store.claim(&claim_all("s2")).unwrap().is_empty());

        let event_id = store.entries().unwrap()[0].event_id;
        store.release(&[event_id], "s2").unwrap();
        assert!(store.claim(&claim_all("s2")).unwrap().is_empty());

        store.release(&[event_id], "s1").unwrap();
        assert_eq!(store.claim(&claim_all("s2")).unwrap().len(), 1);
    }

    #[test]
    fn failures_reach_dead_and_requeue_resets() {
        let store = InMemoryStore::new();
        let entry = new_entry(AggregateId::new(), "a");
        let event_id = entry.event_id;
        store
            .commit(WriteSet {
                rows: vec![],
                outbox: vec![entry],
            })
            .unwrap();

        store.claim(&claim_all("s")).unwrap();
        assert_eq!(store.record_failure(event_id, "s", "boom", 2).unwrap(), OutboxStatus::Pending);
        store.claim(&claim_all("s")).unwrap();
        assert_eq!(store.record_failure(event_id, "s", "boom", 2).unwrap(), OutboxStatus::Dead);
        assert!(store.claim(&claim_all("s")).unwrap().is_empty());

        let stats = store.stats().unwrap();
        assert_eq!(stats.dead, 1);
        assert_eq!(store.list_dead(10).unwrap()[0].last_error.as_deref(), Some("boom"));

        let requeued = store.requeue_dead(event_id).unwrap();
        assert_eq!(requeued.status, OutboxStatus::Pending);
        assert_eq!(requeued.retry_count, 0);
        assert!(matches!(
            store.requeue_dead(event_id),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn delivered_is_terminal() {
        let store = InMemoryStore::new();
        let entry = new_entry(AggregateId::new(), "a");
        let event_id = entry.event_id;
        store
            .commit(WriteSet {
                rows: vec![],
                outbox: vec![entry],
            })
            .unwrap();

        store.mark_delivered(event_id, Utc::now()).unwrap();
        assert_eq!(store.record_failure(event_id, "s", "late", 1).unwrap(), OutboxStatus::Delivered);
        let stored = store.get(event_id).unwrap().unwrap();
        assert!(stored.processed_at.is_some());
        assert_eq!(stored.retry_count, 0);
    }

    #[test]
    fn failure_under_a_lost_lease_is_not_counted() {
        let store = InMemoryStore::new();
        let entry = new_entry(AggregateId::new(), "a");
        let event_id = entry.event_id;
        store
            .commit(WriteSet {
                rows: vec![],
                outbox: vec![entry],
            })
            .unwrap();

        // s1's lease lapses while it is still working; s2 takes the entry over.
        let lapsed = ClaimRequest {
            lease: Duration::ZERO,
            ..claim_all("s1")
        };
        assert_eq!(store.claim(&lapsed).unwrap().len(), 1);
        assert_eq!(store.claim(&claim_all("s2")).unwrap().len(), 1);

        assert!(matches!(
            store.record_failure(event_id, "s1", "slow consumer", 3),
            Err(StoreError::LeaseLost { ref owner, .. }) if owner == "s1"
        ));
        assert_eq!(store.get(event_id).unwrap().unwrap().retry_count, 0);

        assert_eq!(
            store.record_failure(event_id, "s2", "slow consumer", 3).unwrap(),
            OutboxStatus::Pending
        );
        assert_eq!(store.get(event_id).unwrap().unwrap().retry_count, 1);
    }

    #[test]
    fn claim_never_skips_ahead_within_an_aggregate() {
        let store = InMemoryStore::new();
        let held = AggregateId::new();
        let free = AggregateId::new();
        let first = new_entry(held, "a");
        let first_id = first.event_id;
        store
            .commit(WriteSet {
                rows: vec![],
                outbox: vec![first, new_entry(held, "b"), new_entry(free, "c")],
            })
            .unwrap();

        // s1 holds the head of `held`; s2 may only take the other aggregate.
        let one = ClaimRequest {
            batch_size: 1,
            ..claim_all("s1")
        };
        assert_eq!(store.claim(&one).unwrap()[0].event_id, first_id);
        let taken = store.claim(&claim_all("s2")).unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].aggregate_id, free);

        // Once the head is settled the rest of `held` becomes claimable.
        store.mark_delivered(first_id, Utc::now()).unwrap();
        let rest = store.claim(&claim_all("s2")).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].event_type, "b");
        assert_eq!(store.pending_head("ticket", held).unwrap(), Some(rest[0].event_id));
    }
}
