//! Outbox sweeper: the durability path.
//!
//! Periodically claims pending outbox entries, decodes them through the event
//! registry and fans them out again. Successful entries become `Delivered`;
//! failures bump the retry counter until the entry is `Dead`.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use herald_core::{AggregateId, EventId};
use herald_events::{Event, EventEnvelope, EventRegistry};

use crate::config::DispatchConfig;
use crate::dispatch::Fanout;
use crate::store::{ClaimRequest, OutboxEntry, OutboxStatus, OutboxStore, StoreError};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub claimed: usize,
    pub delivered: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Claimed but not processed before the batch deadline; leases released.
    pub released: usize,
    /// Claimed but held behind an earlier failed entry of the same aggregate;
    /// leases released.
    pub deferred: usize,
}

/// Sweeper runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweeperStats {
    pub sweeps: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub released: u64,
    pub deferred: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SweeperStats {
    fn absorb(&mut self, report: &SweepReport) {
        self.sweeps += 1;
        self.delivered += report.delivered as u64;
        self.failed += report.failed as u64;
        self.dead_lettered += report.dead_lettered as u64;
        self.released += report.released as u64;
        self.deferred += report.deferred as u64;
        self.last_sweep_at = Some(Utc::now());
    }
}

/// Handle to control a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SweeperStats>>,
}

impl SweeperHandle {
    /// Request graceful shutdown and wait for the current sweep to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> SweeperStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

enum EntryOutcome {
    Delivered,
    Retrying,
    Dead,
}

/// Background re-delivery of undelivered outbox entries.
pub struct OutboxSweeper<E, O> {
    outbox: O,
    registry: EventRegistry<E>,
    fanout: Fanout<E>,
    config: DispatchConfig,
}

impl<E, O> OutboxSweeper<E, O>
where
    E: Event,
    O: OutboxStore,
{
    pub fn new(outbox: O, registry: EventRegistry<E>, fanout: Fanout<E>, config: DispatchConfig) -> Self {
        Self {
            outbox,
            registry,
            fanout,
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Claim one batch and process it.
    ///
    /// Only a failed claim is an error. Per-entry store failures are logged and
    /// the entry is left for the next sweep (its lease expires).
    pub fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.config.grace_period)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let request = ClaimRequest {
            owner: self.config.sweeper_id.clone(),
            batch_size: self.config.batch_size,
            max_retries: self.config.max_retries,
            lease: self.config.lease_duration,
            created_before: now - grace,
            now,
        };

        let claimed = self.outbox.claim(&request)?;
        let mut report = SweepReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        debug!(sweeper = %request.owner, claimed = claimed.len(), "sweeping outbox");

        let deadline = Instant::now() + self.config.batch_deadline;
        let mut remaining = claimed.into_iter();
        // Aggregates whose earlier entry did not go through this sweep; their
        // later entries wait so delivery order is kept.
        let mut stalled: HashSet<(String, AggregateId)> = HashSet::new();
        let mut deferred: Vec<EventId> = Vec::new();

        while let Some(entry) = remaining.next() {
            if Instant::now() >= deadline {
                let mut unprocessed: Vec<EventId> = vec![entry.event_id];
                unprocessed.extend(remaining.by_ref().map(|e| e.event_id));
                report.released = unprocessed.len();
                warn!(
                    sweeper = %request.owner,
                    released = unprocessed.len(),
                    "batch deadline reached; releasing leases"
                );
                if let Err(err) = self.outbox.release(&unprocessed, &request.owner) {
                    warn!(sweeper = %request.owner, error = %err, "failed to release leases");
                }
                break;
            }

            let key = (entry.aggregate_type.clone(), entry.aggregate_id);
            if stalled.contains(&key) {
                deferred.push(entry.event_id);
                continue;
            }

            match self.process(&entry) {
                Ok(EntryOutcome::Delivered) => report.delivered += 1,
                Ok(EntryOutcome::Retrying) => {
                    report.failed += 1;
                    stalled.insert(key);
                }
                Ok(EntryOutcome::Dead) => {
                    report.failed += 1;
                    report.dead_lettered += 1;
                    stalled.insert(key);
                }
                Err(err) => {
                    warn!(
                        event_id = %entry.event_id,
                        error = %err,
                        "outbox update failed; entry left for next sweep"
                    );
                    stalled.insert(key);
                }
            }
        }

        if !deferred.is_empty() {
            report.deferred = deferred.len();
            debug!(
                sweeper = %request.owner,
                deferred = deferred.len(),
                "entries held behind an earlier failure of their aggregate"
            );
            if let Err(err) = self.outbox.release(&deferred, &request.owner) {
                warn!(sweeper = %request.owner, error = %err, "failed to release leases");
            }
        }

        info!(
            sweeper = %request.owner,
            claimed = report.claimed,
            delivered = report.delivered,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            released = report.released,
            deferred = report.deferred,
            "sweep finished"
        );
        Ok(report)
    }

    fn process(&self, entry: &OutboxEntry) -> Result<EntryOutcome, StoreError> {
        let envelope = match self.registry.decode(&entry.event_type, &entry.payload) {
            Ok(event) => EventEnvelope::new(
                entry.event_id,
                entry.aggregate_id,
                entry.aggregate_type.clone(),
                entry.event_type.clone(),
                entry.occurred_at,
                event,
            ),
            Err(err) => {
                self.fanout.metrics().record_failed(&entry.event_type);
                return self.fail(entry, &err.to_string());
            }
        };

        match self.fanout.deliver(&envelope) {
            Ok(()) => {
                self.outbox.mark_delivered(entry.event_id, Utc::now())?;
                Ok(EntryOutcome::Delivered)
            }
            Err(failure) => self.fail(entry, &failure.to_string()),
        }
    }

    fn fail(&self, entry: &OutboxEntry, reason: &str) -> Result<EntryOutcome, StoreError> {
        let status = self
            .outbox
            .record_failure(
                entry.event_id,
                &self.config.sweeper_id,
                reason,
                self.config.max_retries,
            )?;

        match status {
            OutboxStatus::Dead => {
                self.fanout.metrics().record_dead_lettered(&entry.event_type);
                error!(
                    event_id = %entry.event_id,
                    event_type = %entry.event_type,
                    aggregate_id = %entry.aggregate_id,
                    retry_count = entry.retry_count + 1,
                    error = %reason,
                    "outbox entry dead-lettered"
                );
                Ok(EntryOutcome::Dead)
            }
            OutboxStatus::Pending => {
                warn!(
                    event_id = %entry.event_id,
                    event_type = %entry.event_type,
                    retry_count = entry.retry_count + 1,
                    error = %reason,
                    "outbox delivery failed; will retry"
                );
                Ok(EntryOutcome::Retrying)
            }
            // The immediate path got there first.
            OutboxStatus::Delivered => {
                debug!(event_id = %entry.event_id, "entry already delivered");
                Ok(EntryOutcome::Delivered)
            }
        }
    }

    /// Run on a dedicated thread: sweep immediately, then every
    /// `sweep_interval` until shutdown.
    pub fn spawn(self) -> io::Result<SweeperHandle>
    where
        O: 'static,
    {
        if !self.config.lease_covers_batch() {
            warn!(
                sweeper = %self.config.sweeper_id,
                lease_ms = self.config.lease_duration.as_millis() as u64,
                batch_deadline_ms = self.config.batch_deadline.as_millis() as u64,
                event_timeout_ms = self.config.event_timeout.as_millis() as u64,
                "lease shorter than a batch; another sweeper may take over entries in flight"
            );
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(SweeperStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(format!("outbox-{}", self.config.sweeper_id))
            .spawn(move || sweeper_loop(self, shutdown_rx, stats_clone))?;

        Ok(SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn sweeper_loop<E, O>(
    sweeper: OutboxSweeper<E, O>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<SweeperStats>>,
) where
    E: Event,
    O: OutboxStore,
{
    let name = sweeper.config.sweeper_id.clone();
    info!(sweeper = %name, interval_ms = sweeper.config.sweep_interval.as_millis() as u64, "outbox sweeper started");

    loop {
        match sweeper.sweep_once() {
            Ok(report) => {
                if let Ok(mut s) = stats.lock() {
                    s.absorb(&report);
                }
            }
            Err(err) => {
                // Infrastructure trouble: try again next interval.
                error!(sweeper = %name, error = %err, "sweep failed");
                if let Ok(mut s) = stats.lock() {
                    s.sweeps += 1;
                    s.last_sweep_at = Some(Utc::now());
                    s.last_error = Some(err.to_string());
                }
            }
        }

        match shutdown_rx.recv_timeout(sweeper.config.sweep_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(sweeper = %name, "outbox sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::DispatchMetrics;
    use crate::store::{InMemoryStore, NewOutboxEntry, Storage, WriteSet};
    use crate::testing::{Counter, CounterEvent};
    use crate::unit_of_work::UnitOfWork;
    use herald_core::AggregateId;
    use herald_events::{ConsumerError, ConsumerRegistry};
    use serde_json::json;
    use std::time::Duration;

    fn config() -> DispatchConfig {
        DispatchConfig::default()
            .with_grace_period(Duration::ZERO)
            .with_max_retries(3)
            .with_sweep_interval(Duration::from_millis(20))
            .with_sweeper_id("test-sweeper")
    }

    fn sweeper(
        store: Arc<InMemoryStore>,
        registry: ConsumerRegistry<CounterEvent>,
        config: DispatchConfig,
    ) -> OutboxSweeper<CounterEvent, Arc<InMemoryStore>> {
        let fanout = Fanout::new(Arc::new(registry), Arc::new(DispatchMetrics::new()), config.event_timeout);
        OutboxSweeper::new(store, CounterEvent::registry(), fanout, config)
    }

    fn commit_counter(store: &InMemoryStore) {
        let mut counter = Counter::create("a");
        counter.bump(1);
        let mut uow = UnitOfWork::new();
        uow.track(&mut counter);
        uow.commit(store).unwrap();
    }

    #[test]
    fn grace_period_hides_fresh_entries() {
        let store = InMemoryStore::arc();
        commit_counter(&store);

        let sweeper = sweeper(
            store.clone(),
            ConsumerRegistry::new(),
            config().with_grace_period(Duration::from_secs(60)),
        );
        assert_eq!(sweeper.sweep_once().unwrap().claimed, 0);
    }

    #[test]
    fn unknown_event_type_counts_as_failure() {
        let store = InMemoryStore::arc();
        store
            .commit(WriteSet {
                rows: vec![],
                outbox: vec![NewOutboxEntry {
                    event_id: EventId::new(),
                    aggregate_type: "counter".into(),
                    aggregate_id: AggregateId::new(),
                    event_type: "counter.renamed".into(),
                    payload: json!({}),
                    occurred_at: Utc::now(),
                    status: OutboxStatus::Pending,
                    last_error: None,
                }],
            })
            .unwrap();

        let report = sweeper(store.clone(), ConsumerRegistry::new(), config())
            .sweep_once()
            .unwrap();

        assert_eq!(report.failed, 1);
        let entry = &store.entries().unwrap()[0];
        assert_eq!(entry.retry_count, 1);
        assert!(entry.last_error.as_deref().unwrap_or_default().contains("counter.renamed"));
    }

    #[test]
    fn expired_batch_deadline_releases_every_lease() {
        let store = InMemoryStore::arc();
        commit_counter(&store);

        let report = sweeper(
            store.clone(),
            ConsumerRegistry::new(),
            config().with_batch_deadline(Duration::ZERO),
        )
        .sweep_once()
        .unwrap();

        assert_eq!(report.claimed, 2);
        assert_eq!(report.released, 2);
        assert!(store.entries().unwrap().iter().all(|e| e.lease.is_none()));
    }

    #[test]
    fn spawned_sweeper_delivers_and_reports_stats() {
        let store = InMemoryStore::arc();
        commit_counter(&store);

        let mut registry = ConsumerRegistry::new();
        registry.subscribe("counter.bumped", |_| Err(ConsumerError::new("always down")));
        let handle = sweeper(store.clone(), registry, config()).spawn().unwrap();

        let started = Instant::now();
        while handle.stats().dead_lettered == 0 && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(store.stats().unwrap().dead, 1);
    }
}
