//! Delivery counters per event type.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default, Clone)]
struct Counters {
    delivered: u64,
    failed: u64,
    dead_lettered: u64,
    latency_count: u64,
    latency_total: Duration,
    latency_max: Duration,
}

/// Shared by the immediate dispatcher and the sweeper.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    by_type: Mutex<HashMap<String, Counters>>,
}

/// Delivery latency (event occurrence to successful delivery).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub avg_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeMetrics {
    pub delivered: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub latency: LatencySummary,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub by_type: BTreeMap<String, TypeMetrics>,
    pub delivered: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

impl MetricsSnapshot {
    pub fn for_type(&self, event_type: &str) -> TypeMetrics {
        self.by_type.get(event_type).cloned().unwrap_or_default()
    }
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_counters(&self, event_type: &str, f: impl FnOnce(&mut Counters)) {
        let mut map = self.by_type.lock().unwrap_or_else(|p| p.into_inner());
        f(map.entry(event_type.to_string()).or_default());
    }

    pub fn record_delivered(&self, event_type: &str, latency: Duration) {
        self.with_counters(event_type, |c| {
            c.delivered += 1;
            c.latency_count += 1;
            c.latency_total += latency;
            c.latency_max = c.latency_max.max(latency);
        });
    }

    pub fn record_failed(&self, event_type: &str) {
        self.with_counters(event_type, |c| c.failed += 1);
    }

    pub fn record_dead_lettered(&self, event_type: &str) {
        self.with_counters(event_type, |c| c.dead_lettered += 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let map = self.by_type.lock().unwrap_or_else(|p| p.into_inner());
        let mut snapshot = MetricsSnapshot::default();
        for (event_type, c) in map.iter() {
            let avg_ms = if c.latency_count == 0 {
                0
            } else {
                (c.latency_total.as_millis() / c.latency_count as u128) as u64
            };
            snapshot.delivered += c.delivered;
            snapshot.failed += c.failed;
            snapshot.dead_lettered += c.dead_lettered;
            snapshot.by_type.insert(
                event_type.clone(),
                TypeMetrics {
                    delivered: c.delivered,
                    failed: c.failed,
                    dead_lettered: c.dead_lettered,
                    latency: LatencySummary {
                        count: c.latency_count,
                        avg_ms,
                        max_ms: c.latency_max.as_millis() as u64,
                    },
                },
            );
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_aggregates_per_type_and_totals() {
        let metrics = DispatchMetrics::new();
        metrics.record_delivered("ticket.created", Duration::from_millis(10));
        metrics.record_delivered("ticket.created", Duration::from_millis(30));
        metrics.record_failed("ticket.closed");
        metrics.record_dead_lettered("ticket.closed");

        let snap = metrics.snapshot();
        let created = snap.for_type("ticket.created");
        assert_eq!(created.delivered, 2);
        assert_eq!(created.latency.avg_ms, 20);
        assert_eq!(created.latency.max_ms, 30);

        let closed = snap.for_type("ticket.closed");
        assert_eq!((closed.failed, closed.dead_lettered), (1, 1));
        assert_eq!((snap.delivered, snap.failed, snap.dead_lettered), (2, 1, 1));
    }

    #[test]
    fn unknown_type_reads_as_zero() {
        assert_eq!(DispatchMetrics::new().snapshot().for_type("x"), TypeMetrics::default());
    }
}
