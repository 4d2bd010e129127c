//! Outbox sweeper process.
//!
//! Environment:
//! - `DATABASE_URL` (required)
//! - `HERALD_*` dispatch settings, see [`DispatchConfig::from_env`]
//! - `STATS_INTERVAL_SECS` (default 60)
//! - `RUST_LOG`, `LOG_FORMAT`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;

use herald_events::{ConsumerRegistry, Deduplicating};
use herald_infra::{DispatchConfig, DispatchMetrics, Fanout, OutboxSweeper, PgStore};
use herald_tickets::{
    AssignmentNotifier, AuditTrail, CacheInvalidator, InMemoryCache, TicketEvent,
};

const DEDUP_CAPACITY: usize = 10_000;

fn consumers() -> ConsumerRegistry<TicketEvent> {
    let mut consumers = ConsumerRegistry::new();
    consumers
        .subscribe_consumer(
            "ticket.*",
            Arc::new(CacheInvalidator::new(Arc::new(InMemoryCache::new()))),
        )
        .subscribe_consumer("ticket.*", Arc::new(AuditTrail::new()))
        .subscribe_consumer(
            TicketEvent::ASSIGNED,
            Arc::new(Deduplicating::new(AssignmentNotifier, DEDUP_CAPACITY)),
        );
    consumers
}

fn stats_interval() -> Duration {
    std::env::var("STATS_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(60))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    herald_observability::init();

    let config = DispatchConfig::from_env();
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PgStore::new(pool)?);
    store.ensure_schema().await?;

    let metrics = Arc::new(DispatchMetrics::new());
    let fanout = Fanout::new(Arc::new(consumers()), metrics.clone(), config.event_timeout)
        .with_thread_limit(config.consumer_threads);

    tracing::info!(
        sweeper_id = %config.sweeper_id,
        interval_ms = config.sweep_interval.as_millis() as u64,
        batch_size = config.batch_size,
        max_retries = config.max_retries,
        "starting outbox sweeper"
    );
    let handle = OutboxSweeper::new(store.clone(), TicketEvent::registry(), fanout, config)
        .spawn()
        .context("failed to start sweeper thread")?;

    let mut ticker = tokio::time::interval(stats_interval());
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let sweeper = handle.stats();
                match store.outbox_stats().await {
                    Ok(outbox) => tracing::info!(
                        pending = outbox.pending,
                        retrying = outbox.retrying,
                        dead = outbox.dead,
                        delivered = outbox.delivered,
                        sweeps = sweeper.sweeps,
                        "outbox status"
                    ),
                    Err(err) => tracing::warn!(error = %err, "failed to read outbox stats"),
                }
                let snapshot = metrics.snapshot();
                tracing::info!(
                    delivered = snapshot.delivered,
                    failed = snapshot.failed,
                    dead_lettered = snapshot.dead_lettered,
                    "dispatch metrics"
                );
            }
        }
    }

    tracing::info!("shutdown requested");
    tokio::task::spawn_blocking(move || handle.shutdown())
        .await
        .context("sweeper shutdown panicked")?;
    tracing::info!("sweeper stopped");
    Ok(())
}
