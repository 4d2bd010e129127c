//! Postgres-backed aggregate + outbox store.
//!
//! Aggregate rows and outbox entries live in the same database, so one
//! transaction covers the conditional row writes and the outbox inserts.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation on `outbox`) | `23505` | `Duplicate` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / network / other | N/A | `Storage` |
//!
//! A stale concurrency token is detected by row counts, not by error codes,
//! and surfaces as `StoreError::Conflict`.
//!
//! ## Sync bridge
//!
//! [`Storage`] and [`OutboxStore`] are synchronous. `PgStore` captures a Tokio
//! runtime handle at construction and drives its async methods with
//! `Handle::block_on`, so the trait methods must be called from threads that
//! are not runtime workers (the sweeper thread, `spawn_blocking`, plain threads).

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{debug, instrument};
use uuid::Uuid;

use herald_core::{AggregateId, ConcurrencyToken, EventId};

use super::r#trait::{
    AggregateRow, ClaimRequest, Lease, NewOutboxEntry, OutboxEntry, OutboxStats, OutboxStatus,
    OutboxStore, RowWrite, Storage, StoreError, WriteSet,
};

/// Schema for `aggregates` and `outbox`; idempotent.
pub const SCHEMA: &str = include_str!("../../migrations/0001_outbox.sql");

const OUTBOX_COLUMNS: &str = "event_id, sequence, aggregate_type, aggregate_id, event_type, \
     payload, occurred_at, created_at, processed_at, last_error, retry_count, status, \
     lease_owner, lease_expires_at";

/// Postgres store. Cheap to clone (pool + runtime handle).
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    handle: Handle,
}

impl PgStore {
    /// Create a store bound to the current Tokio runtime.
    pub fn new(pool: PgPool) -> Result<Self, StoreError> {
        let handle = Handle::try_current().map_err(|_| {
            StoreError::storage(
                "PgStore requires a tokio runtime; construct it from within one or use with_handle",
            )
        })?;
        Ok(Self::with_handle(pool, handle))
    }

    pub fn with_handle(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    pub async fn load_row(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<AggregateRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT aggregate_type, aggregate_id, token, state
            FROM aggregates
            WHERE aggregate_type = $1 AND aggregate_id = $2
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_row", e))?;

        row.map(|r| -> Result<AggregateRow, sqlx::Error> {
            Ok(AggregateRow {
                aggregate_type: r.try_get("aggregate_type")?,
                aggregate_id: AggregateId::from_uuid(r.try_get("aggregate_id")?),
                token: token_from_db(r.try_get("token")?),
                state: r.try_get("state")?,
            })
        })
        .transpose()
        .map_err(|e| map_sqlx_error("load_row", e))
    }

    /// Apply a write set in one transaction.
    #[instrument(
        skip(self, writes),
        fields(rows = writes.rows.len(), outbox = writes.outbox.len()),
        err
    )]
    pub async fn commit_writes(&self, writes: WriteSet) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for write in &writes.rows {
            if let Err(err) = write_row(&mut tx, write).await {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(err);
            }
        }

        for entry in &writes.outbox {
            if let Err(err) = insert_outbox(&mut tx, entry).await {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(err);
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    /// Lease claimable entries with `FOR UPDATE SKIP LOCKED`, so concurrent
    /// sweepers never receive the same entry.
    #[instrument(
        skip(self, request),
        fields(sweeper = %request.owner, batch_size = request.batch_size),
        err
    )]
    pub async fn claim_batch(&self, request: &ClaimRequest) -> Result<Vec<OutboxEntry>, StoreError> {
        let sql = format!(
            r#"
            WITH claimable AS (
                SELECT event_id
                FROM outbox
                WHERE status = 'pending'
                  AND retry_count < $1
                  AND created_at <= $2
                  AND (lease_expires_at IS NULL OR lease_expires_at <= $3)
                  AND NOT EXISTS (
                      SELECT 1
                      FROM outbox earlier
                      WHERE earlier.aggregate_type = outbox.aggregate_type
                        AND earlier.aggregate_id = outbox.aggregate_id
                        AND earlier.status = 'pending'
                        AND earlier.sequence < outbox.sequence
                        AND NOT (
                            earlier.retry_count < $1
                            AND earlier.created_at <= $2
                            AND (earlier.lease_expires_at IS NULL OR earlier.lease_expires_at <= $3)
                        )
                  )
                ORDER BY sequence ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox
            SET lease_owner = $5,
                lease_expires_at = $6
            WHERE event_id IN (SELECT event_id FROM claimable)
            RETURNING {OUTBOX_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(request.max_retries as i32)
            .bind(request.created_before)
            .bind(request.now)
            .bind(request.batch_size as i64)
            .bind(&request.owner)
            .bind(request.lease_expires_at())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut entries = rows
            .iter()
            .map(entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the CTE ordering.
        entries.sort_by_key(|e| e.sequence);
        debug!(claimed = entries.len(), "claimed outbox batch");
        Ok(entries)
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    pub async fn mark_entry_delivered(
        &self,
        event_id: EventId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'delivered',
                processed_at = $2,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE event_id = $1 AND status = 'pending'
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_delivered", e))?;
        Ok(())
    }

    #[instrument(skip(self, error), fields(event_id = %event_id, sweeper = %owner), err)]
    pub async fn record_entry_failure(
        &self,
        event_id: EventId,
        owner: &str,
        error: &str,
        max_retries: u32,
    ) -> Result<OutboxStatus, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE outbox
            SET retry_count = retry_count + 1,
                last_error = $2,
                lease_owner = NULL,
                lease_expires_at = NULL,
                status = CASE WHEN retry_count + 1 >= $3 THEN 'dead' ELSE 'pending' END
            WHERE event_id = $1 AND status = 'pending' AND lease_owner = $4
            RETURNING status
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(error)
        .bind(max_retries as i32)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;

        match row {
            Some(r) => {
                let status: String = r
                    .try_get("status")
                    .map_err(|e| map_sqlx_error("record_failure", e))?;
                parse_status(&status)
            }
            None => match self.fetch_entry(event_id).await? {
                Some(entry) if entry.status == OutboxStatus::Pending => Err(StoreError::LeaseLost {
                    event_id,
                    owner: owner.to_string(),
                }),
                // Not pending any more: report what it is.
                Some(entry) => Ok(entry.status),
                None => Err(StoreError::NotFound(event_id)),
            },
        }
    }

    #[instrument(skip(self, event_ids), fields(count = event_ids.len()), err)]
    pub async fn release_leases(&self, event_ids: &[EventId], owner: &str) -> Result<(), StoreError> {
        let ids = event_uuids(event_ids);
        sqlx::query(
            r#"
            UPDATE outbox
            SET lease_owner = NULL,
                lease_expires_at = NULL
            WHERE event_id = ANY($1) AND lease_owner = $2
            "#,
        )
        .bind(ids)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    pub async fn pending_head_entry(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<EventId>, StoreError> {
        let head: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT event_id
            FROM outbox
            WHERE aggregate_type = $1 AND aggregate_id = $2 AND status = 'pending'
            ORDER BY sequence ASC
            LIMIT 1
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_head", e))?;
        Ok(head.map(EventId::from_uuid))
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    pub async fn fetch_entry(&self, event_id: EventId) -> Result<Option<OutboxEntry>, StoreError> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE event_id = $1");
        let row = sqlx::query(&sql)
            .bind(event_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(entry_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn outbox_stats(&self) -> Result<OutboxStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'delivered') AS delivered,
                COUNT(*) FILTER (WHERE status = 'dead') AS dead,
                COUNT(*) FILTER (WHERE status = 'pending' AND retry_count > 0) AS retrying
            FROM outbox
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |name: &str| -> Result<usize, StoreError> {
            row.try_get::<i64, _>(name)
                .map(|n| n.max(0) as usize)
                .map_err(|e| map_sqlx_error("stats", e))
        };
        Ok(OutboxStats {
            pending: count("pending")?,
            delivered: count("delivered")?,
            dead: count("dead")?,
            retrying: count("retrying")?,
        })
    }

    #[instrument(skip(self), err)]
    pub async fn dead_entries(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE status = 'dead' ORDER BY sequence ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_dead", e))?;
        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    pub async fn requeue_dead_entry(&self, event_id: EventId) -> Result<OutboxEntry, StoreError> {
        let sql = format!(
            r#"
            UPDATE outbox
            SET status = 'pending',
                retry_count = 0,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE event_id = $1 AND status = 'dead'
            RETURNING {OUTBOX_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(event_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue_dead", e))?;

        match row {
            Some(r) => entry_from_row(&r),
            None => match self.fetch_entry(event_id).await? {
                Some(entry) => Err(StoreError::InvalidTransition {
                    event_id,
                    reason: format!("entry is {}, not dead", entry.status.as_str()),
                }),
                None => Err(StoreError::NotFound(event_id)),
            },
        }
    }
}

async fn write_row(tx: &mut Transaction<'_, Postgres>, write: &RowWrite) -> Result<(), StoreError> {
    let next = token_to_db(write.next_token());
    let result = if write.expected.is_unsaved() {
        sqlx::query(
            r#"
            INSERT INTO aggregates (aggregate_type, aggregate_id, token, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_type, aggregate_id) DO NOTHING
            "#,
        )
        .bind(&write.aggregate_type)
        .bind(write.aggregate_id.as_uuid())
        .bind(next)
        .bind(&write.state)
        .execute(&mut **tx)
        .await
    } else {
        sqlx::query(
            r#"
            UPDATE aggregates
            SET token = $3, state = $4, updated_at = NOW()
            WHERE aggregate_type = $1 AND aggregate_id = $2 AND token = $5
            "#,
        )
        .bind(&write.aggregate_type)
        .bind(write.aggregate_id.as_uuid())
        .bind(next)
        .bind(&write.state)
        .bind(token_to_db(write.expected))
        .execute(&mut **tx)
        .await
    }
    .map_err(|e| map_sqlx_error("write_row", e))?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    let actual: Option<i64> = sqlx::query_scalar(
        "SELECT token FROM aggregates WHERE aggregate_type = $1 AND aggregate_id = $2",
    )
    .bind(&write.aggregate_type)
    .bind(write.aggregate_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("read_token", e))?;

    Err(write.conflict(actual.map(token_from_db)).into())
}

async fn insert_outbox(
    tx: &mut Transaction<'_, Postgres>,
    entry: &NewOutboxEntry,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO outbox (
            event_id,
            aggregate_type,
            aggregate_id,
            event_type,
            payload,
            occurred_at,
            status,
            last_error
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry.event_id.as_uuid())
    .bind(&entry.aggregate_type)
    .bind(entry.aggregate_id.as_uuid())
    .bind(&entry.event_type)
    .bind(&entry.payload)
    .bind(entry.occurred_at)
    .bind(entry.status.as_str())
    .bind(&entry.last_error)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Duplicate(entry.event_id)
        } else {
            map_sqlx_error("insert_outbox", e)
        }
    })?;
    Ok(())
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxEntry, StoreError> {
    let read = || -> Result<OutboxEntry, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let lease_owner: Option<String> = row.try_get("lease_owner")?;
        let lease_expires_at: Option<DateTime<Utc>> = row.try_get("lease_expires_at")?;
        let retry_count: i32 = row.try_get("retry_count")?;
        Ok(OutboxEntry {
            event_id: EventId::from_uuid(row.try_get("event_id")?),
            sequence: row.try_get("sequence")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id")?),
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            occurred_at: row.try_get("occurred_at")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            last_error: row.try_get("last_error")?,
            retry_count: retry_count.max(0) as u32,
            status: OutboxStatus::parse(&status).ok_or_else(|| {
                sqlx::Error::Decode(format!("unknown outbox status '{status}'").into())
            })?,
            lease: match (lease_owner, lease_expires_at) {
                (Some(owner), Some(expires_at)) => Some(Lease { owner, expires_at }),
                _ => None,
            },
        })
    };
    read().map_err(|e| map_sqlx_error("decode_outbox_row", e))
}

fn event_uuids(ids: &[EventId]) -> Vec<Uuid> {
    ids.iter().map(|id| *id.as_uuid()).collect()
}

fn parse_status(s: &str) -> Result<OutboxStatus, StoreError> {
    OutboxStatus::parse(s).ok_or_else(|| StoreError::storage(format!("unknown outbox status '{s}'")))
}

fn token_to_db(token: ConcurrencyToken) -> i64 {
    token.value() as i64
}

fn token_from_db(value: i64) -> ConcurrencyToken {
    ConcurrencyToken::new(value.max(0) as u64)
}

impl Storage for PgStore {
    fn load(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<AggregateRow>, StoreError> {
        self.handle.block_on(self.load_row(aggregate_type, aggregate_id))
    }

    fn commit(&self, writes: WriteSet) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        self.handle.block_on(self.commit_writes(writes))
    }
}

impl OutboxStore for PgStore {
    fn claim(&self, request: &ClaimRequest) -> Result<Vec<OutboxEntry>, StoreError> {
        self.handle.block_on(self.claim_batch(request))
    }

    fn mark_delivered(&self, event_id: EventId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.handle.block_on(self.mark_entry_delivered(event_id, at))
    }

    fn record_failure(
        &self,
        event_id: EventId,
        owner: &str,
        error: &str,
        max_retries: u32,
    ) -> Result<OutboxStatus, StoreError> {
        self.handle
            .block_on(self.record_entry_failure(event_id, owner, error, max_retries))
    }

    fn release(&self, event_ids: &[EventId], owner: &str) -> Result<(), StoreError> {
        if event_ids.is_empty() {
            return Ok(());
        }
        self.handle.block_on(self.release_leases(event_ids, owner))
    }

    fn pending_head(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<EventId>, StoreError> {
        self.handle
            .block_on(self.pending_head_entry(aggregate_type, aggregate_id))
    }

    fn get(&self, event_id: EventId) -> Result<Option<OutboxEntry>, StoreError> {
        self.handle.block_on(self.fetch_entry(event_id))
    }

    fn stats(&self) -> Result<OutboxStats, StoreError> {
        self.handle.block_on(self.outbox_stats())
    }

    fn list_dead(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        self.handle.block_on(self.dead_entries(limit))
    }

    fn requeue_dead(&self, event_id: EventId) -> Result<OutboxEntry, StoreError> {
        self.handle.block_on(self.requeue_dead_entry(event_id))
    }
}

/// Map SQLx errors to store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip_through_bigint() {
        let token = ConcurrencyToken::new(42);
        assert_eq!(token_from_db(token_to_db(token)), token);
        assert_eq!(token_from_db(-1), ConcurrencyToken::UNSAVED);
    }

    #[test]
    fn schema_declares_both_tables() {
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS aggregates"));
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS outbox"));
        assert!(SCHEMA.contains("outbox_pending_aggregate_idx"));
    }

    #[test]
    fn event_ids_bind_as_uuid_array() {
        let ids = [EventId::new(), EventId::new()];
        let uuids = event_uuids(&ids);
        assert_eq!(uuids, vec![*ids[0].as_uuid(), *ids[1].as_uuid()]);
        assert!(event_uuids(&[]).is_empty());
    }

    #[test]
    fn unknown_status_is_a_storage_error() {
        assert!(matches!(parse_status("lost"), Err(StoreError::Storage(_))));
        assert_eq!(parse_status("dead").unwrap(), OutboxStatus::Dead);
    }
}
