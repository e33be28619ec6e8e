//! Persistent, prioritized operation queue with exponential backoff. See
//! `spec.md` §4.8.

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{DbError, WalletError};
use crate::store::Store;
use crate::types::{now, OpStatus, OpType, Priority, QueuedOp, Timestamp};

/// Base backoff delay, in seconds.
pub const BACKOFF_BASE_SECS: i64 = 5;
/// Maximum backoff delay, in seconds.
pub const BACKOFF_MAX_SECS: i64 = 5 * 60;
/// Default retention for COMPLETED rows.
pub const RETAIN_COMPLETED_SECS: i64 = 24 * 3600;
/// Default retention for FAILED rows.
pub const RETAIN_FAILED_SECS: i64 = 72 * 3600;

/// Computes the next backoff delay for the given (post-increment) retry
/// count. See `spec.md` Testable Property 6.
pub fn backoff_delay(retry_count: u32) -> i64 {
    let scaled = BACKOFF_BASE_SECS.saturating_mul(1i64 << retry_count.min(20));
    scaled.min(BACKOFF_MAX_SECS)
}

fn op_from_row(row: &Row<'_>) -> rusqlite::Result<QueuedOp> {
    let id: String = row.get("id")?;
    let op_type: String = row.get("op_type")?;
    let status: String = row.get("status")?;
    let priority: i32 = row.get("priority")?;
    let payload_str: String = row.get("payload")?;

    Ok(QueuedOp {
        id: Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        op_type: OpType::from_db_str(&op_type)
            .ok_or_else(|| rusqlite::Error::InvalidColumnType(0, op_type.clone(), rusqlite::types::Type::Text))?,
        payload: serde_json::from_str(&payload_str)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        priority: Priority::from_i32(priority)
            .ok_or_else(|| rusqlite::Error::InvalidColumnType(0, priority.to_string(), rusqlite::types::Type::Integer))?,
        status: OpStatus::from_db_str(&status)
            .ok_or_else(|| rusqlite::Error::InvalidColumnType(0, status.clone(), rusqlite::types::Type::Text))?,
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        max_retries: row.get::<_, i64>("max_retries")? as u32,
        last_error: row.get("last_error")?,
        scheduled_for: row.get("scheduled_for")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct OpQueue {
    store: Store,
}

impl OpQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn enqueue(
        &self,
        op_type: OpType,
        payload: serde_json::Value,
        priority: Priority,
        max_retries: u32,
    ) -> Result<Uuid, WalletError> {
        let id = Uuid::new_v4();
        let ts = now();
        let payload_str = serde_json::to_string(&payload).map_err(|e| WalletError::Custom(e.to_string()))?;

        self.store
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO operation_queue (id, op_type, payload, priority, status, retry_count, max_retries, last_error, scheduled_for, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'PENDING', 0, ?5, NULL, NULL, ?6, ?6)",
                    params![id.to_string(), op_type.as_db_str(), payload_str, priority as i32, max_retries, ts],
                )
                .map_err(DbError::Sqlite)?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// Atomically selects the next eligible PENDING row
    /// (`scheduled_for` null or due) ordered by priority then age, and
    /// flips it to PROCESSING. Returns `None` if nothing is eligible.
    pub async fn dequeue(&self) -> Result<Option<QueuedOp>, WalletError> {
        let ts = now();
        Ok(self
            .store
            .transaction(move |tx| {
                let row = tx
                    .query_row(
                        "SELECT * FROM operation_queue
                         WHERE status = 'PENDING' AND (scheduled_for IS NULL OR scheduled_for <= ?1)
                         ORDER BY priority DESC, created_at ASC LIMIT 1",
                        params![ts],
                        op_from_row,
                    )
                    .optional()
                    .map_err(DbError::Sqlite)?;

                let Some(op) = row else {
                    return Ok(None);
                };

                tx.execute(
                    "UPDATE operation_queue SET status = 'PROCESSING', updated_at = ?1 WHERE id = ?2",
                    params![ts, op.id.to_string()],
                )
                .map_err(DbError::Sqlite)?;

                Ok(Some(QueuedOp {
                    status: OpStatus::Processing,
                    updated_at: ts,
                    ..op
                }))
            })
            .await?)
    }

    pub async fn complete(&self, id: Uuid) -> Result<(), WalletError> {
        let ts = now();
        self.store
            .transaction(move |tx| {
                tx.execute(
                    "UPDATE operation_queue SET status = 'COMPLETED', updated_at = ?1 WHERE id = ?2",
                    params![ts, id.to_string()],
                )
                .map_err(DbError::Sqlite)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Records a failure. If the retry budget is exhausted, marks FAILED;
    /// otherwise schedules a backed-off retry. See `spec.md` §4.8.
    pub async fn fail(&self, id: Uuid, err: &str) -> Result<(), WalletError> {
        let id_str = id.to_string();
        let err = err.to_string();
        let ts = now();

        self.store
            .transaction(move |tx| {
                let (retry_count, max_retries): (i64, i64) = tx
                    .query_row(
                        "SELECT retry_count, max_retries FROM operation_queue WHERE id = ?1",
                        params![id_str],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .map_err(DbError::Sqlite)?;

                let new_retry_count = retry_count + 1;

                if new_retry_count >= max_retries {
                    tx.execute(
                        "UPDATE operation_queue SET status = 'FAILED', retry_count = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
                        params![new_retry_count, err, ts, id_str],
                    )
                    .map_err(DbError::Sqlite)?;
                } else {
                    let delay = backoff_delay(new_retry_count as u32);
                    let scheduled_for: Timestamp = ts + delay;
                    tx.execute(
                        "UPDATE operation_queue SET status = 'PENDING', retry_count = ?1, last_error = ?2, scheduled_for = ?3, updated_at = ?4 WHERE id = ?5",
                        params![new_retry_count, err, scheduled_for, ts, id_str],
                    )
                    .map_err(DbError::Sqlite)?;
                }

                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn cancel(&self, id: Uuid) -> Result<(), WalletError> {
        let ts = now();
        self.store
            .transaction(move |tx| {
                tx.execute(
                    "UPDATE operation_queue SET status = 'CANCELLED', updated_at = ?1 WHERE id = ?2",
                    params![ts, id.to_string()],
                )
                .map_err(DbError::Sqlite)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<QueuedOp>, WalletError> {
        let id_str = id.to_string();
        Ok(self
            .store
            .transaction(move |tx| {
                tx.query_row("SELECT * FROM operation_queue WHERE id = ?1", params![id_str], op_from_row)
                    .optional()
                    .map_err(DbError::Sqlite)
            })
            .await?)
    }

    /// Deletes COMPLETED rows older than 24h and FAILED rows older than
    /// 72h.
    pub async fn purge_old(&self) -> Result<u64, WalletError> {
        let ts = now();
        let completed_cutoff = ts - RETAIN_COMPLETED_SECS;
        let failed_cutoff = ts - RETAIN_FAILED_SECS;

        Ok(self
            .store
            .transaction(move |tx| {
                let a = tx
                    .execute(
                        "DELETE FROM operation_queue WHERE status = 'COMPLETED' AND updated_at < ?1",
                        params![completed_cutoff],
                    )
                    .map_err(DbError::Sqlite)?;
                let b = tx
                    .execute(
                        "DELETE FROM operation_queue WHERE status = 'FAILED' AND updated_at < ?1",
                        params![failed_cutoff],
                    )
                    .map_err(DbError::Sqlite)?;
                Ok((a + b) as u64)
            })
            .await?)
    }

    /// Drains a snapshot of currently-PENDING items through `processor`.
    /// Per item: success calls `complete`, an `Err` calls `fail`.
    /// Processing continues despite individual failures.
    pub async fn process_pending<F, Fut>(&self, processor: F) -> Result<(), WalletError>
    where
        F: Fn(QueuedOp) -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        let snapshot = self
            .store
            .transaction(|tx| {
                let mut stmt = tx
                    .prepare("SELECT * FROM operation_queue WHERE status = 'PENDING'")
                    .map_err(DbError::Sqlite)?;
                let rows = stmt
                    .query_map([], op_from_row)
                    .map_err(DbError::Sqlite)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(DbError::Sqlite)?;
                Ok(rows)
            })
            .await?;

        for op in snapshot {
            let id = op.id;
            match processor(op).await {
                Ok(()) => self.complete(id).await?,
                Err(e) => self.fail(id, &e).await?,
            }
        }

        Ok(())
    }
}
