//! Durable storage. See `spec.md` §4.1.
//!
//! The wallet core runs as a single-threaded cooperative event loop
//! (`spec.md` §5): the store is accessed from that loop only, so a single
//! pooled connection behind an async mutex is sufficient — there is no
//! cross-thread contention to arbitrate, unlike the teacher's
//! multi-connection pool (`cdk-sql-common::pool`) which serves a
//! multi-threaded async runtime with many concurrent readers.

mod migrations;

use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::DbError;

/// Durable key/row storage with WAL journaling, foreign-key enforcement,
/// and a transaction primitive giving callers a stable snapshot with
/// all-or-nothing commit.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (creating if necessary) a durable store at `path`, applying any
    /// pending migrations.
    pub fn open(path: &str) -> Result<Self, DbError> {
        let mut conn = Connection::open(path)?;
        Self::configure(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory store. Intended for tests.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let mut conn = Connection::open_in_memory()?;
        Self::configure(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure(conn: &mut Connection) -> Result<(), DbError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        migrations::run(conn)?;
        Ok(())
    }

    /// Runs `f` inside a single serializable transaction. On `Err`, all
    /// writes made by `f` are rolled back; on `Ok`, they are committed
    /// atomically. `f` sees a stable snapshot for the duration of the call.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                // rusqlite rolls back automatically on Transaction::drop if
                // not committed.
                Err(e)
            }
        }
    }

    /// Runs a read-only statement returning a single optional row, mapped
    /// by `f`. Intended for simple point lookups outside a transaction.
    pub async fn query_row<T, F>(&self, sql: &str, params: &[&dyn rusqlite::ToSql], f: F) -> Result<Option<T>, DbError>
    where
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let guard = self.conn.lock().await;
        match guard.query_row(sql, params, f) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }
}
