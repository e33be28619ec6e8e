//! Append-only transaction history. See `spec.md` §4.4.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{DbError, WalletError};
use crate::store::Store;
use crate::types::{now, Direction, Timestamp, Transaction, TxStatus, TxType};

fn tx_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let id: String = row.get("id")?;
    let tx_type: String = row.get("tx_type")?;
    let direction: String = row.get("direction")?;
    let status: String = row.get("status")?;

    Ok(Transaction {
        id: Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        tx_type: TxType::from_db_str(&tx_type)
            .ok_or_else(|| rusqlite::Error::InvalidColumnType(0, tx_type.clone(), rusqlite::types::Type::Text))?,
        direction: Direction::from_db_str(&direction)
            .ok_or_else(|| rusqlite::Error::InvalidColumnType(0, direction.clone(), rusqlite::types::Type::Text))?,
        amount: row.get::<_, i64>("amount")? as u64,
        mint_url: row.get("mint_url")?,
        status: TxStatus::from_db_str(&status)
            .ok_or_else(|| rusqlite::Error::InvalidColumnType(0, status.clone(), rusqlite::types::Type::Text))?,
        payment_request: row.get("payment_request")?,
        proof_count: row.get::<_, i64>("proof_count")? as u32,
        memo: row.get("memo")?,
        preimage: row.get("preimage")?,
        created_at: row.get("created_at")?,
        completed_at: row.get("completed_at")?,
    })
}

/// Fields needed to append a new transaction. Starts PENDING.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub tx_type: TxType,
    pub direction: Direction,
    pub amount: u64,
    pub mint_url: String,
    pub payment_request: Option<String>,
    pub proof_count: u32,
    pub memo: Option<String>,
}

/// Filter for [`TxLog::list`]. `None` fields are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct TxFilter {
    pub tx_type: Option<TxType>,
    pub status: Option<TxStatus>,
    pub direction: Option<Direction>,
    pub mint_url: Option<String>,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct TxLog {
    store: Store,
}

impl TxLog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn append(&self, new_tx: NewTransaction) -> Result<Uuid, WalletError> {
        let id = Uuid::new_v4();
        let created_at = now();

        self.store
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO transactions (id, tx_type, direction, amount, mint_url, status, payment_request, proof_count, memo, preimage, created_at, completed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', ?6, ?7, ?8, NULL, ?9, NULL)",
                    params![
                        id.to_string(),
                        new_tx.tx_type.as_db_str(),
                        new_tx.direction.as_db_str(),
                        new_tx.amount as i64,
                        new_tx.mint_url,
                        new_tx.payment_request,
                        new_tx.proof_count,
                        new_tx.memo,
                        created_at,
                    ],
                )
                .map_err(DbError::Sqlite)?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    pub async fn update_status(
        &self,
        id: Uuid,
        status: TxStatus,
        completed_at: Option<Timestamp>,
    ) -> Result<(), WalletError> {
        let id_str = id.to_string();
        self.store
            .transaction(move |tx| {
                tx.execute(
                    "UPDATE transactions SET status = ?1, completed_at = ?2 WHERE id = ?3",
                    params![status.as_db_str(), completed_at, id_str],
                )
                .map_err(DbError::Sqlite)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Records a Lightning preimage once a melt completes.
    pub async fn set_preimage(&self, id: Uuid, preimage: Option<String>) -> Result<(), WalletError> {
        let id_str = id.to_string();
        self.store
            .transaction(move |tx| {
                tx.execute(
                    "UPDATE transactions SET preimage = ?1 WHERE id = ?2",
                    params![preimage, id_str],
                )
                .map_err(DbError::Sqlite)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Transaction>, WalletError> {
        let id_str = id.to_string();
        Ok(self
            .store
            .transaction(move |tx| {
                tx.query_row("SELECT * FROM transactions WHERE id = ?1", params![id_str], tx_from_row)
                    .optional()
                    .map_err(DbError::Sqlite)
            })
            .await?)
    }

    pub async fn list(&self, filter: TxFilter) -> Result<Vec<Transaction>, WalletError> {
        Ok(self
            .store
            .transaction(move |tx| {
                let mut sql = "SELECT * FROM transactions WHERE 1=1".to_string();
                let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

                if let Some(t) = filter.tx_type {
                    sql.push_str(" AND tx_type = ?");
                    bound.push(Box::new(t.as_db_str().to_string()));
                }
                if let Some(s) = filter.status {
                    sql.push_str(" AND status = ?");
                    bound.push(Box::new(s.as_db_str().to_string()));
                }
                if let Some(d) = filter.direction {
                    sql.push_str(" AND direction = ?");
                    bound.push(Box::new(d.as_db_str().to_string()));
                }
                if let Some(m) = &filter.mint_url {
                    sql.push_str(" AND mint_url = ?");
                    bound.push(Box::new(m.clone()));
                }
                if let Some(since) = filter.since {
                    sql.push_str(" AND created_at >= ?");
                    bound.push(Box::new(since));
                }
                if let Some(until) = filter.until {
                    sql.push_str(" AND created_at <= ?");
                    bound.push(Box::new(until));
                }
                sql.push_str(" ORDER BY created_at DESC");
                if let Some(limit) = filter.limit {
                    sql.push_str(&format!(" LIMIT {limit}"));
                }
                if let Some(offset) = filter.offset {
                    sql.push_str(&format!(" OFFSET {offset}"));
                }

                let mut stmt = tx.prepare(&sql).map_err(DbError::Sqlite)?;
                let params_ref: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
                let rows = stmt
                    .query_map(params_ref.as_slice(), tx_from_row)
                    .map_err(DbError::Sqlite)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(DbError::Sqlite)?;
                Ok(rows)
            })
            .await?)
    }

    /// All PENDING transactions, oldest first. Used by `SyncEngine`.
    pub async fn get_pending(&self) -> Result<Vec<Transaction>, WalletError> {
        Ok(self
            .store
            .transaction(|tx| {
                let mut stmt = tx
                    .prepare("SELECT * FROM transactions WHERE status = 'PENDING' ORDER BY created_at ASC")
                    .map_err(DbError::Sqlite)?;
                let rows = stmt
                    .query_map([], tx_from_row)
                    .map_err(DbError::Sqlite)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(DbError::Sqlite)?;
                Ok(rows)
            })
            .await?)
    }

    pub async fn pending_count(&self) -> Result<u64, WalletError> {
        Ok(self
            .store
            .transaction(|tx| {
                let v: i64 = tx
                    .query_row("SELECT COUNT(*) FROM transactions WHERE status = 'PENDING'", [], |r| {
                        r.get(0)
                    })
                    .map_err(DbError::Sqlite)?;
                Ok(v as u64)
            })
            .await?)
    }

    /// Sum of COMPLETED transaction amounts, grouped by mint.
    pub async fn totals_by_mint(&self) -> Result<HashMap<String, u64>, WalletError> {
        Ok(self
            .store
            .transaction(|tx| {
                let mut stmt = tx
                    .prepare(
                        "SELECT mint_url, COALESCE(SUM(amount), 0) FROM transactions WHERE status = 'COMPLETED' GROUP BY mint_url",
                    )
                    .map_err(DbError::Sqlite)?;
                let rows = stmt
                    .query_map([], |r| {
                        let url: String = r.get(0)?;
                        let total: i64 = r.get(1)?;
                        Ok((url, total as u64))
                    })
                    .map_err(DbError::Sqlite)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(DbError::Sqlite)?;
                Ok(rows.into_iter().collect())
            })
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_tx(amount: u64, mint_url: &str) -> NewTransaction {
        NewTransaction {
            tx_type: TxType::Mint,
            direction: Direction::Incoming,
            amount,
            mint_url: mint_url.to_string(),
            payment_request: None,
            proof_count: 1,
            memo: None,
        }
    }

    async fn log() -> TxLog {
        TxLog::new(Store::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn append_starts_pending_then_update_status_completes_it() {
        let tx_log = log().await;
        let id = tx_log.append(new_tx(8, "https://mint.example")).await.unwrap();

        let tx = tx_log.get(id).await.unwrap().unwrap();
        assert_eq!(tx.status, TxStatus::Pending);
        assert!(tx.completed_at.is_none());

        tx_log.update_status(id, TxStatus::Completed, Some(now())).await.unwrap();
        let completed = tx_log.get(id).await.unwrap().unwrap();
        assert_eq!(completed.status, TxStatus::Completed);
        assert!(completed.completed_at.is_some());
    }

    #[tokio::test]
    async fn set_preimage_records_melt_proof() {
        let tx_log = log().await;
        let mut melt = new_tx(8, "https://mint.example");
        melt.tx_type = TxType::Melt;
        melt.direction = Direction::Outgoing;
        let id = tx_log.append(melt).await.unwrap();

        tx_log.set_preimage(id, Some("preimage".to_string())).await.unwrap();
        let tx = tx_log.get(id).await.unwrap().unwrap();
        assert_eq!(tx.preimage.as_deref(), Some("preimage"));
    }

    #[tokio::test]
    async fn get_pending_returns_only_pending_oldest_first() {
        let tx_log = log().await;
        let first = tx_log.append(new_tx(4, "https://mint.example")).await.unwrap();
        let second = tx_log.append(new_tx(8, "https://mint.example")).await.unwrap();
        tx_log.update_status(second, TxStatus::Completed, Some(now())).await.unwrap();
        let third = tx_log.append(new_tx(2, "https://mint.example")).await.unwrap();

        let pending = tx_log.get_pending().await.unwrap();
        assert_eq!(pending.iter().map(|t| t.id).collect::<Vec<_>>(), vec![first, third]);
        assert_eq!(tx_log.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn list_filters_by_type_status_and_mint() {
        let tx_log = log().await;
        let a = tx_log.append(new_tx(4, "https://a.example")).await.unwrap();
        let b = tx_log.append(new_tx(8, "https://b.example")).await.unwrap();
        tx_log.update_status(b, TxStatus::Completed, Some(now())).await.unwrap();

        let all_a = tx_log.list(TxFilter { mint_url: Some("https://a.example".to_string()), ..Default::default() }).await.unwrap();
        assert_eq!(all_a.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a]);

        let completed = tx_log.list(TxFilter { status: Some(TxStatus::Completed), ..Default::default() }).await.unwrap();
        assert_eq!(completed.iter().map(|t| t.id).collect::<Vec<_>>(), vec![b]);
    }

    #[tokio::test]
    async fn totals_by_mint_sums_only_completed() {
        let tx_log = log().await;
        let id = tx_log.append(new_tx(10, "https://mint.example")).await.unwrap();
        tx_log.append(new_tx(5, "https://mint.example")).await.unwrap();
        tx_log.update_status(id, TxStatus::Completed, Some(now())).await.unwrap();

        let totals = tx_log.totals_by_mint().await.unwrap();
        assert_eq!(totals.get("https://mint.example"), Some(&10));
    }
}
