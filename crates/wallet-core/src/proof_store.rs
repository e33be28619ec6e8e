//! Proof CRUD, the proof state machine, pessimistic locking, and coin
//! selection. See `spec.md` §4.2 — the hardest component in the system.

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{DbError, WalletError};
use crate::store::Store;
use crate::types::{now, Proof, ProofId, ProofState, Timestamp, LOCK_TIMEOUT_SECS};

/// Fields needed to insert a freshly-issued proof. State starts UNSPENT,
/// locks are unset, `created_at` is stamped at insert time.
#[derive(Debug, Clone)]
pub struct NewProof {
    pub secret: String,
    pub c: String,
    pub amount: u64,
    pub mint_url: String,
    pub keyset_id: String,
    pub is_reserve: bool,
    pub dleq: Option<String>,
}

/// Result of [`ProofStore::select_for_amount`].
#[derive(Debug, Clone)]
pub struct Selection {
    pub proofs: Vec<Proof>,
    pub total: u64,
    pub change: u64,
}

fn proof_from_row(row: &Row<'_>) -> rusqlite::Result<Proof> {
    let id_str: String = row.get("id")?;
    let state_str: String = row.get("state")?;
    let locked_for_str: Option<String> = row.get("locked_for")?;

    Ok(Proof {
        id: ProofId(
            Uuid::parse_str(&id_str)
                .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        ),
        secret: row.get("secret")?,
        c: row.get("c")?,
        amount: row.get::<_, i64>("amount")? as u64,
        mint_url: row.get("mint_url")?,
        keyset_id: row.get("keyset_id")?,
        state: ProofState::from_db_str(&state_str).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(0, state_str.clone(), rusqlite::types::Type::Text)
        })?,
        is_reserve: row.get::<_, i64>("is_reserve")? != 0,
        locked_at: row.get("locked_at")?,
        locked_for: locked_for_str
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        created_at: row.get("created_at")?,
        dleq: row.get("dleq")?,
    })
}

/// Durable proof store. Every mutation goes through [`Store::transaction`]
/// so concurrent callers observe strictly serializable transitions.
#[derive(Debug, Clone)]
pub struct ProofStore {
    store: Store,
}

impl ProofStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Inserts a newly-issued UNSPENT proof. A unique-secret violation is
    /// surfaced as [`WalletError::DuplicateProof`] — the caller must treat
    /// this as a possible replay, never silently ignore it.
    pub async fn insert(&self, new_proof: NewProof) -> Result<ProofId, WalletError> {
        let id = ProofId::new();
        let created_at = now();

        self.store
            .transaction(move |tx| {
                let result = tx.execute(
                    "INSERT INTO proofs (id, secret, c, amount, mint_url, keyset_id, state, is_reserve, locked_at, locked_for, created_at, dleq)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'UNSPENT', ?7, NULL, NULL, ?8, ?9)",
                    params![
                        id.0.to_string(),
                        new_proof.secret,
                        new_proof.c,
                        new_proof.amount as i64,
                        new_proof.mint_url,
                        new_proof.keyset_id,
                        new_proof.is_reserve as i64,
                        created_at,
                        new_proof.dleq,
                    ],
                );

                match result {
                    Ok(_) => Ok(id),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Err(DbError::DuplicateSecret)
                    }
                    Err(e) => Err(DbError::Sqlite(e)),
                }
            })
            .await
            .map_err(|e| match e {
                DbError::DuplicateSecret => WalletError::DuplicateProof,
                other => WalletError::Db(other),
            })
    }

    pub async fn get(&self, id: ProofId) -> Result<Option<Proof>, WalletError> {
        let id_str = id.0.to_string();
        Ok(self
            .store
            .transaction(move |tx| {
                tx.query_row("SELECT * FROM proofs WHERE id = ?1", params![id_str], proof_from_row)
                    .optional()
                    .map_err(DbError::Sqlite)
            })
            .await?)
    }

    pub async fn get_by_secret(&self, secret: &str) -> Result<Option<Proof>, WalletError> {
        let secret = secret.to_string();
        Ok(self
            .store
            .transaction(move |tx| {
                tx.query_row("SELECT * FROM proofs WHERE secret = ?1", params![secret], proof_from_row)
                    .optional()
                    .map_err(DbError::Sqlite)
            })
            .await?)
    }

    /// Atomic state transition contract. See `spec.md` §4.2.
    ///
    /// Returns `Ok(false)` on a lost race (no row matched `(id, from)`) —
    /// this is not an error; the caller decides whether to retry or abort.
    pub async fn transition(
        &self,
        proof_id: ProofId,
        from: ProofState,
        to: ProofState,
        tx_id: Option<Uuid>,
    ) -> Result<bool, WalletError> {
        let id_str = proof_id.0.to_string();

        Ok(self
            .store
            .transaction(move |tx| {
                let row = tx
                    .query_row(
                        "SELECT * FROM proofs WHERE id = ?1 AND state = ?2",
                        params![id_str, from.as_db_str()],
                        proof_from_row,
                    )
                    .optional()
                    .map_err(DbError::Sqlite)?;

                let Some(row) = row else {
                    return Ok(false);
                };

                let now_ts = now();

                // Stale-lock override: a PENDING row whose lock has expired
                // is recovered to UNSPENT regardless of the requested `to`.
                if from.is_pending() {
                    if let Some(locked_at) = row.locked_at {
                        if now_ts - locked_at > LOCK_TIMEOUT_SECS {
                            tx.execute(
                                "UPDATE proofs SET state = 'UNSPENT', locked_at = NULL, locked_for = NULL WHERE id = ?1",
                                params![id_str],
                            )
                            .map_err(DbError::Sqlite)?;
                            wallet_log::log_warn!("stale lock recovered for proof {}", id_str);
                            return Ok(true);
                        }
                    }
                }

                if to.is_pending() {
                    tx.execute(
                        "UPDATE proofs SET state = ?1, locked_at = ?2, locked_for = ?3 WHERE id = ?4",
                        params![
                            to.as_db_str(),
                            now_ts,
                            tx_id.map(|u| u.to_string()),
                            id_str
                        ],
                    )
                    .map_err(DbError::Sqlite)?;
                } else {
                    tx.execute(
                        "UPDATE proofs SET state = ?1, locked_at = NULL, locked_for = NULL WHERE id = ?2",
                        params![to.as_db_str(), id_str],
                    )
                    .map_err(DbError::Sqlite)?;
                }

                Ok(true)
            })
            .await?)
    }

    /// Selects UNSPENT proofs for `mint_url` summing to at least `amount`,
    /// locks them as PENDING_SEND, and returns the selection plus implied
    /// change. Selection and locking are one atomic step. See `spec.md`
    /// §4.2.
    pub async fn select_for_amount(
        &self,
        mint_url: &str,
        amount: u64,
        tx_id: Uuid,
        use_reserve: bool,
    ) -> Result<Selection, WalletError> {
        let mint_url = mint_url.to_string();

        let result = self
            .store
            .transaction(move |tx| {
                let sql = if use_reserve {
                    "SELECT * FROM proofs WHERE mint_url = ?1 AND state = 'UNSPENT' ORDER BY amount DESC, created_at ASC"
                } else {
                    "SELECT * FROM proofs WHERE mint_url = ?1 AND state = 'UNSPENT' AND is_reserve = 0 ORDER BY amount DESC, created_at ASC"
                };

                let mut stmt = tx.prepare(sql).map_err(DbError::Sqlite)?;
                let candidates: Vec<Proof> = stmt
                    .query_map(params![mint_url], proof_from_row)
                    .map_err(DbError::Sqlite)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(DbError::Sqlite)?;
                drop(stmt);

                let mut selected = Vec::new();
                let mut total: u64 = 0;
                for proof in candidates {
                    if total >= amount {
                        break;
                    }
                    total += proof.amount;
                    selected.push(proof);
                }

                if total < amount {
                    // No locks taken: return the shortfall for the caller
                    // to raise InsufficientFunds, without touching rows.
                    return Ok(Err((amount, total)));
                }

                let now_ts = now();
                for proof in &selected {
                    tx.execute(
                        "UPDATE proofs SET state = 'PENDING_SEND', locked_at = ?1, locked_for = ?2 WHERE id = ?3",
                        params![now_ts, tx_id.to_string(), proof.id.0.to_string()],
                    )
                    .map_err(DbError::Sqlite)?;
                }

                Ok(Ok(Selection {
                    change: total - amount,
                    total,
                    proofs: selected,
                }))
            })
            .await?;

        match result {
            Ok(selection) => Ok(selection),
            Err((requested, available)) => {
                Err(WalletError::InsufficientFunds { requested, available })
            }
        }
    }

    pub async fn mark_reserve(&self, ids: &[ProofId]) -> Result<(), WalletError> {
        self.set_reserve(ids, true).await
    }

    pub async fn unmark_reserve(&self, ids: &[ProofId]) -> Result<(), WalletError> {
        self.set_reserve(ids, false).await
    }

    async fn set_reserve(&self, ids: &[ProofId], reserve: bool) -> Result<(), WalletError> {
        let ids: Vec<String> = ids.iter().map(|i| i.0.to_string()).collect();
        Ok(self
            .store
            .transaction(move |tx| {
                for id in &ids {
                    tx.execute(
                        "UPDATE proofs SET is_reserve = ?1 WHERE id = ?2",
                        params![reserve as i64, id],
                    )
                    .map_err(DbError::Sqlite)?;
                }
                Ok(())
            })
            .await?)
    }

    /// Releases locks on PENDING rows whose `locked_at` has exceeded
    /// [`LOCK_TIMEOUT_SECS`], returning them to UNSPENT. Must be called at
    /// startup and periodically. See `spec.md` §4.2.
    pub async fn release_stale_locks(&self) -> Result<u64, WalletError> {
        let cutoff: Timestamp = now() - LOCK_TIMEOUT_SECS;
        let count = self
            .store
            .transaction(move |tx| {
                let affected = tx
                    .execute(
                        "UPDATE proofs SET state = 'UNSPENT', locked_at = NULL, locked_for = NULL
                         WHERE state IN ('PENDING_SEND', 'PENDING_SWAP') AND locked_at < ?1",
                        params![cutoff],
                    )
                    .map_err(DbError::Sqlite)?;
                Ok(affected as u64)
            })
            .await?;

        if count > 0 {
            wallet_log::log_warn!("released {} stale proof lock(s)", count);
        }
        Ok(count)
    }

    /// Sum of `amount` over UNSPENT proofs, never counting PENDING or
    /// SPENT. See `spec.md` §4.2.
    pub async fn total_balance(&self) -> Result<u64, WalletError> {
        Ok(self
            .store
            .transaction(|tx| {
                let v: i64 = tx
                    .query_row(
                        "SELECT COALESCE(SUM(amount), 0) FROM proofs WHERE state = 'UNSPENT'",
                        [],
                        |r| r.get(0),
                    )
                    .map_err(DbError::Sqlite)?;
                Ok(v as u64)
            })
            .await?)
    }

    pub async fn balance(&self, mint_url: &str) -> Result<u64, WalletError> {
        let mint_url = mint_url.to_string();
        Ok(self
            .store
            .transaction(move |tx| {
                let v: i64 = tx
                    .query_row(
                        "SELECT COALESCE(SUM(amount), 0) FROM proofs WHERE state = 'UNSPENT' AND mint_url = ?1",
                        params![mint_url],
                        |r| r.get(0),
                    )
                    .map_err(DbError::Sqlite)?;
                Ok(v as u64)
            })
            .await?)
    }

    pub async fn reserve_balance(&self) -> Result<u64, WalletError> {
        Ok(self
            .store
            .transaction(|tx| {
                let v: i64 = tx
                    .query_row(
                        "SELECT COALESCE(SUM(amount), 0) FROM proofs WHERE state = 'UNSPENT' AND is_reserve = 1",
                        [],
                        |r| r.get(0),
                    )
                    .map_err(DbError::Sqlite)?;
                Ok(v as u64)
            })
            .await?)
    }

    /// All proofs currently locked for `tx_id`, in any PENDING state. Used
    /// to recover the inputs of an ambiguous operation (e.g. a melt whose
    /// response was lost) by transaction id rather than by secret.
    pub async fn locked_for_tx(&self, tx_id: Uuid) -> Result<Vec<Proof>, WalletError> {
        let tx_id_str = tx_id.to_string();
        Ok(self
            .store
            .transaction(move |tx| {
                let mut stmt = tx
                    .prepare("SELECT * FROM proofs WHERE locked_for = ?1")
                    .map_err(DbError::Sqlite)?;
                let rows = stmt
                    .query_map(params![tx_id_str], proof_from_row)
                    .map_err(DbError::Sqlite)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(DbError::Sqlite)?;
                Ok(rows)
            })
            .await?)
    }

    pub async fn unspent_for_mint(&self, mint_url: &str) -> Result<Vec<Proof>, WalletError> {
        let mint_url = mint_url.to_string();
        Ok(self
            .store
            .transaction(move |tx| {
                let mut stmt = tx
                    .prepare("SELECT * FROM proofs WHERE mint_url = ?1 AND state = 'UNSPENT'")
                    .map_err(DbError::Sqlite)?;
                let rows = stmt
                    .query_map(params![mint_url], proof_from_row)
                    .map_err(DbError::Sqlite)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(DbError::Sqlite)?;
                Ok(rows)
            })
            .await?)
    }

    /// Deletes rows, but only if they are already SPENT. Deleting
    /// UNSPENT/PENDING rows is a precondition violation. See `spec.md`
    /// §4.2.
    pub async fn delete(&self, ids: &[ProofId]) -> Result<(), WalletError> {
        let ids: Vec<String> = ids.iter().map(|i| i.0.to_string()).collect();
        self.store
            .transaction(move |tx| {
                for id in &ids {
                    let state: Option<String> = tx
                        .query_row("SELECT state FROM proofs WHERE id = ?1", params![id], |r| r.get(0))
                        .optional()
                        .map_err(DbError::Sqlite)?;

                    match state.as_deref() {
                        Some("SPENT") => {
                            tx.execute("DELETE FROM proofs WHERE id = ?1", params![id])
                                .map_err(DbError::Sqlite)?;
                        }
                        Some(_) => {
                            return Err(DbError::Precondition(
                                "cannot delete a proof that is not SPENT".to_string(),
                            ));
                        }
                        None => {}
                    }
                }
                Ok(())
            })
            .await
            .map_err(|e| match e {
                DbError::Precondition(msg) => WalletError::PreconditionViolation(msg),
                other => WalletError::Db(other),
            })
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn sample(amount: u64, mint_url: &str) -> NewProof {
        NewProof {
            secret: Uuid::new_v4().to_string(),
            c: "c".to_string(),
            amount,
            mint_url: mint_url.to_string(),
            keyset_id: "ks1".to_string(),
            is_reserve: false,
            dleq: None,
        }
    }

    async fn store() -> ProofStore {
        ProofStore::new(Store::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let proofs = store().await;
        let id = proofs.insert(sample(8, "https://mint.example")).await.unwrap();
        let proof = proofs.get(id).await.unwrap().unwrap();
        assert_eq!(proof.amount, 8);
        assert_eq!(proof.state, ProofState::Unspent);
        assert!(proof.locked_at.is_none());
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_secret() {
        let proofs = store().await;
        let mut new_proof = sample(8, "https://mint.example");
        new_proof.secret = "dupe".to_string();
        proofs.insert(new_proof.clone()).await.unwrap();

        let err = proofs.insert(new_proof).await.unwrap_err();
        assert!(matches!(err, WalletError::DuplicateProof));
    }

    #[tokio::test]
    async fn transition_succeeds_from_matching_state_and_fails_otherwise() {
        let proofs = store().await;
        let id = proofs.insert(sample(8, "https://mint.example")).await.unwrap();
        let tx_id = Uuid::new_v4();

        assert!(proofs.transition(id, ProofState::Unspent, ProofState::PendingSend, Some(tx_id)).await.unwrap());
        let locked = proofs.get(id).await.unwrap().unwrap();
        assert_eq!(locked.state, ProofState::PendingSend);
        assert_eq!(locked.locked_for, Some(tx_id));
        assert!(locked.locked_at.is_some());

        // Already moved on: a second attempt from the same `from` loses the race.
        assert!(!proofs.transition(id, ProofState::Unspent, ProofState::PendingSend, Some(tx_id)).await.unwrap());

        assert!(proofs.transition(id, ProofState::PendingSend, ProofState::Spent, None).await.unwrap());
        let spent = proofs.get(id).await.unwrap().unwrap();
        assert_eq!(spent.state, ProofState::Spent);
        assert!(spent.locked_for.is_none());
        assert!(spent.locked_at.is_none());
    }

    #[tokio::test]
    async fn transition_recovers_stale_lock_to_unspent_regardless_of_requested_to() {
        let proofs = store().await;
        let id = proofs.insert(sample(8, "https://mint.example")).await.unwrap();
        let tx_id = Uuid::new_v4();
        proofs.transition(id, ProofState::Unspent, ProofState::PendingSend, Some(tx_id)).await.unwrap();

        // Simulate the lock aging out past LOCK_TIMEOUT_SECS.
        let stale_at = now() - LOCK_TIMEOUT_SECS - 1;
        let id_str = id.0.to_string();
        let store_handle = proofs.store.clone();
        store_handle
            .transaction(move |tx| {
                tx.execute("UPDATE proofs SET locked_at = ?1 WHERE id = ?2", params![stale_at, id_str])
                    .map_err(DbError::Sqlite)?;
                Ok(())
            })
            .await
            .unwrap();

        // Requesting PendingSend -> Spent, but the stale lock is recovered
        // to Unspent instead.
        assert!(proofs.transition(id, ProofState::PendingSend, ProofState::Spent, None).await.unwrap());
        let recovered = proofs.get(id).await.unwrap().unwrap();
        assert_eq!(recovered.state, ProofState::Unspent);
        assert!(recovered.locked_at.is_none());
    }

    #[tokio::test]
    async fn select_for_amount_picks_largest_first_and_locks_atomically() {
        let proofs = store().await;
        let mint_url = "https://mint.example";
        proofs.insert(sample(32, mint_url)).await.unwrap();
        proofs.insert(sample(16, mint_url)).await.unwrap();
        proofs.insert(sample(4, mint_url)).await.unwrap();

        let tx_id = Uuid::new_v4();
        let selection = proofs.select_for_amount(mint_url, 20, tx_id, false).await.unwrap();

        assert_eq!(selection.total, 32);
        assert_eq!(selection.change, 12);
        assert_eq!(selection.proofs.len(), 1);
        assert_eq!(selection.proofs[0].amount, 32);

        let remaining = proofs.unspent_for_mint(mint_url).await.unwrap();
        assert_eq!(remaining.len(), 2, "the selected proof should no longer be UNSPENT");
    }

    #[tokio::test]
    async fn select_for_amount_excludes_reserve_unless_requested() {
        let proofs = store().await;
        let mint_url = "https://mint.example";
        let mut reserve = sample(16, mint_url);
        reserve.is_reserve = true;
        let reserve_id = proofs.insert(reserve).await.unwrap();

        let err = proofs.select_for_amount(mint_url, 10, Uuid::new_v4(), false).await.unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { .. }));

        let still_unspent = proofs.get(reserve_id).await.unwrap().unwrap();
        assert_eq!(still_unspent.state, ProofState::Unspent, "a failed selection must take no locks");

        let selection = proofs.select_for_amount(mint_url, 10, Uuid::new_v4(), true).await.unwrap();
        assert_eq!(selection.proofs[0].id, reserve_id);
    }

    #[tokio::test]
    async fn select_for_amount_insufficient_funds_takes_no_locks() {
        let proofs = store().await;
        let mint_url = "https://mint.example";
        let id = proofs.insert(sample(4, mint_url)).await.unwrap();

        let err = proofs.select_for_amount(mint_url, 100, Uuid::new_v4(), false).await.unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { requested: 100, available: 4 }));

        let proof = proofs.get(id).await.unwrap().unwrap();
        assert_eq!(proof.state, ProofState::Unspent);
    }

    #[tokio::test]
    async fn release_stale_locks_only_touches_expired_pending_rows() {
        let proofs = store().await;
        let mint_url = "https://mint.example";
        let fresh_id = proofs.insert(sample(8, mint_url)).await.unwrap();
        let stale_id = proofs.insert(sample(8, mint_url)).await.unwrap();

        proofs.transition(fresh_id, ProofState::Unspent, ProofState::PendingSend, None).await.unwrap();
        proofs.transition(stale_id, ProofState::Unspent, ProofState::PendingSend, None).await.unwrap();

        let stale_at = now() - LOCK_TIMEOUT_SECS - 1;
        let stale_id_str = stale_id.0.to_string();
        proofs
            .store
            .transaction(move |tx| {
                tx.execute("UPDATE proofs SET locked_at = ?1 WHERE id = ?2", params![stale_at, stale_id_str])
                    .map_err(DbError::Sqlite)?;
                Ok(())
            })
            .await
            .unwrap();

        let released = proofs.release_stale_locks().await.unwrap();
        assert_eq!(released, 1);
        assert_eq!(proofs.get(stale_id).await.unwrap().unwrap().state, ProofState::Unspent);
        assert_eq!(proofs.get(fresh_id).await.unwrap().unwrap().state, ProofState::PendingSend);
    }

    #[tokio::test]
    async fn locked_for_tx_finds_only_that_transaction_s_proofs() {
        let proofs = store().await;
        let mint_url = "https://mint.example";
        let a = proofs.insert(sample(8, mint_url)).await.unwrap();
        let b = proofs.insert(sample(4, mint_url)).await.unwrap();
        let c = proofs.insert(sample(2, mint_url)).await.unwrap();
        let tx_a = Uuid::new_v4();
        let tx_b = Uuid::new_v4();

        proofs.transition(a, ProofState::Unspent, ProofState::PendingSend, Some(tx_a)).await.unwrap();
        proofs.transition(b, ProofState::Unspent, ProofState::PendingSend, Some(tx_a)).await.unwrap();
        proofs.transition(c, ProofState::Unspent, ProofState::PendingSend, Some(tx_b)).await.unwrap();

        let found = proofs.locked_for_tx(tx_a).await.unwrap();
        assert_eq!(found.iter().map(|p| p.id).collect::<std::collections::HashSet<_>>(), [a, b].into_iter().collect());
    }

    #[tokio::test]
    async fn delete_refuses_non_spent_rows() {
        let proofs = store().await;
        let id = proofs.insert(sample(8, "https://mint.example")).await.unwrap();

        let err = proofs.delete(&[id]).await.unwrap_err();
        assert!(matches!(err, WalletError::PreconditionViolation(_)));

        proofs.transition(id, ProofState::Unspent, ProofState::Spent, None).await.unwrap();
        proofs.delete(&[id]).await.unwrap();
        assert!(proofs.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn balances_only_count_unspent_and_respect_reserve_tag() {
        let proofs = store().await;
        let mint_url = "https://mint.example";
        proofs.insert(sample(8, mint_url)).await.unwrap();
        let mut reserve = sample(16, mint_url);
        reserve.is_reserve = true;
        proofs.insert(reserve).await.unwrap();
        let spent_id = proofs.insert(sample(4, mint_url)).await.unwrap();
        proofs.transition(spent_id, ProofState::Unspent, ProofState::Spent, None).await.unwrap();

        assert_eq!(proofs.total_balance().await.unwrap(), 24);
        assert_eq!(proofs.balance(mint_url).await.unwrap(), 24);
        assert_eq!(proofs.reserve_balance().await.unwrap(), 16);
    }
}
