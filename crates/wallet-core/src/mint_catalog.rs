//! Mints and keysets: trust level, staleness tracking, and keyset sync
//! diffing. See `spec.md` §4.3.

use std::collections::{BTreeMap, HashSet};

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{DbError, WalletError};
use crate::store::Store;
use crate::types::{normalize_mint_url, now, Keyset, Mint, Timestamp, TrustLevel};

fn mint_from_row(row: &Row<'_>) -> rusqlite::Result<Mint> {
    let mint_id: String = row.get("mint_id")?;
    let trust_str: String = row.get("trust_level")?;
    Ok(Mint {
        mint_id: Uuid::parse_str(&mint_id)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        url: row.get("url")?,
        name: row.get("name")?,
        description: row.get("description")?,
        trust_level: TrustLevel::from_db_str(&trust_str).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(0, trust_str.clone(), rusqlite::types::Type::Text)
        })?,
        last_synced_at: row.get("last_synced_at")?,
    })
}

fn keyset_from_row(row: &Row<'_>) -> rusqlite::Result<Keyset> {
    let mint_id: String = row.get("mint_id")?;
    let keys_json: String = row.get("keys_json")?;
    let keys: BTreeMap<u64, String> = serde_json::from_str(&keys_json)
        .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?;
    Ok(Keyset {
        mint_id: Uuid::parse_str(&mint_id)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        keyset_id: row.get("keyset_id")?,
        unit: row.get("unit")?,
        active: row.get::<_, i64>("active")? != 0,
        keys,
    })
}

/// Summary of a keyset sync diff. See `spec.md` §4.3 and Testable
/// Property 8.
#[derive(Debug, Clone, Default)]
pub struct KeysetDiff {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub deactivated: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MintCatalog {
    store: Store,
}

impl MintCatalog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create(
        &self,
        url: &str,
        name: Option<String>,
        description: Option<String>,
        trust_level: TrustLevel,
    ) -> Result<Mint, WalletError> {
        let url = normalize_mint_url(url);
        let mint_id = Uuid::new_v4();

        let mint = Mint {
            mint_id,
            url: url.clone(),
            name,
            description,
            trust_level,
            last_synced_at: None,
        };

        let to_insert = mint.clone();
        self.store
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO mints (mint_id, url, name, description, trust_level, last_synced_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
                    params![
                        to_insert.mint_id.to_string(),
                        to_insert.url,
                        to_insert.name,
                        to_insert.description,
                        to_insert.trust_level.as_db_str(),
                    ],
                )
                .map_err(DbError::Sqlite)?;
                Ok(())
            })
            .await?;

        Ok(mint)
    }

    pub async fn get_by_url(&self, url: &str) -> Result<Option<Mint>, WalletError> {
        let url = normalize_mint_url(url);
        Ok(self
            .store
            .transaction(move |tx| {
                tx.query_row("SELECT * FROM mints WHERE url = ?1", params![url], mint_from_row)
                    .optional()
                    .map_err(DbError::Sqlite)
            })
            .await?)
    }

    pub async fn get(&self, mint_id: Uuid) -> Result<Option<Mint>, WalletError> {
        let id_str = mint_id.to_string();
        Ok(self
            .store
            .transaction(move |tx| {
                tx.query_row("SELECT * FROM mints WHERE mint_id = ?1", params![id_str], mint_from_row)
                    .optional()
                    .map_err(DbError::Sqlite)
            })
            .await?)
    }

    pub async fn update_last_synced(&self, mint_id: Uuid) -> Result<(), WalletError> {
        let id_str = mint_id.to_string();
        let ts = now();
        Ok(self
            .store
            .transaction(move |tx| {
                tx.execute(
                    "UPDATE mints SET last_synced_at = ?1 WHERE mint_id = ?2",
                    params![ts, id_str],
                )
                .map_err(DbError::Sqlite)?;
                Ok(())
            })
            .await?)
    }

    /// Mints never synced, or last synced more than `hours` ago.
    pub async fn get_stale(&self, hours: i64) -> Result<Vec<Mint>, WalletError> {
        let cutoff: Timestamp = now() - hours * 3600;
        Ok(self
            .store
            .transaction(move |tx| {
                let mut stmt = tx
                    .prepare("SELECT * FROM mints WHERE last_synced_at IS NULL OR last_synced_at < ?1")
                    .map_err(DbError::Sqlite)?;
                let rows = stmt
                    .query_map(params![cutoff], mint_from_row)
                    .map_err(DbError::Sqlite)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(DbError::Sqlite)?;
                Ok(rows)
            })
            .await?)
    }

    pub async fn get_all(&self) -> Result<Vec<Mint>, WalletError> {
        Ok(self
            .store
            .transaction(|tx| {
                let mut stmt = tx.prepare("SELECT * FROM mints").map_err(DbError::Sqlite)?;
                let rows = stmt
                    .query_map([], mint_from_row)
                    .map_err(DbError::Sqlite)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(DbError::Sqlite)?;
                Ok(rows)
            })
            .await?)
    }

    pub async fn get_trusted(&self) -> Result<Vec<Mint>, WalletError> {
        Ok(self
            .store
            .transaction(|tx| {
                let mut stmt = tx
                    .prepare("SELECT * FROM mints WHERE trust_level IN ('MEDIUM', 'HIGH')")
                    .map_err(DbError::Sqlite)?;
                let rows = stmt
                    .query_map([], mint_from_row)
                    .map_err(DbError::Sqlite)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(DbError::Sqlite)?;
                Ok(rows)
            })
            .await?)
    }

    pub async fn set_trust_level(&self, mint_id: Uuid, new_level: TrustLevel) -> Result<(), WalletError> {
        let id_str = mint_id.to_string();
        let ts = now();
        self.store
            .transaction(move |tx| {
                let old_level: String = tx
                    .query_row(
                        "SELECT trust_level FROM mints WHERE mint_id = ?1",
                        params![id_str],
                        |r| r.get(0),
                    )
                    .map_err(DbError::Sqlite)?;

                tx.execute(
                    "UPDATE mints SET trust_level = ?1 WHERE mint_id = ?2",
                    params![new_level.as_db_str(), id_str],
                )
                .map_err(DbError::Sqlite)?;

                tx.execute(
                    "INSERT INTO mint_trust_events (id, mint_id, old_level, new_level, changed_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![Uuid::new_v4().to_string(), id_str, old_level, new_level.as_db_str(), ts],
                )
                .map_err(DbError::Sqlite)?;

                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn keysets(&self, mint_id: Uuid, active: Option<bool>) -> Result<Vec<Keyset>, WalletError> {
        let id_str = mint_id.to_string();
        Ok(self
            .store
            .transaction(move |tx| {
                let rows = match active {
                    Some(a) => {
                        let mut stmt = tx
                            .prepare("SELECT * FROM mint_keysets WHERE mint_id = ?1 AND active = ?2")
                            .map_err(DbError::Sqlite)?;
                        let result = stmt
                            .query_map(params![id_str, a as i64], keyset_from_row)
                            .map_err(DbError::Sqlite)?
                            .collect::<rusqlite::Result<Vec<_>>>()
                            .map_err(DbError::Sqlite)?;
                        result
                    }
                    None => {
                        let mut stmt = tx
                            .prepare("SELECT * FROM mint_keysets WHERE mint_id = ?1")
                            .map_err(DbError::Sqlite)?;
                        let result = stmt
                            .query_map(params![id_str], keyset_from_row)
                            .map_err(DbError::Sqlite)?
                            .collect::<rusqlite::Result<Vec<_>>>()
                            .map_err(DbError::Sqlite)?;
                        result
                    }
                };
                Ok(rows)
            })
            .await?)
    }

    pub async fn upsert_keyset(&self, keyset: Keyset) -> Result<(), WalletError> {
        let keys_json = serde_json::to_string(&keyset.keys).map_err(|e| WalletError::Custom(e.to_string()))?;
        self.store
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO mint_keysets (mint_id, keyset_id, unit, active, keys_json, counter)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0)
                     ON CONFLICT(mint_id, keyset_id) DO UPDATE SET
                        unit = excluded.unit, active = excluded.active, keys_json = excluded.keys_json",
                    params![
                        keyset.mint_id.to_string(),
                        keyset.keyset_id,
                        keyset.unit,
                        keyset.active as i64,
                        keys_json,
                    ],
                )
                .map_err(DbError::Sqlite)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn deactivate_keyset(&self, mint_id: Uuid, keyset_id: &str) -> Result<(), WalletError> {
        let mint_id = mint_id.to_string();
        let keyset_id = keyset_id.to_string();
        self.store
            .transaction(move |tx| {
                tx.execute(
                    "UPDATE mint_keysets SET active = 0 WHERE mint_id = ?1 AND keyset_id = ?2",
                    params![mint_id, keyset_id],
                )
                .map_err(DbError::Sqlite)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Reconciles the mint's currently-advertised keyset list against what
    /// is stored: adds new keysets, marks the intersection active, and
    /// deactivates (never deletes) keysets the mint stopped advertising —
    /// old proofs still need those keys for validation. See `spec.md` §4.3
    /// and Testable Property 8.
    pub async fn sync_keysets(&self, mint_id: Uuid, advertised: Vec<Keyset>) -> Result<KeysetDiff, WalletError> {
        let stored = self.keysets(mint_id, None).await?;
        let stored_ids: HashSet<String> = stored.iter().map(|k| k.keyset_id.clone()).collect();
        let advertised_ids: HashSet<String> = advertised.iter().map(|k| k.keyset_id.clone()).collect();

        let mut diff = KeysetDiff::default();

        for keyset in advertised {
            if stored_ids.contains(&keyset.keyset_id) {
                diff.updated.push(keyset.keyset_id.clone());
            } else {
                diff.added.push(keyset.keyset_id.clone());
            }
            let mut keyset = keyset;
            keyset.active = true;
            self.upsert_keyset(keyset).await?;
        }

        for stale_id in stored_ids.difference(&advertised_ids) {
            self.deactivate_keyset(mint_id, stale_id).await?;
            diff.deactivated.push(stale_id.clone());
        }

        Ok(diff)
    }

    pub async fn get_keyset_counter(&self, mint_id: Uuid, keyset_id: &str) -> Result<u32, WalletError> {
        let mint_id = mint_id.to_string();
        let keyset_id = keyset_id.to_string();
        Ok(self
            .store
            .transaction(move |tx| {
                let v: i64 = tx
                    .query_row(
                        "SELECT counter FROM mint_keysets WHERE mint_id = ?1 AND keyset_id = ?2",
                        params![mint_id, keyset_id],
                        |r| r.get(0),
                    )
                    .map_err(DbError::Sqlite)?;
                Ok(v as u32)
            })
            .await?)
    }

    pub async fn increment_keyset_counter(&self, mint_id: Uuid, keyset_id: &str, by: u32) -> Result<(), WalletError> {
        let mint_id = mint_id.to_string();
        let keyset_id = keyset_id.to_string();
        self.store
            .transaction(move |tx| {
                tx.execute(
                    "UPDATE mint_keysets SET counter = counter + ?1 WHERE mint_id = ?2 AND keyset_id = ?3",
                    params![by as i64, mint_id, keyset_id],
                )
                .map_err(DbError::Sqlite)?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
