//! Forward-only schema migrations, keyed by an integer `user_version`.
//!
//! Each migration is a self-contained SQL string applied inside a single
//! transaction; `user_version` is bumped atomically per step. See
//! `spec.md` §4.1 and §6.

use rusqlite::Transaction;

use crate::error::DbError;

/// A single forward migration. `version` is the schema version this
/// migration produces (i.e. migration `N` takes the db from `N-1` to `N`).
pub struct Migration {
    pub version: i64,
    pub sql: &'static str,
}

/// All migrations, in ascending order. Never edit a migration once
/// released — append a new one instead.
pub fn migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        sql: r#"
CREATE TABLE proofs (
    id          TEXT PRIMARY KEY,
    secret      TEXT NOT NULL UNIQUE,
    c           TEXT NOT NULL,
    amount      INTEGER NOT NULL CHECK (amount > 0),
    mint_url    TEXT NOT NULL,
    keyset_id   TEXT NOT NULL,
    state       TEXT NOT NULL CHECK (state IN ('UNSPENT','PENDING_SEND','PENDING_SWAP','SPENT')),
    is_reserve  INTEGER NOT NULL DEFAULT 0,
    locked_at   INTEGER,
    locked_for  TEXT,
    created_at  INTEGER NOT NULL,
    dleq        TEXT
);
CREATE INDEX idx_proofs_mint_state ON proofs(mint_url, state);
CREATE INDEX idx_proofs_reserve_state ON proofs(is_reserve, state);
CREATE INDEX idx_proofs_locked_for ON proofs(locked_for);

CREATE TABLE mints (
    mint_id         TEXT PRIMARY KEY,
    url             TEXT NOT NULL UNIQUE,
    name            TEXT,
    description     TEXT,
    trust_level     TEXT NOT NULL CHECK (trust_level IN ('UNTRUSTED','LOW','MEDIUM','HIGH')),
    last_synced_at  INTEGER
);
CREATE INDEX idx_mints_last_synced ON mints(last_synced_at);

CREATE TABLE mint_trust_events (
    id          TEXT PRIMARY KEY,
    mint_id     TEXT NOT NULL REFERENCES mints(mint_id) ON DELETE CASCADE,
    old_level   TEXT NOT NULL,
    new_level   TEXT NOT NULL,
    changed_at  INTEGER NOT NULL
);

CREATE TABLE mint_keysets (
    mint_id     TEXT NOT NULL REFERENCES mints(mint_id) ON DELETE CASCADE,
    keyset_id   TEXT NOT NULL,
    unit        TEXT NOT NULL,
    active      INTEGER NOT NULL,
    keys_json   TEXT NOT NULL,
    counter     INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (mint_id, keyset_id)
);
CREATE INDEX idx_keysets_active ON mint_keysets(mint_id, active);

CREATE TABLE transactions (
    id                  TEXT PRIMARY KEY,
    tx_type             TEXT NOT NULL,
    direction           TEXT NOT NULL,
    amount              INTEGER NOT NULL,
    mint_url            TEXT NOT NULL,
    status              TEXT NOT NULL CHECK (status IN ('PENDING','COMPLETED','FAILED')),
    payment_request     TEXT,
    proof_count         INTEGER NOT NULL DEFAULT 0,
    memo                TEXT,
    preimage            TEXT,
    created_at          INTEGER NOT NULL,
    completed_at        INTEGER
);
CREATE INDEX idx_tx_status ON transactions(status);
CREATE INDEX idx_tx_mint ON transactions(mint_url);
CREATE INDEX idx_tx_created ON transactions(created_at);

CREATE TABLE operation_queue (
    id              TEXT PRIMARY KEY,
    op_type         TEXT NOT NULL,
    payload         TEXT NOT NULL,
    priority        INTEGER NOT NULL,
    status          TEXT NOT NULL CHECK (status IN ('PENDING','PROCESSING','COMPLETED','FAILED','CANCELLED')),
    retry_count     INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL,
    last_error      TEXT,
    scheduled_for   INTEGER,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);
CREATE INDEX idx_opq_dequeue ON operation_queue(status, priority DESC, created_at ASC);
CREATE INDEX idx_opq_scheduled ON operation_queue(scheduled_for) WHERE scheduled_for IS NOT NULL;

CREATE TABLE ocr_config (
    id                  INTEGER PRIMARY KEY CHECK (id = 1),
    level               TEXT NOT NULL,
    target_override     INTEGER,
    auto_refill         INTEGER NOT NULL,
    alert_threshold     INTEGER NOT NULL
);

CREATE TABLE drift_samples (
    id              TEXT PRIMARY KEY,
    mint_url        TEXT NOT NULL,
    has_drift       INTEGER NOT NULL,
    drift_pct       REAL NOT NULL,
    invalid_count   INTEGER NOT NULL,
    total_count     INTEGER NOT NULL,
    sampled_at      INTEGER NOT NULL
);
CREATE INDEX idx_drift_mint ON drift_samples(mint_url, sampled_at);
"#,
    }]
}

/// Applies every migration with `version > current_version`, each inside
/// its own transaction, bumping `user_version` as it goes.
pub fn run(conn: &mut rusqlite::Connection) -> Result<(), DbError> {
    let current_version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for migration in migrations() {
        if migration.version <= current_version {
            continue;
        }

        let tx: Transaction = conn.transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|e| DbError::Migration(migration.version, e.to_string()))?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;

        wallet_log::log_info!("applied migration {}", migration.version);
    }

    Ok(())
}
