//! Error taxonomy. See `spec.md` §7.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by [`crate::mint_client::MintClient`].
#[derive(Debug, Error)]
pub enum MintError {
    #[error("network error: {0}")]
    Network(String),
    #[error("mint responded with HTTP {0}")]
    Http(u16),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),
    #[error("invalid quote")]
    InvalidQuote,
    #[error("proof already spent")]
    AlreadySpent,
}

/// A conflict surfaced by the [`crate::reconciler::Reconciler`].
#[derive(Debug, Error)]
pub enum ConflictKind {
    #[error("proof state mismatch: mint reports spent, local state is UNSPENT")]
    ProofStateMismatch,
    #[error("double spend detected for secret `{0}`")]
    DoubleSpendDetected(String),
}

/// Errors surfaced by [`crate::store::Store`].
#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration {0} failed: {1}")]
    Migration(i64, String),
    #[error("transaction function failed: {0}")]
    TransactionFailed(String),
    #[error("duplicate secret")]
    DuplicateSecret,
    #[error("precondition violated: {0}")]
    Precondition(String),
}

/// Top-level wallet core error.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: u64, available: u64 },

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("duplicate proof: secret already present")]
    DuplicateProof,

    #[error("lost race: proof {proof_id} was not in expected state")]
    LostRace { proof_id: Uuid },

    #[error(transparent)]
    Mint(#[from] MintError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("conflict: {0}")]
    Conflict(#[from] ConflictKind),

    #[error("mint not found: {0}")]
    MintNotFound(String),

    #[error("keyset not found: {0}")]
    KeysetNotFound(String),

    #[error("quote not found: {0}")]
    QuoteNotFound(String),

    #[error("transaction not found: {0}")]
    TransactionNotFound(Uuid),

    #[error("operation not found: {0}")]
    OperationNotFound(Uuid),

    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("{0}")]
    Custom(String),
}

impl From<rusqlite::Error> for WalletError {
    fn from(e: rusqlite::Error) -> Self {
        WalletError::Db(DbError::Sqlite(e))
    }
}
