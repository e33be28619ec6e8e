//! Domain types shared across the wallet core.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Seconds since the Unix epoch.
pub type Timestamp = i64;

/// Current wall-clock time, as seconds since the Unix epoch.
pub fn now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// How long a PENDING_SEND/PENDING_SWAP lock is honored before a sweep
/// reclaims it as a stale lock. See `spec.md` §4.2.
pub const LOCK_TIMEOUT_SECS: i64 = 5 * 60;

/// A proof's lifecycle state. See `spec.md` §4.2 for the transition graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProofState {
    Unspent,
    PendingSend,
    PendingSwap,
    Spent,
}

impl ProofState {
    pub fn is_pending(self) -> bool {
        matches!(self, ProofState::PendingSend | ProofState::PendingSwap)
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            ProofState::Unspent => "UNSPENT",
            ProofState::PendingSend => "PENDING_SEND",
            ProofState::PendingSwap => "PENDING_SWAP",
            ProofState::Spent => "SPENT",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "UNSPENT" => ProofState::Unspent,
            "PENDING_SEND" => ProofState::PendingSend,
            "PENDING_SWAP" => ProofState::PendingSwap,
            "SPENT" => ProofState::Spent,
            _ => return None,
        })
    }
}

impl fmt::Display for ProofState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// An opaque locally-generated proof identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProofId(pub Uuid);

impl ProofId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProofId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProofId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A bearer ecash token. Amount is required to be a positive power of two
/// in satoshis, per `spec.md` §3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub id: ProofId,
    pub secret: String,
    pub c: String,
    pub amount: u64,
    pub mint_url: String,
    pub keyset_id: String,
    pub state: ProofState,
    pub is_reserve: bool,
    pub locked_at: Option<Timestamp>,
    pub locked_for: Option<Uuid>,
    pub created_at: Timestamp,
    /// Opaque DLEQ proof bytes (hex), if the mint supplied one. The math
    /// that verifies this is out of scope (`spec.md` §1); we only carry it.
    pub dleq: Option<String>,
}

impl Proof {
    pub fn has_dleq(&self) -> bool {
        self.dleq.is_some()
    }
}

/// Trust a host places in an external mint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrustLevel {
    Untrusted = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl TrustLevel {
    pub fn is_trusted(self) -> bool {
        self >= TrustLevel::Medium
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            TrustLevel::Untrusted => "UNTRUSTED",
            TrustLevel::Low => "LOW",
            TrustLevel::Medium => "MEDIUM",
            TrustLevel::High => "HIGH",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "UNTRUSTED" => TrustLevel::Untrusted,
            "LOW" => TrustLevel::Low,
            "MEDIUM" => TrustLevel::Medium,
            "HIGH" => TrustLevel::High,
            _ => return None,
        })
    }
}

/// An external Cashu mint known to this wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mint {
    pub mint_id: Uuid,
    pub url: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub trust_level: TrustLevel,
    pub last_synced_at: Option<Timestamp>,
}

/// Normalizes a mint URL: trims whitespace and any trailing slash.
pub fn normalize_mint_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// A generation of a mint's signing keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyset {
    pub mint_id: Uuid,
    pub keyset_id: String,
    pub unit: String,
    pub active: bool,
    /// amount -> hex-encoded public key
    pub keys: std::collections::BTreeMap<u64, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    Mint,
    Send,
    Receive,
    Swap,
    Melt,
}

impl TxType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            TxType::Mint => "MINT",
            TxType::Send => "SEND",
            TxType::Receive => "RECEIVE",
            TxType::Swap => "SWAP",
            TxType::Melt => "MELT",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "MINT" => TxType::Mint,
            "SEND" => TxType::Send,
            "RECEIVE" => TxType::Receive,
            "SWAP" => TxType::Swap,
            "MELT" => TxType::Melt,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Direction::Incoming => "INCOMING",
            Direction::Outgoing => "OUTGOING",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "INCOMING" => Direction::Incoming,
            "OUTGOING" => Direction::Outgoing,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Completed,
    Failed,
}

impl TxStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            TxStatus::Pending => "PENDING",
            TxStatus::Completed => "COMPLETED",
            TxStatus::Failed => "FAILED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => TxStatus::Pending,
            "COMPLETED" => TxStatus::Completed,
            "FAILED" => TxStatus::Failed,
            _ => return None,
        })
    }
}

/// A record of a logical wallet action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub tx_type: TxType,
    pub direction: Direction,
    pub amount: u64,
    pub mint_url: String,
    pub status: TxStatus,
    pub payment_request: Option<String>,
    pub proof_count: u32,
    pub memo: Option<String>,
    pub preimage: Option<String>,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    Mint,
    Swap,
    Melt,
    Send,
    Receive,
    SyncOcr,
    SyncKeysets,
    Reconcile,
}

impl OpType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            OpType::Mint => "MINT",
            OpType::Swap => "SWAP",
            OpType::Melt => "MELT",
            OpType::Send => "SEND",
            OpType::Receive => "RECEIVE",
            OpType::SyncOcr => "SYNC_OCR",
            OpType::SyncKeysets => "SYNC_KEYSETS",
            OpType::Reconcile => "RECONCILE",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "MINT" => OpType::Mint,
            "SWAP" => OpType::Swap,
            "MELT" => OpType::Melt,
            "SEND" => OpType::Send,
            "RECEIVE" => OpType::Receive,
            "SYNC_OCR" => OpType::SyncOcr,
            "SYNC_KEYSETS" => OpType::SyncKeysets,
            "RECONCILE" => OpType::Reconcile,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            0 => Priority::Low,
            1 => Priority::Medium,
            2 => Priority::High,
            3 => Priority::Critical,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl OpStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            OpStatus::Pending => "PENDING",
            OpStatus::Processing => "PROCESSING",
            OpStatus::Completed => "COMPLETED",
            OpStatus::Failed => "FAILED",
            OpStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => OpStatus::Pending,
            "PROCESSING" => OpStatus::Processing,
            "COMPLETED" => OpStatus::Completed,
            "FAILED" => OpStatus::Failed,
            "CANCELLED" => OpStatus::Cancelled,
            _ => return None,
        })
    }
}

/// A deferred, retryable operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOp {
    pub id: Uuid,
    pub op_type: OpType,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: OpStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub scheduled_for: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Configured reserve level for the Offline Cash Reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcrLevel {
    Low,
    Medium,
    High,
}

impl OcrLevel {
    /// Target amount in sats for this level, per `spec.md` §3.
    pub fn default_target(self) -> u64 {
        match self {
            OcrLevel::Low => 10_000,
            OcrLevel::Medium => 50_000,
            OcrLevel::High => 100_000,
        }
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            OcrLevel::Low => "LOW",
            OcrLevel::Medium => "MEDIUM",
            OcrLevel::High => "HIGH",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "LOW" => OcrLevel::Low,
            "MEDIUM" => OcrLevel::Medium,
            "HIGH" => OcrLevel::High,
            _ => return None,
        })
    }
}

/// OCR singleton configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrConfig {
    pub level: OcrLevel,
    /// Overrides `level.default_target()` when set.
    pub target_override: Option<u64>,
    pub auto_refill: bool,
    /// Percent (0-100) below which the alert level becomes `critical`.
    pub alert_threshold: u8,
}

impl OcrConfig {
    pub fn target_amount(&self) -> u64 {
        self.target_override.unwrap_or(self.level.default_target())
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            level: OcrLevel::Medium,
            target_override: None,
            auto_refill: true,
            alert_threshold: 10,
        }
    }
}

/// Derived OCR health status. See `spec.md` §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcrStatus {
    Synced,
    OfflineReady,
    OutOfSync,
    Depleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertLevel {
    None,
    Low,
    Critical,
}
