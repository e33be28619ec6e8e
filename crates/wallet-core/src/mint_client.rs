//! Typed RPC surface to one mint. The Cashu protocol cryptography itself
//! (blind signatures, DLEQ) is out of scope (`spec.md` §1) — this module
//! treats the mint as a typed request/response boundary only.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MintError;

/// `GET /v1/info` response. See `spec.md` §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintInfo {
    pub name: Option<String>,
    pub pubkey: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub description_long: Option<String>,
    pub contact: Vec<(String, String)>,
    pub motd: Option<String>,
    pub icon_url: Option<String>,
}

/// `GET /v1/keys` keyset entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysetInfo {
    pub id: String,
    pub unit: String,
    pub keys: BTreeMap<u64, String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintQuoteResponse {
    pub quote: String,
    pub request: String,
    pub paid: bool,
    pub expiry: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintedProof {
    pub secret: String,
    pub c: String,
    pub amount: u64,
    pub keyset_id: String,
    pub dleq: Option<String>,
}

/// An input the wallet spends to a mint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofInput {
    pub secret: String,
    pub c: String,
    pub amount: u64,
    pub keyset_id: String,
}

/// Output amount denominations the mint should issue for a swap, in the
/// order the caller wants them back (so a caller requesting a send/change
/// split can partition the response positionally).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputsSpec {
    pub amounts: Vec<u64>,
    pub keyset_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapResponse {
    /// One minted proof per requested amount, same order as the request.
    pub proofs: Vec<MintedProof>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeltQuoteResponse {
    pub quote: String,
    pub amount: u64,
    pub fee_reserve: u64,
    pub paid: bool,
    pub expiry: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeltResponse {
    pub paid: bool,
    pub preimage: Option<String>,
    pub change: Vec<MintedProof>,
}

/// Typed wrapper around one mint URL. See `spec.md` §4.5.
#[async_trait]
pub trait MintClient: Send + Sync + std::fmt::Debug {
    fn mint_url(&self) -> &str;

    async fn get_info(&self) -> Result<MintInfo, MintError>;
    async fn get_keys(&self) -> Result<Vec<KeysetInfo>, MintError>;
    async fn get_mint_quote(&self, amount: u64) -> Result<MintQuoteResponse, MintError>;
    async fn mint(&self, amount: u64, quote: &str) -> Result<Vec<MintedProof>, MintError>;
    async fn swap(&self, inputs: Vec<ProofInput>, outputs: OutputsSpec) -> Result<SwapResponse, MintError>;
    async fn get_melt_quote(&self, invoice: &str) -> Result<MeltQuoteResponse, MintError>;
    async fn melt(&self, quote: &str, inputs: Vec<ProofInput>) -> Result<MeltResponse, MintError>;
    async fn check_spent(&self, secrets: Vec<String>) -> Result<Vec<bool>, MintError>;
}
