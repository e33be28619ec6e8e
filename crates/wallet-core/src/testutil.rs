//! Test-only support: an in-process stand-in for a mint, grounded in the
//! scriptable fake-wallet pattern the teacher uses for integration tests
//! without real network I/O. See `SPEC_FULL.md` §10.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::amount;
use crate::error::MintError;
use crate::mint_client::{
    KeysetInfo, MeltQuoteResponse, MeltResponse, MintClient, MintInfo, MintQuoteResponse, MintedProof, OutputsSpec,
    ProofInput, SwapResponse,
};
use crate::mint_catalog::MintCatalog;
use crate::op_queue::OpQueue;
use crate::proof_store::ProofStore;
use crate::store::Store;
use crate::tx_log::TxLog;
use crate::types::now;
use crate::wallet_core::WalletCore;

/// A mint that always succeeds: mints/swaps issue fresh (fake) proof
/// material for whatever denominations are requested, and melts always
/// report paid.
#[derive(Debug)]
pub struct FakeMintClient {
    url: String,
    counter: AtomicU64,
}

impl FakeMintClient {
    pub fn new(url: &str) -> Self {
        Self { url: url.to_string(), counter: AtomicU64::new(0) }
    }

    pub fn as_factory() -> crate::wallet_core::MintClientFactory {
        Arc::new(|url: &str| Arc::new(FakeMintClient::new(url)) as Arc<dyn MintClient>)
    }

    fn mint_for(&self, amount: u64, keyset_id: &str) -> MintedProof {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        MintedProof {
            secret: format!("secret-{n}"),
            c: format!("c-{n}"),
            amount,
            keyset_id: keyset_id.to_string(),
            dleq: None,
        }
    }
}

#[async_trait]
impl MintClient for FakeMintClient {
    fn mint_url(&self) -> &str {
        &self.url
    }

    async fn get_info(&self) -> Result<MintInfo, MintError> {
        // Forces a real suspension point so tests exercising concurrent
        // callers (e.g. SyncEngine's single-flight guard) actually
        // interleave instead of one run completing before the other starts.
        tokio::task::yield_now().await;
        Ok(MintInfo {
            name: Some("fake mint".into()),
            pubkey: None,
            version: Some("0.1".into()),
            description: None,
            description_long: None,
            contact: vec![],
            motd: None,
            icon_url: None,
        })
    }

    async fn get_keys(&self) -> Result<Vec<KeysetInfo>, MintError> {
        Ok(vec![KeysetInfo { id: "ks1".into(), unit: "sat".into(), keys: Default::default(), active: true }])
    }

    async fn get_mint_quote(&self, _amount: u64) -> Result<MintQuoteResponse, MintError> {
        Ok(MintQuoteResponse { quote: "quote1".into(), request: "lnbc1".into(), paid: false, expiry: now() + 600 })
    }

    async fn mint(&self, amount: u64, _quote: &str) -> Result<Vec<MintedProof>, MintError> {
        Ok(amount::split(amount).into_iter().map(|a| self.mint_for(a, "ks1")).collect())
    }

    async fn swap(&self, _inputs: Vec<ProofInput>, outputs: OutputsSpec) -> Result<SwapResponse, MintError> {
        let proofs = outputs.amounts.iter().map(|a| self.mint_for(*a, &outputs.keyset_id)).collect();
        Ok(SwapResponse { proofs })
    }

    async fn get_melt_quote(&self, _invoice: &str) -> Result<MeltQuoteResponse, MintError> {
        Ok(MeltQuoteResponse { quote: "melt-quote1".into(), amount: 10, fee_reserve: 1, paid: false, expiry: now() + 600 })
    }

    async fn melt(&self, _quote: &str, _inputs: Vec<ProofInput>) -> Result<MeltResponse, MintError> {
        Ok(MeltResponse { paid: true, preimage: Some("preimage".into()), change: vec![] })
    }

    async fn check_spent(&self, secrets: Vec<String>) -> Result<Vec<bool>, MintError> {
        Ok(vec![false; secrets.len()])
    }
}

/// Builds a `WalletCore` (plus its raw `Store` and a sample mint URL)
/// backed by an in-memory database and [`FakeMintClient`].
pub async fn core_with_fake_mint() -> (WalletCore, Store, MintCatalog, TxLog, String) {
    let store = Store::open_in_memory().unwrap();
    let proofs = ProofStore::new(store.clone());
    let tx_log = TxLog::new(store.clone());
    let mints = MintCatalog::new(store.clone());
    let op_queue = OpQueue::new(store.clone());
    let mint_url = "https://mint.example".to_string();

    let core = WalletCore::new(proofs, tx_log.clone(), mints.clone(), op_queue, FakeMintClient::as_factory());
    (core, store, mints, tx_log, mint_url)
}
