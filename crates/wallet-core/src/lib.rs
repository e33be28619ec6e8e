//! Offline-first Cashu wallet core: durable proof/mint/transaction
//! storage, mint RPC plumbing, and the orchestration, reserve-management,
//! sync, and reconciliation layers built on top of it.
//!
//! Nothing in this crate talks to a Lightning node, renders UI, stores
//! keys, or implements Cashu protocol cryptography — see `spec.md` §1.

pub mod amount;
pub mod error;
pub mod mint_catalog;
pub mod mint_client;
pub mod ocr;
pub mod op_queue;
pub mod proof_store;
pub mod reconciler;
pub mod store;
pub mod sync;
/// In-process fake mint used by this crate's own unit tests and, via the
/// `test-util` feature, by the integration suite under `tests/`.
#[cfg(any(test, feature = "test-util"))]
pub mod testutil;
pub mod token;
pub mod tx_log;
pub mod types;
pub mod wallet_core;

pub use error::WalletError;
pub use store::Store;
pub use types::{OcrConfig, Proof, ProofId, ProofState};
pub use wallet_core::WalletCore;

/// Host-supplied configuration for a wallet instance. Constructed
/// explicitly and threaded through to every component — no globals or
/// singletons, per `spec.md` §9's "Singleton managers → explicit
/// dependency injection" redesign flag.
#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// Path to the SQLite database file, or `:memory:` for an ephemeral
    /// store.
    pub db_path: String,
    pub ocr: OcrConfig,
    pub sync: sync::Strategy,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            db_path: "wallet.db".to_string(),
            ocr: OcrConfig::default(),
            sync: sync::Strategy::default(),
        }
    }
}

/// Opens (or creates) a [`Store`] at `config.db_path` and builds every
/// component against it. Returns the individual components rather than a
/// single facade, so a host can compose them (e.g. wrap `WalletCore` in
/// its own command dispatcher) without this crate prescribing that shape.
pub struct Wallet {
    pub store: Store,
    pub core: WalletCore,
    pub ocr: ocr::OcrManager,
    pub sync: sync::SyncEngine,
    pub reconciler: reconciler::Reconciler,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet").finish_non_exhaustive()
    }
}

impl Wallet {
    pub fn open(config: &WalletConfig, client_factory: wallet_core::MintClientFactory) -> Result<Self, WalletError> {
        let store = if config.db_path == ":memory:" {
            Store::open_in_memory()?
        } else {
            Store::open(&config.db_path)?
        };

        let proofs = proof_store::ProofStore::new(store.clone());
        let tx_log = tx_log::TxLog::new(store.clone());
        let mints = mint_catalog::MintCatalog::new(store.clone());
        let op_queue = op_queue::OpQueue::new(store.clone());

        let core = WalletCore::new(proofs.clone(), tx_log.clone(), mints.clone(), op_queue.clone(), client_factory);
        let ocr = ocr::OcrManager::new(store.clone(), proofs.clone(), config.ocr.clone());
        let sync = sync::SyncEngine::new(config.sync.clone());
        let reconciler = reconciler::Reconciler::new(proofs, tx_log, mints);

        Ok(Self { store, core, ocr, sync, reconciler })
    }
}
