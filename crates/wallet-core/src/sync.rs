//! Network-gated, priority-ordered reconciliation pipeline. See
//! `spec.md` §4.9.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use crate::mint_catalog::MintCatalog;
use crate::ocr::OcrManager;
use crate::tx_log::TxLog;
use crate::types::{now, Timestamp, TxStatus};
use crate::wallet_core::WalletCore;

/// Connectivity snapshot, produced by a host-supplied network monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    pub connected: bool,
    pub is_wifi: bool,
    pub is_metered: bool,
    pub timestamp: Timestamp,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self { connected: false, is_wifi: false, is_metered: false, timestamp: 0 }
    }
}

/// Which pipeline stages [`SyncEngine::sync_now`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPriorities {
    pub transactions: bool,
    pub ocr: bool,
    pub keysets: bool,
    pub metadata: bool,
}

impl Default for SyncPriorities {
    fn default() -> Self {
        Self { transactions: true, ocr: true, keysets: true, metadata: true }
    }
}

/// Mutable-at-runtime sync policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    pub auto_sync: bool,
    pub wifi_only: bool,
    pub interval_minutes: u32,
    pub background_sync: bool,
    pub priorities: SyncPriorities,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            auto_sync: true,
            wifi_only: false,
            interval_minutes: 15,
            background_sync: true,
            priorities: SyncPriorities::default(),
        }
    }
}

impl Strategy {
    /// Clamps `interval_minutes` to the spec-mandated floor of 5.
    pub fn with_interval_minutes(mut self, minutes: u32) -> Self {
        self.interval_minutes = minutes.max(5);
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncCounts {
    pub tx: u32,
    pub ocr: u32,
    pub keysets: u32,
    pub metadata: u32,
}

#[derive(Debug, Clone)]
pub struct SyncResult {
    pub ok: bool,
    pub timestamp: Timestamp,
    pub counts: SyncCounts,
    pub errors: Vec<String>,
}

/// How long a PENDING transaction may sit with no resolution before the
/// transactions priority gives up on it. See `spec.md` §4.9.
const PENDING_TX_MAX_AGE_SECS: i64 = 3600;
/// How stale a mint's keysets may be before the keysets priority refreshes
/// them. See `spec.md` §4.9.
const KEYSET_STALE_HOURS: i64 = 24;

/// Single-flight, priority-pipelined sync orchestrator. Holds only policy
/// and connectivity state; the components it drives (`WalletCore`,
/// `OcrManager`, `MintCatalog`, `TxLog`) are passed into `sync_now` so this
/// type has no ownership cycle with them.
pub struct SyncEngine {
    strategy: Mutex<Strategy>,
    network: Mutex<NetworkState>,
    in_progress: AtomicBool,
    last_sync_at: Mutex<Option<Timestamp>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine").finish_non_exhaustive()
    }
}

/// Flips `in_progress` back to `false` on any exit path from `sync_now`,
/// including an early return or a panic unwind.
struct InProgressGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy: Mutex::new(strategy),
            network: Mutex::new(NetworkState::default()),
            in_progress: AtomicBool::new(false),
            last_sync_at: Mutex::new(None),
        }
    }

    pub async fn strategy(&self) -> Strategy {
        *self.strategy.lock().await
    }

    pub async fn set_strategy(&self, strategy: Strategy) {
        *self.strategy.lock().await = strategy;
    }

    /// Updates the tracked network state. Returns `true` if this update is
    /// an offline→online transition — the caller should invoke
    /// [`Self::sync_now`] if `strategy.auto_sync` is set.
    pub async fn on_network_state_changed(&self, new_state: NetworkState) -> bool {
        let mut guard = self.network.lock().await;
        let was_connected = guard.connected;
        *guard = new_state;
        !was_connected && new_state.connected
    }

    /// `connected ∧ (¬wifi_only ∨ is_wifi) ∧ ¬in_progress`.
    pub async fn can_sync(&self) -> bool {
        let strategy = self.strategy().await;
        let network = *self.network.lock().await;
        network.connected && (!strategy.wifi_only || network.is_wifi) && !self.in_progress.load(Ordering::SeqCst)
    }

    /// Whether the periodic timer trigger should fire, given the last
    /// successful sync timestamp.
    pub async fn periodic_due(&self, current_time: Timestamp) -> bool {
        let strategy = self.strategy().await;
        let last = *self.last_sync_at.lock().await;
        match last {
            None => true,
            Some(last) => current_time - last >= strategy.interval_minutes as i64 * 60,
        }
    }

    /// Manual trigger: bypasses `wifi_only`/interval gating but not the
    /// in-progress guard inside [`Self::sync_now`].
    pub async fn force_sync_now(
        &self,
        core: &WalletCore,
        ocr: &OcrManager,
        mints: &MintCatalog,
        tx_log: &TxLog,
    ) -> SyncResult {
        self.sync_now(core, ocr, mints, tx_log).await
    }

    /// Runs the priority pipeline under a single-flight guard. Already
    /// running → returns immediately with `ok=false` and an explanatory
    /// error, without touching any priority.
    pub async fn sync_now(&self, core: &WalletCore, ocr: &OcrManager, mints: &MintCatalog, tx_log: &TxLog) -> SyncResult {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return SyncResult {
                ok: false,
                timestamp: now(),
                counts: SyncCounts::default(),
                errors: vec!["sync already in progress".to_string()],
            };
        }
        let _guard = InProgressGuard { flag: &self.in_progress };

        let priorities = self.strategy().await.priorities;
        let mut counts = SyncCounts::default();
        let mut errors = Vec::new();

        if priorities.transactions {
            match self.run_transactions_priority(core, tx_log).await {
                Ok(n) => counts.tx = n,
                Err(e) => errors.push(format!("transactions: {e}")),
            }
        }

        if priorities.ocr {
            match self.run_ocr_priority(core, ocr, mints).await {
                Ok(n) => counts.ocr = n,
                Err(e) => errors.push(format!("ocr: {e}")),
            }
        }

        if priorities.keysets {
            match self.run_keysets_priority(core, mints).await {
                Ok(n) => counts.keysets = n,
                Err(e) => errors.push(format!("keysets: {e}")),
            }
        }

        if priorities.metadata {
            match self.run_metadata_priority(core, mints).await {
                Ok(n) => counts.metadata = n,
                Err(e) => errors.push(format!("metadata: {e}")),
            }
        }

        let timestamp = now();
        *self.last_sync_at.lock().await = Some(timestamp);

        SyncResult { ok: errors.is_empty(), timestamp, counts, errors }
    }

    /// Drives pending transactions toward a resolution. A PENDING melt
    /// left ambiguous by a prior network failure is retried via
    /// `WalletCore::resolve_ambiguous_melt` (`spec.md` §8 scenario S7).
    /// Anything still unresolved past [`PENDING_TX_MAX_AGE_SECS`] is
    /// aged out as FAILED.
    async fn run_transactions_priority(&self, core: &WalletCore, tx_log: &TxLog) -> Result<u32, crate::error::WalletError> {
        let pending = tx_log.get_pending().await?;
        let cutoff = now() - PENDING_TX_MAX_AGE_SECS;
        let mut processed = 0;

        for tx in pending {
            if tx.tx_type == crate::types::TxType::Melt && core.resolve_ambiguous_melt(tx.id).await? {
                processed += 1;
                continue;
            }
            if tx.created_at < cutoff {
                tx_log.update_status(tx.id, TxStatus::Failed, Some(now())).await?;
                processed += 1;
            }
        }

        Ok(processed)
    }

    async fn run_ocr_priority(
        &self,
        core: &WalletCore,
        ocr: &OcrManager,
        mints: &MintCatalog,
    ) -> Result<u32, crate::error::WalletError> {
        let trusted = mints.get_trusted().await?;
        let mut refilled = 0;

        for mint in trusted {
            if ocr.refill_if_needed(core, &mint.url).await?.is_some() {
                refilled += 1;
            }
        }

        Ok(refilled)
    }

    async fn run_keysets_priority(&self, core: &WalletCore, mints: &MintCatalog) -> Result<u32, crate::error::WalletError> {
        let stale = mints.get_stale(KEYSET_STALE_HOURS).await?;
        let mut synced = 0;

        for mint in stale {
            core.refresh_keysets(mint.mint_id, &mint.url).await?;
            mints.update_last_synced(mint.mint_id).await?;
            synced += 1;
        }

        Ok(synced)
    }

    /// Refreshes mint info for every known mint; a single mint's failure
    /// is swallowed so the rest still refresh. See `spec.md` §4.9.
    async fn run_metadata_priority(&self, core: &WalletCore, mints: &MintCatalog) -> Result<u32, crate::error::WalletError> {
        let all = mints.get_all().await?;
        let mut refreshed = 0;

        for mint in all {
            if core.refresh_mint_info(&mint.url).await.is_ok() {
                refreshed += 1;
            }
        }

        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::error::MintError;
    use crate::mint_catalog::MintCatalog;
    use crate::mint_client::{
        KeysetInfo, MeltQuoteResponse, MeltResponse, MintClient, MintInfo, MintQuoteResponse, MintedProof,
        OutputsSpec, ProofInput, SwapResponse,
    };
    use crate::ocr::OcrManager;
    use crate::op_queue::OpQueue;
    use crate::proof_store::ProofStore;
    use crate::store::Store;
    use crate::testutil::{core_with_fake_mint, FakeMintClient};
    use crate::tx_log::TxLog;
    use crate::types::{OcrConfig, TrustLevel};
    use crate::wallet_core::MintClientFactory;

    /// A mint whose `melt` always drops the connection but whose
    /// `check_spent` confirms it paid anyway, so the transactions priority
    /// has something ambiguous to resolve.
    #[derive(Debug)]
    struct AmbiguousMeltMintClient(FakeMintClient);

    #[async_trait]
    impl MintClient for AmbiguousMeltMintClient {
        fn mint_url(&self) -> &str {
            self.0.mint_url()
        }
        async fn get_info(&self) -> Result<MintInfo, MintError> {
            self.0.get_info().await
        }
        async fn get_keys(&self) -> Result<Vec<KeysetInfo>, MintError> {
            self.0.get_keys().await
        }
        async fn get_mint_quote(&self, amount: u64) -> Result<MintQuoteResponse, MintError> {
            self.0.get_mint_quote(amount).await
        }
        async fn mint(&self, amount: u64, quote: &str) -> Result<Vec<MintedProof>, MintError> {
            self.0.mint(amount, quote).await
        }
        async fn swap(&self, inputs: Vec<ProofInput>, outputs: OutputsSpec) -> Result<SwapResponse, MintError> {
            self.0.swap(inputs, outputs).await
        }
        async fn get_melt_quote(&self, invoice: &str) -> Result<MeltQuoteResponse, MintError> {
            self.0.get_melt_quote(invoice).await
        }
        async fn melt(&self, _quote: &str, _inputs: Vec<ProofInput>) -> Result<MeltResponse, MintError> {
            Err(MintError::Network("connection reset".to_string()))
        }
        async fn check_spent(&self, secrets: Vec<String>) -> Result<Vec<bool>, MintError> {
            Ok(vec![true; secrets.len()])
        }
    }

    /// A mint whose `get_keys` always fails, so the keysets priority has
    /// something to fail on while the rest of the pipeline succeeds.
    #[derive(Debug)]
    struct FlakyKeysMintClient(FakeMintClient);

    #[async_trait]
    impl MintClient for FlakyKeysMintClient {
        fn mint_url(&self) -> &str {
            self.0.mint_url()
        }
        async fn get_info(&self) -> Result<MintInfo, MintError> {
            self.0.get_info().await
        }
        async fn get_keys(&self) -> Result<Vec<KeysetInfo>, MintError> {
            Err(MintError::Network("connection reset".to_string()))
        }
        async fn get_mint_quote(&self, amount: u64) -> Result<MintQuoteResponse, MintError> {
            self.0.get_mint_quote(amount).await
        }
        async fn mint(&self, amount: u64, quote: &str) -> Result<Vec<MintedProof>, MintError> {
            self.0.mint(amount, quote).await
        }
        async fn swap(&self, inputs: Vec<ProofInput>, outputs: OutputsSpec) -> Result<SwapResponse, MintError> {
            self.0.swap(inputs, outputs).await
        }
        async fn get_melt_quote(&self, invoice: &str) -> Result<MeltQuoteResponse, MintError> {
            self.0.get_melt_quote(invoice).await
        }
        async fn melt(&self, quote: &str, inputs: Vec<ProofInput>) -> Result<MeltResponse, MintError> {
            self.0.melt(quote, inputs).await
        }
        async fn check_spent(&self, secrets: Vec<String>) -> Result<Vec<bool>, MintError> {
            self.0.check_spent(secrets).await
        }
    }

    #[tokio::test]
    async fn sync_now_isolates_a_failing_priority_from_the_rest_of_the_pipeline() {
        let store = Store::open_in_memory().unwrap();
        let proofs = ProofStore::new(store.clone());
        let tx_log = TxLog::new(store.clone());
        let mints = MintCatalog::new(store.clone());
        let op_queue = OpQueue::new(store.clone());
        let mint_url = "https://mint.example".to_string();

        let factory: MintClientFactory =
            Arc::new(|url: &str| Arc::new(FlakyKeysMintClient(FakeMintClient::new(url))) as Arc<dyn MintClient>);
        let core = WalletCore::new(proofs, tx_log.clone(), mints.clone(), op_queue, factory);
        let ocr = OcrManager::new(store, core.proofs().clone(), OcrConfig::default());
        ocr.load().await.unwrap();
        mints.create(&mint_url, None, None, TrustLevel::High).await.unwrap();

        let target = OcrConfig::default().target_amount();
        let (tx_id, quote) = core.request_mint(&mint_url, target * 2).await.unwrap();
        core.complete_mint(tx_id, &mint_url, target * 2, &quote, false).await.unwrap();

        let engine = SyncEngine::new(Strategy::default());
        let result = engine.sync_now(&core, &ocr, &mints, &tx_log).await;

        assert!(!result.ok);
        assert_eq!(result.errors.len(), 1, "only the keysets priority should have failed: {:?}", result.errors);
        assert!(result.errors[0].starts_with("keysets:"));
        assert_eq!(result.counts.keysets, 0);
        // The priorities after the failing one still ran to completion.
        assert_eq!(result.counts.ocr, 1, "ocr runs before keysets and is unaffected");
        assert_eq!(result.counts.metadata, 1, "metadata runs after the failing keysets priority but still ran");
    }

    #[tokio::test]
    async fn can_sync_reflects_connectivity_and_wifi_policy() {
        let engine = SyncEngine::new(Strategy::default());
        assert!(!engine.can_sync().await);

        engine
            .on_network_state_changed(NetworkState { connected: true, is_wifi: false, is_metered: false, timestamp: now() })
            .await;
        assert!(engine.can_sync().await);

        let mut strategy = engine.strategy().await;
        strategy.wifi_only = true;
        engine.set_strategy(strategy).await;
        assert!(!engine.can_sync().await);

        engine
            .on_network_state_changed(NetworkState { connected: true, is_wifi: true, is_metered: false, timestamp: now() })
            .await;
        assert!(engine.can_sync().await);
    }

    #[tokio::test]
    async fn on_network_state_changed_reports_offline_to_online_transition() {
        let engine = SyncEngine::new(Strategy::default());
        let connected = NetworkState { connected: true, is_wifi: true, is_metered: false, timestamp: now() };

        assert!(engine.on_network_state_changed(connected).await);
        assert!(!engine.on_network_state_changed(connected).await);

        let disconnected = NetworkState { connected: false, ..connected };
        assert!(!engine.on_network_state_changed(disconnected).await);
        assert!(engine.on_network_state_changed(connected).await);
    }

    #[tokio::test]
    async fn periodic_due_until_first_sync() {
        let engine = SyncEngine::new(Strategy::default().with_interval_minutes(5));
        assert!(engine.periodic_due(now()).await);
    }

    async fn wired() -> (WalletCore, OcrManager, MintCatalog, TxLog, String) {
        let (core, store, mints, tx_log, mint_url) = core_with_fake_mint().await;
        let ocr = OcrManager::new(store, core.proofs().clone(), OcrConfig::default());
        ocr.load().await.unwrap();
        (core, ocr, mints, tx_log, mint_url)
    }

    async fn wired_with_ambiguous_melt() -> (WalletCore, OcrManager, MintCatalog, TxLog, String) {
        let store = Store::open_in_memory().unwrap();
        let proofs = ProofStore::new(store.clone());
        let tx_log = TxLog::new(store.clone());
        let mints = MintCatalog::new(store.clone());
        let op_queue = OpQueue::new(store.clone());
        let mint_url = "https://mint.example".to_string();

        let factory: MintClientFactory =
            Arc::new(|url: &str| Arc::new(AmbiguousMeltMintClient(FakeMintClient::new(url))) as Arc<dyn MintClient>);
        let core = WalletCore::new(proofs, tx_log.clone(), mints.clone(), op_queue, factory);
        let ocr = OcrManager::new(store, core.proofs().clone(), OcrConfig::default());
        ocr.load().await.unwrap();
        (core, ocr, mints, tx_log, mint_url)
    }

    #[tokio::test]
    async fn sync_now_transactions_priority_resolves_ambiguous_melt() {
        let (core, ocr, mints, tx_log, mint_url) = wired_with_ambiguous_melt().await;
        let (tx_id, quote) = core.request_mint(&mint_url, 16).await.unwrap();
        core.complete_mint(tx_id, &mint_url, 16, &quote, false).await.unwrap();

        let melt = core.melt(&mint_url, "lnbc-invoice").await.unwrap();
        assert!(!melt.paid, "the network failure leaves the melt ambiguous");
        assert_eq!(tx_log.get(melt.tx_id).await.unwrap().unwrap().status, crate::types::TxStatus::Pending);

        let engine = SyncEngine::new(Strategy::default());
        let result = engine.sync_now(&core, &ocr, &mints, &tx_log).await;

        assert_eq!(result.counts.tx, 1, "the transactions priority should resolve the ambiguous melt");
        let resolved = tx_log.get(melt.tx_id).await.unwrap().unwrap();
        assert_eq!(resolved.status, crate::types::TxStatus::Completed);
        assert_eq!(core.proofs().total_balance().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sync_now_runs_full_pipeline_successfully() {
        let (core, ocr, mints, tx_log, mint_url) = wired().await;
        mints.create(&mint_url, None, None, TrustLevel::High).await.unwrap();

        let target = OcrConfig::default().target_amount();
        let (tx_id, quote) = core.request_mint(&mint_url, target * 2).await.unwrap();
        core.complete_mint(tx_id, &mint_url, target * 2, &quote, false).await.unwrap();

        let engine = SyncEngine::new(Strategy::default());
        let result = engine.sync_now(&core, &ocr, &mints, &tx_log).await;

        assert!(result.ok, "unexpected errors: {:?}", result.errors);
        assert_eq!(result.counts.ocr, 1);
        assert_eq!(result.counts.keysets, 1);
        assert_eq!(result.counts.metadata, 1);
        assert_eq!(result.counts.tx, 0);
    }

    #[tokio::test]
    async fn sync_now_leaves_fresh_pending_transactions_untouched() {
        let (core, ocr, mints, tx_log, mint_url) = wired().await;
        let (tx_id, _quote) = core.request_mint(&mint_url, 100).await.unwrap();

        let pending = tx_log.get(tx_id).await.unwrap().unwrap();
        assert_eq!(pending.status, crate::types::TxStatus::Pending);

        let engine = SyncEngine::new(Strategy::default());
        let _ = engine.sync_now(&core, &ocr, &mints, &tx_log).await;

        let still_pending = tx_log.get(tx_id).await.unwrap().unwrap();
        assert_eq!(still_pending.status, crate::types::TxStatus::Pending);
    }

    #[tokio::test]
    async fn sync_now_single_flight_guard_rejects_concurrent_call() {
        let (core, ocr, mints, tx_log, mint_url) = wired().await;
        // A registered mint guarantees the metadata priority actually calls
        // out to the fake client, which yields, giving the concurrent call
        // below a chance to observe the in-progress guard.
        mints.create(&mint_url, None, None, TrustLevel::High).await.unwrap();
        let engine = SyncEngine::new(Strategy::default());

        let (a, b) = tokio::join!(
            engine.sync_now(&core, &ocr, &mints, &tx_log),
            engine.sync_now(&core, &ocr, &mints, &tx_log)
        );

        let rejected = [&a, &b]
            .into_iter()
            .filter(|r| r.errors.iter().any(|e| e.contains("already in progress")))
            .count();
        assert_eq!(rejected, 1, "exactly one of the two concurrent calls should be rejected: {a:?} {b:?}");
    }

    #[tokio::test]
    async fn force_sync_now_bypasses_periodic_gating() {
        let (core, ocr, mints, tx_log, _mint_url) = wired().await;
        let engine = SyncEngine::new(Strategy::default());

        let result = engine.force_sync_now(&core, &ocr, &mints, &tx_log).await;
        assert!(result.ok || !result.errors.is_empty());
        assert!(engine.strategy().await.auto_sync);
    }
}
