//! Compares local UNSPENT proofs against the mint's authoritative spent
//! set and resolves drift. See `spec.md` §4.10.

use std::collections::HashMap;

use rusqlite::params;
use uuid::Uuid;

use crate::error::{ConflictKind, DbError, WalletError};
use crate::mint_catalog::MintCatalog;
use crate::proof_store::ProofStore;
use crate::store::Store;
use crate::tx_log::TxLog;
use crate::types::{now, ProofId, ProofState, TxStatus};
use crate::wallet_core::WalletCore;

/// A single detected conflict, naming the proof it concerns.
#[derive(Debug)]
pub struct Conflict {
    pub proof_id: ProofId,
    pub kind: ConflictKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceComparison {
    pub local: u64,
    pub verified: u64,
    pub diff: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftReport {
    pub has_drift: bool,
    pub drift_pct: f64,
    pub invalid: u64,
    pub total: u64,
}

pub struct Reconciler {
    proofs: ProofStore,
    tx_log: TxLog,
    mints: MintCatalog,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(proofs: ProofStore, tx_log: TxLog, mints: MintCatalog) -> Self {
        Self { proofs, tx_log, mints }
    }

    /// Fetches all local UNSPENT proofs for `mint_url` and asks the mint
    /// which of their secrets it considers spent. A proof the mint reports
    /// spent while local state says UNSPENT is a `PROOF_STATE_MISMATCH`. A
    /// secret appearing more than once locally is a `DOUBLE_SPEND_DETECTED`
    /// — duplicate secrets should never occur given the store's unique
    /// constraint, but a conflict is raised defensively rather than
    /// assumed impossible.
    pub async fn detect_conflicts(&self, core: &WalletCore, mint_url: &str) -> Result<Vec<Conflict>, WalletError> {
        let unspent = self.proofs.unspent_for_mint(mint_url).await?;

        let mut by_secret: HashMap<&str, Vec<ProofId>> = HashMap::new();
        for proof in &unspent {
            by_secret.entry(proof.secret.as_str()).or_default().push(proof.id);
        }

        let mut conflicts = Vec::new();
        for ids in by_secret.values() {
            if ids.len() > 1 {
                for id in ids {
                    conflicts.push(Conflict {
                        proof_id: *id,
                        kind: ConflictKind::DoubleSpendDetected(id.to_string()),
                    });
                }
            }
        }

        if unspent.is_empty() {
            return Ok(conflicts);
        }

        let secrets: Vec<String> = unspent.iter().map(|p| p.secret.clone()).collect();
        let spent_flags = core.check_spent(mint_url, secrets).await?;

        for (proof, reported_spent) in unspent.iter().zip(spent_flags) {
            if reported_spent {
                conflicts.push(Conflict { proof_id: proof.id, kind: ConflictKind::ProofStateMismatch });
            }
        }

        Ok(conflicts)
    }

    /// Resolves a single conflict. `PROOF_STATE_MISMATCH` is auto-resolved
    /// (the mint is the source of truth); `DOUBLE_SPEND_DETECTED` is never
    /// auto-resolved and is returned unchanged for the caller to surface.
    pub async fn resolve(&self, conflict: Conflict) -> Result<Option<Conflict>, WalletError> {
        match conflict.kind {
            ConflictKind::ProofStateMismatch => {
                let proof = self.proofs.get(conflict.proof_id).await?;
                self.proofs.transition(conflict.proof_id, ProofState::Unspent, ProofState::Spent, None).await?;

                if let Some(proof) = proof {
                    if let Some(tx_id) = proof.locked_for {
                        self.tx_log.update_status(tx_id, TxStatus::Failed, Some(now())).await?;
                    }
                }

                Ok(None)
            }
            ConflictKind::DoubleSpendDetected(_) => Ok(Some(conflict)),
        }
    }

    /// `{local, verified, diff}` where `local` is the stored UNSPENT
    /// balance and `verified` is the portion the mint still reports
    /// unspent.
    pub async fn compare_balances(&self, core: &WalletCore, mint_url: &str) -> Result<BalanceComparison, WalletError> {
        let unspent = self.proofs.unspent_for_mint(mint_url).await?;
        let local: u64 = unspent.iter().map(|p| p.amount).sum();

        if unspent.is_empty() {
            return Ok(BalanceComparison { local: 0, verified: 0, diff: 0 });
        }

        let secrets: Vec<String> = unspent.iter().map(|p| p.secret.clone()).collect();
        let spent_flags = core.check_spent(mint_url, secrets).await?;

        let verified: u64 = unspent
            .iter()
            .zip(spent_flags)
            .filter(|(_, spent)| !spent)
            .map(|(p, _)| p.amount)
            .sum();

        Ok(BalanceComparison { local, verified, diff: local as i64 - verified as i64 })
    }

    /// `{has_drift, drift_pct, invalid, total}`: the share of local UNSPENT
    /// proofs the mint no longer considers valid. Persists the sample to
    /// `drift_samples` so trend data survives process restarts — see
    /// `SPEC_FULL.md` §11.
    pub async fn detect_drift(&self, store: &Store, core: &WalletCore, mint_url: &str) -> Result<DriftReport, WalletError> {
        let unspent = self.proofs.unspent_for_mint(mint_url).await?;
        let total = unspent.len() as u64;

        let invalid = if unspent.is_empty() {
            0
        } else {
            let secrets: Vec<String> = unspent.iter().map(|p| p.secret.clone()).collect();
            let spent_flags = core.check_spent(mint_url, secrets).await?;
            spent_flags.iter().filter(|s| **s).count() as u64
        };

        let drift_pct = if total == 0 { 0.0 } else { 100.0 * invalid as f64 / total as f64 };
        let report = DriftReport { has_drift: invalid > 0, drift_pct, invalid, total };

        self.persist_drift_sample(store, mint_url, report).await?;
        Ok(report)
    }

    async fn persist_drift_sample(&self, store: &Store, mint_url: &str, report: DriftReport) -> Result<(), WalletError> {
        let mint_url = mint_url.to_string();
        let sampled_at = now();
        store
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO drift_samples (id, mint_url, has_drift, drift_pct, invalid_count, total_count, sampled_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        Uuid::new_v4().to_string(),
                        mint_url,
                        report.has_drift as i64,
                        report.drift_pct,
                        report.invalid as i64,
                        report.total as i64,
                        sampled_at,
                    ],
                )
                .map_err(DbError::Sqlite)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub fn mints(&self) -> &MintCatalog {
        &self.mints
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
        KeysetInfo, MeltQuoteResponse, MeltResponse, MintClient, MintInfo, MintQuoteResponse, MintedProof, OutputsSpec,
        ProofInput, SwapResponse,
    };
    use crate::op_queue::OpQueue;
    use crate::testutil::FakeMintClient;
    use crate::wallet_core::WalletCore;

    /// Wraps [`FakeMintClient`] but reports every secret spent, so
    /// reconciliation has something to disagree about.
    #[derive(Debug)]
    struct AllSpentMintClient(FakeMintClient);

    #[async_trait]
    impl MintClient for AllSpentMintClient {
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
        async fn melt(&self, quote: &str, inputs: Vec<ProofInput>) -> Result<MeltResponse, MintError> {
            self.0.melt(quote, inputs).await
        }
        async fn check_spent(&self, secrets: Vec<String>) -> Result<Vec<bool>, MintError> {
            Ok(vec![true; secrets.len()])
        }
    }

    async fn core_reporting_all_spent() -> (WalletCore, Store, Reconciler, String) {
        let store = Store::open_in_memory().unwrap();
        let proofs = ProofStore::new(store.clone());
        let tx_log = TxLog::new(store.clone());
        let mints = MintCatalog::new(store.clone());
        let op_queue = OpQueue::new(store.clone());
        let mint_url = "https://mint.example".to_string();

        let factory: crate::wallet_core::MintClientFactory =
            Arc::new(|url: &str| Arc::new(AllSpentMintClient(FakeMintClient::new(url))) as Arc<dyn MintClient>);
        let core = WalletCore::new(proofs.clone(), tx_log.clone(), mints.clone(), op_queue, factory);
        let reconciler = Reconciler::new(proofs, tx_log, mints);
        (core, store, reconciler, mint_url)
    }

    #[tokio::test]
    async fn detect_conflicts_flags_proof_state_mismatch() {
        let (core, _store, reconciler, mint_url) = core_reporting_all_spent().await;
        let (tx_id, quote) = core.request_mint(&mint_url, 8).await.unwrap();
        core.complete_mint(tx_id, &mint_url, 8, &quote, false).await.unwrap();

        let conflicts = reconciler.detect_conflicts(&core, &mint_url).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert!(matches!(conflicts[0].kind, ConflictKind::ProofStateMismatch));
    }

    #[tokio::test]
    async fn resolve_proof_state_mismatch_transitions_to_spent() {
        let (core, _store, reconciler, mint_url) = core_reporting_all_spent().await;
        let (tx_id, quote) = core.request_mint(&mint_url, 8).await.unwrap();
        let minted = core.complete_mint(tx_id, &mint_url, 8, &quote, false).await.unwrap();
        let proof_id = minted[0].id;

        let conflicts = reconciler.detect_conflicts(&core, &mint_url).await.unwrap();
        let resolved = reconciler.resolve(conflicts.into_iter().next().unwrap()).await.unwrap();
        assert!(resolved.is_none());

        let proof = core.proofs().get(proof_id).await.unwrap().unwrap();
        assert_eq!(proof.state, ProofState::Spent);
    }

    #[tokio::test]
    async fn resolve_double_spend_is_surfaced_not_resolved() {
        let (_core, _store, reconciler, _mint_url) = core_reporting_all_spent().await;
        let conflict = Conflict { proof_id: ProofId::new(), kind: ConflictKind::DoubleSpendDetected("dup-secret".into()) };

        let surfaced = reconciler.resolve(conflict).await.unwrap();
        assert!(matches!(surfaced.map(|c| c.kind), Some(ConflictKind::DoubleSpendDetected(_))));
    }

    #[tokio::test]
    async fn compare_balances_reports_full_diff_when_mint_disagrees() {
        let (core, _store, reconciler, mint_url) = core_reporting_all_spent().await;
        let (tx_id, quote) = core.request_mint(&mint_url, 16).await.unwrap();
        core.complete_mint(tx_id, &mint_url, 16, &quote, false).await.unwrap();

        let comparison = reconciler.compare_balances(&core, &mint_url).await.unwrap();
        assert_eq!(comparison.local, 16);
        assert_eq!(comparison.verified, 0);
        assert_eq!(comparison.diff, 16);
    }

    #[tokio::test]
    async fn detect_drift_reports_and_persists_sample() {
        let (core, store, reconciler, mint_url) = core_reporting_all_spent().await;
        let (tx_id, quote) = core.request_mint(&mint_url, 16).await.unwrap();
        core.complete_mint(tx_id, &mint_url, 16, &quote, false).await.unwrap();

        let report = reconciler.detect_drift(&store, &core, &mint_url).await.unwrap();
        assert!(report.has_drift);
        assert_eq!(report.invalid, report.total);

        let sample_count: i64 = store
            .transaction(|tx| {
                tx.query_row("SELECT COUNT(*) FROM drift_samples", [], |r| r.get(0))
                    .map_err(DbError::Sqlite)
            })
            .await
            .unwrap();
        assert_eq!(sample_count, 1);
    }

    #[tokio::test]
    async fn compare_balances_with_no_proofs_is_zero() {
        let (core, _store, reconciler, mint_url) = core_reporting_all_spent().await;
        let comparison = reconciler.compare_balances(&core, &mint_url).await.unwrap();
        assert_eq!(comparison, BalanceComparison { local: 0, verified: 0, diff: 0 });
    }
}
