//! Offline Cash Reserve management: a configured target of UNSPENT
//! proofs tagged `is_reserve` and excluded from default coin selection, so
//! the wallet always has spendable ecash on hand even without network
//! access. See `spec.md` §4.7.

use rusqlite::{params, OptionalExtension};

use crate::error::{DbError, WalletError};
use crate::proof_store::ProofStore;
use crate::store::Store;
use crate::types::{AlertLevel, OcrConfig, OcrLevel, OcrStatus, Proof};
use crate::wallet_core::WalletCore;

/// Derived health snapshot. See `spec.md` §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OcrSnapshot {
    pub current: u64,
    pub target: u64,
    pub pct: u32,
    pub status: OcrStatus,
    pub needs_refill: bool,
    pub alert_level: AlertLevel,
}

/// A patch applied by [`OcrManager::set_config`]; `None` fields leave the
/// existing value untouched.
#[derive(Debug, Clone, Default)]
pub struct OcrConfigPatch {
    pub level: Option<OcrLevel>,
    pub target_override: Option<Option<u64>>,
    pub auto_refill: Option<bool>,
    pub alert_threshold: Option<u8>,
}

/// A recommendation surfaced by [`OcrManager::health_check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OcrWarning {
    Depleted,
    OutOfSync,
    BelowAlertThreshold,
    TargetExceedsHalfOfBalance,
}

/// Owns the OCR singleton configuration row and reserve-aware operations.
/// The in-memory copy of [`OcrConfig`] is kept current with the persisted
/// row — writers always go through [`Self::set_config`], per `spec.md` §5
/// "Shared resources".
pub struct OcrManager {
    store: Store,
    proofs: ProofStore,
    config: tokio::sync::Mutex<OcrConfig>,
}

impl std::fmt::Debug for OcrManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcrManager").finish_non_exhaustive()
    }
}

impl OcrManager {
    pub fn new(store: Store, proofs: ProofStore, initial: OcrConfig) -> Self {
        Self { store, proofs, config: tokio::sync::Mutex::new(initial) }
    }

    /// Loads the persisted config row, seeding it from the in-memory copy
    /// if the singleton row is absent, and refreshes the in-memory copy.
    pub async fn load(&self) -> Result<OcrConfig, WalletError> {
        let loaded = self
            .store
            .transaction(|tx| {
                let row = tx
                    .query_row(
                        "SELECT level, target_override, auto_refill, alert_threshold FROM ocr_config WHERE id = 1",
                        [],
                        |r| {
                            let level: String = r.get(0)?;
                            let target_override: Option<i64> = r.get(1)?;
                            let auto_refill: i64 = r.get(2)?;
                            let alert_threshold: i64 = r.get(3)?;
                            Ok((level, target_override, auto_refill, alert_threshold))
                        },
                    )
                    .optional()
                    .map_err(DbError::Sqlite)?;

                Ok(row)
            })
            .await?;

        let config = match loaded {
            Some((level, target_override, auto_refill, alert_threshold)) => OcrConfig {
                level: OcrLevel::from_db_str(&level).unwrap_or(OcrLevel::Medium),
                target_override: target_override.map(|v| v as u64),
                auto_refill: auto_refill != 0,
                alert_threshold: alert_threshold as u8,
            },
            None => {
                let seed = self.config.lock().await.clone();
                self.persist(&seed).await?;
                seed
            }
        };

        *self.config.lock().await = config.clone();
        Ok(config)
    }

    async fn persist(&self, config: &OcrConfig) -> Result<(), WalletError> {
        let config = config.clone();
        self.store
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO ocr_config (id, level, target_override, auto_refill, alert_threshold)
                     VALUES (1, ?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                        level = excluded.level,
                        target_override = excluded.target_override,
                        auto_refill = excluded.auto_refill,
                        alert_threshold = excluded.alert_threshold",
                    params![
                        config.level.as_db_str(),
                        config.target_override.map(|v| v as i64),
                        config.auto_refill as i64,
                        config.alert_threshold as i64,
                    ],
                )
                .map_err(DbError::Sqlite)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Merges `patch` into the persisted config, then updates the
    /// in-memory copy.
    pub async fn set_config(&self, patch: OcrConfigPatch) -> Result<OcrConfig, WalletError> {
        let mut current = self.config.lock().await.clone();
        if let Some(level) = patch.level {
            current.level = level;
        }
        if let Some(target_override) = patch.target_override {
            current.target_override = target_override;
        }
        if let Some(auto_refill) = patch.auto_refill {
            current.auto_refill = auto_refill;
        }
        if let Some(alert_threshold) = patch.alert_threshold {
            current.alert_threshold = alert_threshold;
        }

        self.persist(&current).await?;
        *self.config.lock().await = current.clone();
        Ok(current)
    }

    pub async fn config(&self) -> OcrConfig {
        self.config.lock().await.clone()
    }

    /// Computes the current reserve health. See `spec.md` §4.7.
    pub async fn status(&self) -> Result<OcrSnapshot, WalletError> {
        let config = self.config().await;
        let current = self.proofs.reserve_balance().await?;
        let target = config.target_amount().max(1);

        let pct = ((current as u128 * 100) / target as u128) as u32;

        let status = if current == 0 {
            OcrStatus::Depleted
        } else if pct >= 95 {
            OcrStatus::Synced
        } else if pct >= 50 {
            OcrStatus::OfflineReady
        } else {
            OcrStatus::OutOfSync
        };

        let alert_level = if pct < config.alert_threshold as u32 {
            AlertLevel::Critical
        } else if pct < 2 * config.alert_threshold as u32 {
            AlertLevel::Low
        } else {
            AlertLevel::None
        };

        Ok(OcrSnapshot { current, target, pct, status, needs_refill: pct < 80, alert_level })
    }

    /// Tops the reserve up to its configured target by swapping
    /// non-reserve UNSPENT proofs into reserve-tagged ones. A no-op if
    /// already [`OcrStatus::Synced`].
    pub async fn sync(&self, core: &WalletCore, mint_url: &str) -> Result<Option<Vec<Proof>>, WalletError> {
        let snapshot = self.status().await?;
        if snapshot.status == OcrStatus::Synced {
            return Ok(None);
        }

        let deficit = snapshot.target.saturating_sub(snapshot.current);
        let candidates = self.proofs.unspent_for_mint(mint_url).await?;
        let mut spendable: Vec<Proof> = candidates.into_iter().filter(|p| !p.is_reserve).collect();
        spendable.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.created_at.cmp(&b.created_at)));

        let mut selected = Vec::new();
        let mut total = 0u64;
        for proof in spendable {
            if total >= deficit {
                break;
            }
            total += proof.amount;
            selected.push(proof);
        }

        if total < deficit {
            return Err(WalletError::InsufficientFunds { requested: deficit, available: total });
        }

        let ids: Vec<_> = selected.iter().map(|p| p.id).collect();
        let minted = core.swap(mint_url, &ids, false).await?;
        self.proofs.mark_reserve(&minted.iter().map(|p| p.id).collect::<Vec<_>>()).await?;

        Ok(Some(minted))
    }

    /// Invokes [`Self::sync`] only if auto-refill is enabled and the
    /// reserve needs topping up.
    pub async fn refill_if_needed(&self, core: &WalletCore, mint_url: &str) -> Result<Option<Vec<Proof>>, WalletError> {
        let config = self.config().await;
        let snapshot = self.status().await?;
        if !config.auto_refill || !snapshot.needs_refill {
            return Ok(None);
        }
        self.sync(core, mint_url).await
    }

    /// Surfaces warnings a host might show the user; does not mutate
    /// state. See `spec.md` §4.7.
    pub async fn health_check(&self) -> Result<Vec<OcrWarning>, WalletError> {
        let snapshot = self.status().await?;
        let config = self.config().await;
        let total_balance = self.proofs.total_balance().await?;

        let mut warnings = Vec::new();
        match snapshot.status {
            OcrStatus::Depleted => warnings.push(OcrWarning::Depleted),
            OcrStatus::OutOfSync => warnings.push(OcrWarning::OutOfSync),
            _ => {}
        }
        if snapshot.alert_level != AlertLevel::None {
            warnings.push(OcrWarning::BelowAlertThreshold);
        }
        if total_balance > 0 && config.target_amount() as u128 * 2 > total_balance as u128 {
            warnings.push(OcrWarning::TargetExceedsHalfOfBalance);
        }

        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::core_with_fake_mint;
    use crate::types::OcrLevel;

    async fn manager_with_core() -> (OcrManager, WalletCore, String) {
        let (core, store, _mints, _tx_log, mint_url) = core_with_fake_mint().await;
        let config = OcrConfig { level: OcrLevel::Low, target_override: None, auto_refill: true, alert_threshold: 10 };
        let manager = OcrManager::new(store, core.proofs().clone(), config);
        manager.load().await.unwrap();
        (manager, core, mint_url)
    }

    #[tokio::test]
    async fn depleted_with_no_reserve() {
        let (manager, _core, _mint_url) = manager_with_core().await;
        let snapshot = manager.status().await.unwrap();
        assert_eq!(snapshot.status, OcrStatus::Depleted);
        assert!(snapshot.needs_refill);
    }

    #[tokio::test]
    async fn sync_tops_up_reserve_from_spendable_balance() {
        let (manager, core, mint_url) = manager_with_core().await;
        let (tx_id, quote) = core.request_mint(&mint_url, OcrLevel::Low.default_target() * 2).await.unwrap();
        core.complete_mint(tx_id, &mint_url, OcrLevel::Low.default_target() * 2, &quote, false).await.unwrap();

        let minted = manager.sync(&core, &mint_url).await.unwrap();
        assert!(minted.is_some());

        let snapshot = manager.status().await.unwrap();
        assert_eq!(snapshot.status, OcrStatus::Synced);
    }

    #[tokio::test]
    async fn sync_is_noop_once_synced() {
        let (manager, core, mint_url) = manager_with_core().await;
        let target = OcrLevel::Low.default_target();
        let (tx_id, quote) = core.request_mint(&mint_url, target).await.unwrap();
        core.complete_mint(tx_id, &mint_url, target, &quote, false).await.unwrap();
        manager.sync(&core, &mint_url).await.unwrap();

        let second = manager.sync(&core, &mint_url).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn sync_reports_insufficient_funds_without_mutating_state() {
        let (manager, core, mint_url) = manager_with_core().await;
        let err = manager.sync(&core, &mint_url).await.unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { .. }));
        assert_eq!(core.proofs().total_balance().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn set_config_merges_patch_and_persists() {
        let (manager, _core, _mint_url) = manager_with_core().await;
        let updated = manager.set_config(OcrConfigPatch { auto_refill: Some(false), ..Default::default() }).await.unwrap();
        assert!(!updated.auto_refill);
        assert_eq!(updated.level, OcrLevel::Low);
    }
}
