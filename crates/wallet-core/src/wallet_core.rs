//! Orchestrates mint/send/receive/melt/swap flows across the individual
//! stores. See `spec.md` §4.6.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::amount;
use crate::error::{MintError, WalletError};
use crate::mint_catalog::MintCatalog;
use crate::mint_client::{MintClient, OutputsSpec, ProofInput};
use crate::op_queue::OpQueue;
use crate::proof_store::{NewProof, ProofStore};
use crate::token;
use crate::tx_log::{NewTransaction, TxLog};
use crate::types::{now, Direction, OpType, Priority, Proof, ProofId, ProofState, TrustLevel, TxStatus, TxType};

/// Proofs received from a send/receive/mint/melt flow, ready to hand to a
/// host UI. Mirrors the shape of a decoded token.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub tx_id: Uuid,
    pub proofs: Vec<Proof>,
    pub encoded_token: String,
}

#[derive(Debug, Clone)]
pub struct MeltResult {
    pub tx_id: Uuid,
    pub paid: bool,
    pub preimage: Option<String>,
}

/// Factory for a [`MintClient`] given a mint URL. Supplied by the host so
/// `WalletCore` never constructs network clients itself.
pub type MintClientFactory = Arc<dyn Fn(&str) -> Arc<dyn MintClient> + Send + Sync>;

/// Composes [`ProofStore`], [`TxLog`], [`MintCatalog`], and [`OpQueue`]
/// against a per-mint [`MintClient`]. The client cache is shared,
/// read-mostly, and entry creation is idempotent — see `spec.md` §5 "Shared
/// resources".
pub struct WalletCore {
    proofs: ProofStore,
    tx_log: TxLog,
    mints: MintCatalog,
    op_queue: OpQueue,
    client_factory: MintClientFactory,
    clients: Mutex<HashMap<String, Arc<dyn MintClient>>>,
}

impl std::fmt::Debug for WalletCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletCore").finish_non_exhaustive()
    }
}

impl WalletCore {
    pub fn new(
        proofs: ProofStore,
        tx_log: TxLog,
        mints: MintCatalog,
        op_queue: OpQueue,
        client_factory: MintClientFactory,
    ) -> Self {
        Self {
            proofs,
            tx_log,
            mints,
            op_queue,
            client_factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn proofs(&self) -> &ProofStore {
        &self.proofs
    }

    pub fn tx_log(&self) -> &TxLog {
        &self.tx_log
    }

    pub fn mints(&self) -> &MintCatalog {
        &self.mints
    }

    pub fn op_queue(&self) -> &OpQueue {
        &self.op_queue
    }

    /// Returns the cached client for `mint_url`, creating one on first use.
    async fn client_for(&self, mint_url: &str) -> Arc<dyn MintClient> {
        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(mint_url) {
            return existing.clone();
        }
        let created = (self.client_factory)(mint_url);
        clients.insert(mint_url.to_string(), created.clone());
        created
    }

    /// Requests a mint quote and records a PENDING MINT transaction. The
    /// caller drives external payment confirmation, then calls
    /// [`Self::complete_mint`].
    #[tracing::instrument(skip(self))]
    pub async fn request_mint(&self, mint_url: &str, amount: u64) -> Result<(Uuid, String), WalletError> {
        let client = self.client_for(mint_url).await;
        let quote = client.get_mint_quote(amount).await?;

        let tx_id = self
            .tx_log
            .append(NewTransaction {
                tx_type: TxType::Mint,
                direction: Direction::Incoming,
                amount,
                mint_url: mint_url.to_string(),
                payment_request: Some(quote.request.clone()),
                proof_count: 0,
                memo: None,
            })
            .await?;

        Ok((tx_id, quote.quote))
    }

    /// Claims minted proofs after the Lightning invoice is paid. On
    /// failure, marks the transaction FAILED and inserts no proofs.
    #[tracing::instrument(skip(self))]
    pub async fn complete_mint(
        &self,
        tx_id: Uuid,
        mint_url: &str,
        amount: u64,
        quote: &str,
        is_reserve: bool,
    ) -> Result<Vec<Proof>, WalletError> {
        let client = self.client_for(mint_url).await;

        let minted = match client.mint(amount, quote).await {
            Ok(minted) => minted,
            Err(e) => {
                self.tx_log.update_status(tx_id, TxStatus::Failed, Some(now())).await?;
                return Err(e.into());
            }
        };

        let mut inserted = Vec::with_capacity(minted.len());
        for m in minted {
            let id = self
                .proofs
                .insert(NewProof {
                    secret: m.secret,
                    c: m.c,
                    amount: m.amount,
                    mint_url: mint_url.to_string(),
                    keyset_id: m.keyset_id,
                    is_reserve,
                    dleq: m.dleq,
                })
                .await?;
            if let Some(p) = self.proofs.get(id).await? {
                inserted.push(p);
            }
        }

        self.tx_log.update_status(tx_id, TxStatus::Completed, Some(now())).await?;
        Ok(inserted)
    }

    /// Builds an offline-shareable token for `amount` at `mint_url`.
    /// Selects and locks proofs (PENDING_SEND); if the selection has no
    /// change, returns the locked proofs as-is. Otherwise swaps with the
    /// mint to split into an exact-amount output plus change, inserting
    /// the exact output PENDING_SEND and change UNSPENT, and marking the
    /// originals SPENT.
    #[tracing::instrument(skip(self))]
    pub async fn send(&self, mint_url: &str, amount: u64, use_reserve: bool) -> Result<SendResult, WalletError> {
        let tx_id = Uuid::new_v4();
        let selection = self.proofs.select_for_amount(mint_url, amount, tx_id, use_reserve).await?;

        self.tx_log
            .append(NewTransaction {
                tx_type: TxType::Send,
                direction: Direction::Outgoing,
                amount,
                mint_url: mint_url.to_string(),
                payment_request: None,
                proof_count: selection.proofs.len() as u32,
                memo: None,
            })
            .await?;

        let send_proofs = if selection.change == 0 {
            selection.proofs
        } else {
            let client = self.client_for(mint_url).await;
            let keyset_id = selection.proofs[0].keyset_id.clone();

            let send_amounts = amount::split(amount);
            let split_count = send_amounts.len();
            let mut amounts = send_amounts;
            amounts.extend(amount::split(selection.change));

            let inputs: Vec<ProofInput> = selection.proofs.iter().map(proof_to_input).collect();
            let response = match client.swap(inputs, OutputsSpec { amounts, keyset_id }).await {
                Ok(r) => r,
                Err(e) => {
                    self.release_send_selection(&selection.proofs, tx_id).await?;
                    return Err(e.into());
                }
            };

            let (send_minted, change_minted) = response.proofs.split_at(split_count);

            let mut send_proofs = Vec::with_capacity(send_minted.len());
            for m in send_minted {
                let id = self
                    .proofs
                    .insert(NewProof {
                        secret: m.secret.clone(),
                        c: m.c.clone(),
                        amount: m.amount,
                        mint_url: mint_url.to_string(),
                        keyset_id: m.keyset_id.clone(),
                        is_reserve: false,
                        dleq: m.dleq.clone(),
                    })
                    .await?;
                self.proofs.transition(id, ProofState::Unspent, ProofState::PendingSend, Some(tx_id)).await?;
                if let Some(p) = self.proofs.get(id).await? {
                    send_proofs.push(p);
                }
            }

            for m in change_minted {
                self.proofs
                    .insert(NewProof {
                        secret: m.secret.clone(),
                        c: m.c.clone(),
                        amount: m.amount,
                        mint_url: mint_url.to_string(),
                        keyset_id: m.keyset_id.clone(),
                        is_reserve: false,
                        dleq: m.dleq.clone(),
                    })
                    .await?;
            }

            for original in &selection.proofs {
                self.proofs.transition(original.id, ProofState::PendingSend, ProofState::Spent, Some(tx_id)).await?;
            }

            send_proofs
        };

        let encoded_token = token::encode(
            mint_url,
            &send_proofs.iter().map(proof_to_token).collect::<Vec<_>>(),
            None,
            None,
        );

        Ok(SendResult { tx_id, proofs: send_proofs, encoded_token })
    }

    async fn release_send_selection(&self, proofs: &[Proof], tx_id: Uuid) -> Result<(), WalletError> {
        for proof in proofs {
            self.proofs.transition(proof.id, ProofState::PendingSend, ProofState::Unspent, Some(tx_id)).await?;
        }
        Ok(())
    }

    /// Transitions a previously-sent selection PENDING_SEND → SPENT once
    /// the host confirms the token was handed off.
    pub async fn confirm_send(&self, ids: &[ProofId], tx_id: Uuid) -> Result<(), WalletError> {
        for id in ids {
            self.proofs.transition(*id, ProofState::PendingSend, ProofState::Spent, Some(tx_id)).await?;
        }
        self.tx_log.update_status(tx_id, TxStatus::Completed, Some(now())).await?;
        Ok(())
    }

    /// Transitions a previously-sent selection PENDING_SEND → UNSPENT and
    /// marks the transaction FAILED. Does not contact the mint — see
    /// `SPEC_FULL.md` §13 Open Question 3.
    pub async fn cancel_send(&self, ids: &[ProofId], tx_id: Uuid) -> Result<(), WalletError> {
        for id in ids {
            self.proofs.transition(*id, ProofState::PendingSend, ProofState::Unspent, Some(tx_id)).await?;
        }
        self.tx_log.update_status(tx_id, TxStatus::Failed, Some(now())).await?;
        Ok(())
    }

    /// Decodes a token, registers its mint as untrusted if unknown, swaps
    /// the token's proofs for fresh outputs, and inserts them UNSPENT.
    #[tracing::instrument(skip(self, token_str))]
    pub async fn receive(&self, token_str: &str) -> Result<Vec<Proof>, WalletError> {
        let decoded = token::decode(token_str)?;

        let mint = match self.mints.get_by_url(&decoded.mint_url).await? {
            Some(mint) => mint,
            None => self.mints.create(&decoded.mint_url, None, None, TrustLevel::Untrusted).await?,
        };

        let client = self.client_for(&mint.url).await;
        let inputs: Vec<ProofInput> = decoded
            .proofs
            .iter()
            .map(|p| ProofInput {
                secret: p.secret.clone(),
                c: p.c.clone(),
                amount: p.amount,
                keyset_id: p.keyset_id.clone(),
            })
            .collect();

        let total: u64 = decoded.proofs.iter().map(|p| p.amount).sum();
        let keyset_id = decoded
            .proofs
            .first()
            .map(|p| p.keyset_id.clone())
            .ok_or_else(|| WalletError::InvalidToken("token carries no proofs".to_string()))?;

        let response = client
            .swap(inputs, OutputsSpec { amounts: amount::split(total), keyset_id })
            .await?;

        let mut inserted = Vec::with_capacity(response.proofs.len());
        for m in response.proofs {
            let id = self
                .proofs
                .insert(NewProof {
                    secret: m.secret,
                    c: m.c,
                    amount: m.amount,
                    mint_url: mint.url.clone(),
                    keyset_id: m.keyset_id,
                    is_reserve: false,
                    dleq: m.dleq,
                })
                .await?;
            if let Some(p) = self.proofs.get(id).await? {
                inserted.push(p);
            }
        }

        self.tx_log
            .append(NewTransaction {
                tx_type: TxType::Receive,
                direction: Direction::Incoming,
                amount: total,
                mint_url: mint.url.clone(),
                payment_request: None,
                proof_count: inserted.len() as u32,
                memo: decoded.memo,
            })
            .await?;

        Ok(inserted)
    }

    /// Pays a Lightning invoice. Ambiguous mint failures (a network error
    /// after dispatch, where the mint may already have paid) leave the
    /// selection PENDING_SEND and enqueue a `Reconcile` op rather than
    /// rolling back, to avoid replaying an already-applied mint-side
    /// operation — see `spec.md` §4.6 and §7.
    #[tracing::instrument(skip(self))]
    pub async fn melt(&self, mint_url: &str, invoice: &str) -> Result<MeltResult, WalletError> {
        let client = self.client_for(mint_url).await;
        let quote = client.get_melt_quote(invoice).await?;
        let needed = quote.amount + quote.fee_reserve;

        let tx_id = Uuid::new_v4();
        let selection = self.proofs.select_for_amount(mint_url, needed, tx_id, true).await?;

        self.tx_log
            .append(NewTransaction {
                tx_type: TxType::Melt,
                direction: Direction::Outgoing,
                amount: needed,
                mint_url: mint_url.to_string(),
                payment_request: Some(invoice.to_string()),
                proof_count: selection.proofs.len() as u32,
                memo: None,
            })
            .await?;

        let inputs: Vec<ProofInput> = selection.proofs.iter().map(proof_to_input).collect();

        match client.melt(&quote.quote, inputs).await {
            Ok(response) if response.paid => {
                for proof in &selection.proofs {
                    self.proofs.transition(proof.id, ProofState::PendingSend, ProofState::Spent, Some(tx_id)).await?;
                }
                for m in &response.change {
                    self.proofs
                        .insert(NewProof {
                            secret: m.secret.clone(),
                            c: m.c.clone(),
                            amount: m.amount,
                            mint_url: mint_url.to_string(),
                            keyset_id: m.keyset_id.clone(),
                            is_reserve: false,
                            dleq: m.dleq.clone(),
                        })
                        .await?;
                }
                self.tx_log.set_preimage(tx_id, response.preimage.clone()).await?;
                self.tx_log.update_status(tx_id, TxStatus::Completed, Some(now())).await?;
                Ok(MeltResult { tx_id, paid: true, preimage: response.preimage })
            }
            Ok(response) => {
                // Mint definitively reports not paid: safe to roll back.
                self.release_send_selection(&selection.proofs, tx_id).await?;
                self.tx_log.update_status(tx_id, TxStatus::Failed, Some(now())).await?;
                Ok(MeltResult { tx_id, paid: false, preimage: response.preimage })
            }
            Err(MintError::Network(_)) | Err(MintError::Http(_)) => {
                self.op_queue
                    .enqueue(
                        OpType::Reconcile,
                        serde_json::json!({ "mint_url": mint_url, "tx_id": tx_id }),
                        Priority::High,
                        5,
                    )
                    .await?;
                Ok(MeltResult { tx_id, paid: false, preimage: None })
            }
            Err(e) => {
                self.release_send_selection(&selection.proofs, tx_id).await?;
                self.tx_log.update_status(tx_id, TxStatus::Failed, Some(now())).await?;
                Err(e.into())
            }
        }
    }

    /// Swaps a set of UNSPENT proofs for freshly-issued ones, preserving
    /// their `is_reserve` tag. Used directly by hosts and by
    /// [`crate::ocr::OcrManager::sync`].
    #[tracing::instrument(skip(self, ids))]
    pub async fn swap(&self, mint_url: &str, ids: &[ProofId], preserve_reserve: bool) -> Result<Vec<Proof>, WalletError> {
        let tx_id = Uuid::new_v4();
        let mut originals = Vec::with_capacity(ids.len());
        for id in ids {
            let proof = self.proofs.get(*id).await?.ok_or(WalletError::LostRace { proof_id: id.0 })?;
            if !self.proofs.transition(*id, ProofState::Unspent, ProofState::PendingSwap, Some(tx_id)).await? {
                return Err(WalletError::LostRace { proof_id: id.0 });
            }
            originals.push(proof);
        }

        let total: u64 = originals.iter().map(|p| p.amount).sum();
        let keyset_id = originals[0].keyset_id.clone();
        let inputs: Vec<ProofInput> = originals.iter().map(proof_to_input).collect();
        let client = self.client_for(mint_url).await;

        let response = match client.swap(inputs, OutputsSpec { amounts: amount::split(total), keyset_id }).await {
            Ok(r) => r,
            Err(e) => {
                for original in &originals {
                    self.proofs.transition(original.id, ProofState::PendingSwap, ProofState::Unspent, Some(tx_id)).await?;
                }
                return Err(e.into());
            }
        };

        let mut inserted = Vec::with_capacity(response.proofs.len());
        for m in response.proofs {
            let id = self
                .proofs
                .insert(NewProof {
                    secret: m.secret,
                    c: m.c,
                    amount: m.amount,
                    mint_url: mint_url.to_string(),
                    keyset_id: m.keyset_id,
                    is_reserve: preserve_reserve,
                    dleq: m.dleq,
                })
                .await?;
            if let Some(p) = self.proofs.get(id).await? {
                inserted.push(p);
            }
        }

        for original in &originals {
            self.proofs.transition(original.id, ProofState::PendingSwap, ProofState::Spent, Some(tx_id)).await?;
        }

        Ok(inserted)
    }

    /// Resolves a PENDING melt transaction left ambiguous by a prior
    /// network failure (`spec.md` §4.6, §8 scenario S7). Asks the mint
    /// whether the locked inputs are now spent: if so, the mint paid —
    /// transitions them SPENT and completes the transaction (its preimage
    /// stays unrecorded, since the response that would have carried it was
    /// lost); otherwise returns them UNSPENT and fails the transaction.
    /// Returns `false` (no-op) if the transaction isn't PENDING or has no
    /// locked inputs, e.g. because it was already resolved.
    pub async fn resolve_ambiguous_melt(&self, tx_id: Uuid) -> Result<bool, WalletError> {
        let Some(tx) = self.tx_log.get(tx_id).await? else {
            return Ok(false);
        };
        if tx.status != TxStatus::Pending {
            return Ok(false);
        }

        let locked = self.proofs.locked_for_tx(tx_id).await?;
        if locked.is_empty() {
            return Ok(false);
        }

        let secrets: Vec<String> = locked.iter().map(|p| p.secret.clone()).collect();
        let spent_flags = self.check_spent(&tx.mint_url, secrets).await?;
        let paid = spent_flags.iter().all(|s| *s);

        if paid {
            for proof in &locked {
                self.proofs.transition(proof.id, ProofState::PendingSend, ProofState::Spent, Some(tx_id)).await?;
            }
            self.tx_log.update_status(tx_id, TxStatus::Completed, Some(now())).await?;
        } else {
            self.release_send_selection(&locked, tx_id).await?;
            self.tx_log.update_status(tx_id, TxStatus::Failed, Some(now())).await?;
        }

        Ok(true)
    }

    /// Fetches the mint's current advertised info. Used by `SyncEngine`'s
    /// metadata priority.
    pub async fn refresh_mint_info(&self, mint_url: &str) -> Result<crate::mint_client::MintInfo, WalletError> {
        let client = self.client_for(mint_url).await;
        Ok(client.get_info().await?)
    }

    /// Fetches the mint's current advertised keysets and reconciles them
    /// against the catalog. Used by `SyncEngine`'s keysets priority.
    pub async fn refresh_keysets(
        &self,
        mint_id: Uuid,
        mint_url: &str,
    ) -> Result<crate::mint_catalog::KeysetDiff, WalletError> {
        let client = self.client_for(mint_url).await;
        let advertised = client.get_keys().await?;

        let keysets = advertised
            .into_iter()
            .map(|k| crate::types::Keyset { mint_id, keyset_id: k.id, unit: k.unit, active: k.active, keys: k.keys })
            .collect();

        self.mints.sync_keysets(mint_id, keysets).await
    }

    /// Reports the mint's spent status for a batch of secrets. Used by
    /// `Reconciler::detect_conflicts`.
    pub async fn check_spent(&self, mint_url: &str, secrets: Vec<String>) -> Result<Vec<bool>, WalletError> {
        let client = self.client_for(mint_url).await;
        Ok(client.check_spent(secrets).await?)
    }
}

fn proof_to_input(proof: &Proof) -> ProofInput {
    ProofInput {
        secret: proof.secret.clone(),
        c: proof.c.clone(),
        amount: proof.amount,
        keyset_id: proof.keyset_id.clone(),
    }
}

fn proof_to_token(proof: &Proof) -> token::TokenProof {
    token::TokenProof {
        secret: proof.secret.clone(),
        c: proof.c.clone(),
        amount: proof.amount,
        keyset_id: proof.keyset_id.clone(),
    }
}
