//! High-level wallet composition.
//!
//! Ties the record store, UTXO helpers, fee math, and builder together
//! into the operations the service API exposes: key import, balance
//! breakdown, sends, fee estimates, and the matching-UTXO preparation
//! the CoinJoin engine leans on.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use kasmix_chain::{ChainRpc, RpcError};
use kasmix_core::address::{Address, Network};
use kasmix_core::amount::kas_to_sompi;
use kasmix_core::constants::{
    COINBASE_MATURITY, MATCHING_UTXO_BACKOFF_STEP_MS, MATCHING_UTXO_RETRIES, MIN_CONFIRMATIONS,
    UTXO_CONFIRM_POLL_MS, UTXO_CONFIRM_TIMEOUT_MS, UTXO_MATCH_TOLERANCE_PCT,
};
use kasmix_core::mass::calculate_mass;
use kasmix_core::types::{Outpoint, SerializedUtxo, TransactionId, UtxoEntry};

use crate::builder::{build_with_change, check_standard_mass, sign_all, submit};
use crate::error::WalletError;
use crate::fee::{candidate_transaction, fee_for_mass, feerate_or_default};
use crate::keys::{import_mnemonic, import_private_key};
use crate::store::{TxHistoryEntry, WalletRecord, WalletStore};
use crate::utxo::UtxoManager;

/// Balance breakdown in sompi.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletBalance {
    pub confirmed: u64,
    pub unconfirmed: u64,
    pub total: u64,
    /// Confirmed and spendable (coinbase maturity applied).
    pub mature: u64,
    pub utxo_count: usize,
}

/// Outcome of a submitted wallet send.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub tx_id: String,
    pub amount: u64,
    pub fee: u64,
    pub change: u64,
}

/// A dry-run fee quote for a wallet send.
#[derive(Debug, Clone, Copy)]
pub struct SendEstimate {
    pub amount: u64,
    pub fee: u64,
    pub change: u64,
    pub mass: u64,
    pub feerate: u64,
    pub total_with_fee: u64,
}

/// The user wallet: one imported key, its UTXOs, and send facilities.
pub struct Wallet {
    store: Arc<WalletStore>,
    utxos: UtxoManager,
    network: Network,
}

impl Wallet {
    pub fn new(rpc: Arc<dyn ChainRpc>, store: Arc<WalletStore>, network: Network) -> Self {
        Self {
            store,
            utxos: UtxoManager::new(rpc),
            network,
        }
    }

    pub fn store(&self) -> &Arc<WalletStore> {
        &self.store
    }

    pub fn utxo_manager(&self) -> &UtxoManager {
        &self.utxos
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Import a raw hex private key; returns the derived address.
    pub fn import_key(&self, hex_key: &str) -> Result<String, WalletError> {
        let imported = import_private_key(hex_key, self.network)?;
        let address = imported.address.encode();
        self.store.set(WalletRecord {
            address: address.clone(),
            private_key_hex: imported.keypair.secret_hex(),
            imported_at: now_millis(),
            kpub: None,
            derivation_path: None,
            transaction_history: vec![],
            address_book: vec![],
        })?;
        info!(%address, "wallet key imported");
        Ok(address)
    }

    /// Import a BIP-39 mnemonic; returns the derived address and kpub.
    pub fn import_mnemonic(
        &self,
        phrase: &str,
        passphrase: Option<&str>,
    ) -> Result<(String, String), WalletError> {
        let imported = import_mnemonic(phrase, passphrase, self.network)?;
        let address = imported.address.encode();
        let kpub = imported.kpub.clone().unwrap_or_default();
        self.store.set(WalletRecord {
            address: address.clone(),
            private_key_hex: imported.keypair.secret_hex(),
            imported_at: now_millis(),
            kpub: imported.kpub,
            derivation_path: imported.derivation_path,
            transaction_history: vec![],
            address_book: vec![],
        })?;
        info!(%address, "wallet mnemonic imported");
        Ok((address, kpub))
    }

    /// Delete the wallet record and its file.
    pub fn remove(&self) -> Result<bool, WalletError> {
        self.store.remove()
    }

    /// Current balance breakdown over the wallet's UTXO set.
    pub async fn balance(&self) -> Result<WalletBalance, WalletError> {
        let record = self.store.require()?;
        let current = self.utxos.current_daa_score().await?;
        let entries = self.utxos.fetch_utxos(&record.address).await?;

        let mut confirmed = 0u64;
        let mut unconfirmed = 0u64;
        let mut mature = 0u64;
        for entry in &entries {
            let conf = entry.confirmations(current);
            if entry.block_daa_score > 0 && conf >= MIN_CONFIRMATIONS {
                confirmed += entry.amount;
                if !entry.is_coinbase || conf >= COINBASE_MATURITY {
                    mature += entry.amount;
                }
            } else {
                unconfirmed += entry.amount;
            }
        }

        Ok(WalletBalance {
            confirmed,
            unconfirmed,
            total: confirmed + unconfirmed,
            mature,
            utxo_count: entries.len(),
        })
    }

    /// Send `amount_kas` (a KAS decimal string) to `to`.
    pub async fn send(&self, to: &str, amount_kas: &str) -> Result<SendResult, WalletError> {
        let record = self.store.require()?;
        let keypair = record.keypair()?;
        let to_address =
            Address::decode(to).map_err(|e| WalletError::InvalidAddress(e.to_string()))?;
        let self_address = Address::decode(&record.address)
            .map_err(|e| WalletError::InvalidAddress(e.to_string()))?;
        let amount = kas_to_sompi(amount_kas)?;
        if amount == 0 {
            return Err(WalletError::InvalidAmount("amount must be positive".into()));
        }

        let (confirmed, _) = self
            .utxos
            .confirmed_utxos(&record.address, MIN_CONFIRMATIONS)
            .await?;
        if confirmed.is_empty() {
            return Err(WalletError::NoConfirmed(record.address.clone()));
        }

        let feerate = feerate_or_default(self.utxos.rpc().as_ref()).await;
        let (inputs, fee) = select_inputs(confirmed, amount, feerate, &to_address, &self_address)?;

        let mut built =
            build_with_change(&inputs, &to_address, amount, &self_address, fee, None)?;
        check_standard_mass(&built.signable.transaction)?;
        sign_all(&mut built.signable, &keypair)?;

        let tx_id = submit(self.utxos.rpc().as_ref(), &built.signable).await?;

        if let Err(e) = self.store.append_tx_history(TxHistoryEntry {
            tx_id: tx_id.to_string(),
            direction: "sent".into(),
            amount: built.send_amount,
            fee: built.fee,
            address: to.to_string(),
            timestamp: now_millis(),
        }) {
            warn!(error = %e, "failed to record transaction history");
        }

        Ok(SendResult {
            tx_id: tx_id.to_string(),
            amount: built.send_amount,
            fee: built.fee,
            change: built.change,
        })
    }

    /// Fee quote for a send, without signing or submitting.
    pub async fn estimate_send(
        &self,
        to: &str,
        amount_kas: &str,
    ) -> Result<SendEstimate, WalletError> {
        let record = self.store.require()?;
        let to_address =
            Address::decode(to).map_err(|e| WalletError::InvalidAddress(e.to_string()))?;
        let self_address = Address::decode(&record.address)
            .map_err(|e| WalletError::InvalidAddress(e.to_string()))?;
        let amount = kas_to_sompi(amount_kas)?;
        if amount == 0 {
            return Err(WalletError::InvalidAmount("amount must be positive".into()));
        }

        let (confirmed, _) = self
            .utxos
            .confirmed_utxos(&record.address, MIN_CONFIRMATIONS)
            .await?;
        if confirmed.is_empty() {
            return Err(WalletError::NoConfirmed(record.address.clone()));
        }

        let feerate = feerate_or_default(self.utxos.rpc().as_ref()).await;
        let (inputs, fee) = select_inputs(confirmed, amount, feerate, &to_address, &self_address)?;
        let built = build_with_change(&inputs, &to_address, amount, &self_address, fee, None)?;
        let mass = calculate_mass(&built.signable.transaction);

        Ok(SendEstimate {
            amount: built.send_amount,
            fee: built.fee,
            change: built.change,
            mass,
            feerate,
            total_with_fee: built.send_amount + built.fee,
        })
    }

    /// Ensure a confirmed UTXO of exactly `target` sompi exists in the
    /// wallet, creating one with an exact self-send when necessary.
    ///
    /// Outpoints in `exclude` are already promised to other sessions.
    /// Submission retries on "output already spent by a mempool
    /// transaction" with 3/6/9 s backoff; "already in mempool" counts as
    /// success. Returns the serialized UTXO once it confirms.
    pub async fn create_matching_utxo(
        &self,
        target: u64,
        exclude: &HashSet<Outpoint>,
    ) -> Result<SerializedUtxo, WalletError> {
        let record = self.store.require()?;

        if let Some(existing) = self
            .utxos
            .has_matching_utxo(&record.address, target, UTXO_MATCH_TOLERANCE_PCT, exclude)
            .await?
        {
            return Ok(existing.serialized());
        }

        let keypair = record.keypair()?;
        let self_address = Address::decode(&record.address)
            .map_err(|e| WalletError::InvalidAddress(e.to_string()))?;

        let (confirmed, _) = self
            .utxos
            .confirmed_utxos(&record.address, MIN_CONFIRMATIONS)
            .await?;
        let spendable: Vec<UtxoEntry> = confirmed
            .into_iter()
            .filter(|e| !exclude.contains(&e.outpoint))
            .collect();
        if spendable.is_empty() {
            return Err(WalletError::NoConfirmed(record.address.clone()));
        }

        let feerate = feerate_or_default(self.utxos.rpc().as_ref()).await;
        let (inputs, fee) =
            select_inputs(spendable, target, feerate, &self_address, &self_address)?;

        let mut built = build_with_change(
            &inputs,
            &self_address,
            target,
            &self_address,
            fee,
            Some(target),
        )?;
        check_standard_mass(&built.signable.transaction)?;
        sign_all(&mut built.signable, &keypair)?;

        let mut tx_id: Option<TransactionId> = None;
        for attempt in 0..=MATCHING_UTXO_RETRIES {
            match submit(self.utxos.rpc().as_ref(), &built.signable).await {
                Ok(id) => {
                    tx_id = Some(id);
                    break;
                }
                Err(WalletError::Rpc(RpcError::OutputSpentInMempool))
                    if attempt < MATCHING_UTXO_RETRIES =>
                {
                    let backoff = MATCHING_UTXO_BACKOFF_STEP_MS * (attempt as u64 + 1);
                    warn!(attempt, backoff_ms = backoff, "matching-UTXO input raced a mempool spend, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
        let tx_id = tx_id.ok_or(WalletError::Rpc(RpcError::OutputSpentInMempool))?;

        self.wait_for_utxo_confirmation(
            target,
            Some(tx_id),
            exclude,
            UTXO_CONFIRM_TIMEOUT_MS,
            UTXO_CONFIRM_POLL_MS,
        )
        .await
    }

    /// Poll until a confirmed UTXO matching `target` appears.
    ///
    /// With a known `created_tx_id` the match is strict: output 0 of that
    /// transaction. Otherwise any non-excluded confirmed UTXO within the
    /// matching tolerance is accepted.
    pub async fn wait_for_utxo_confirmation(
        &self,
        target: u64,
        created_tx_id: Option<TransactionId>,
        exclude: &HashSet<Outpoint>,
        timeout_ms: u64,
        poll_ms: u64,
    ) -> Result<SerializedUtxo, WalletError> {
        let record = self.store.require()?;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            // Transient node failures just mean another poll iteration.
            let _ = self.utxos.refresh_daa_score().await;
            if let Ok((confirmed, _)) = self
                .utxos
                .confirmed_utxos(&record.address, MIN_CONFIRMATIONS)
                .await
            {
                let found = match created_tx_id {
                    Some(id) => confirmed
                        .iter()
                        .find(|e| e.outpoint.transaction_id == id && e.outpoint.index == 0),
                    None => {
                        let slack = target / 100 * UTXO_MATCH_TOLERANCE_PCT;
                        confirmed.iter().find(|e| {
                            !exclude.contains(&e.outpoint)
                                && e.amount >= target.saturating_sub(slack)
                                && e.amount <= target.saturating_add(slack)
                        })
                    }
                };
                if let Some(entry) = found {
                    return Ok(entry.serialized());
                }
            }

            if Instant::now() >= deadline {
                return Err(WalletError::ConfirmationTimeout);
            }
            tokio::time::sleep(Duration::from_millis(poll_ms)).await;
        }
    }
}

/// Greedy largest-first input selection with a mass-accurate fee target.
fn select_inputs(
    mut spendable: Vec<UtxoEntry>,
    amount: u64,
    feerate: u64,
    to: &Address,
    change: &Address,
) -> Result<(Vec<UtxoEntry>, u64), WalletError> {
    if spendable.is_empty() {
        return Err(WalletError::NoUtxos);
    }
    spendable.sort_by(|a, b| b.amount.cmp(&a.amount));

    let mut selected: Vec<UtxoEntry> = Vec::new();
    let mut sum = 0u64;
    for entry in spendable {
        sum = sum
            .checked_add(entry.amount)
            .ok_or_else(|| WalletError::InvalidAmount("input sum overflow".into()))?;
        selected.push(entry);

        let candidate = candidate_transaction(
            &selected,
            &[(to.clone(), amount), (change.clone(), 0)],
        );
        let fee = fee_for_mass(calculate_mass(&candidate), feerate);
        if let Some(needed) = amount.checked_add(fee) {
            if sum >= needed {
                return Ok((selected, fee));
            }
        }
    }

    Err(WalletError::InsufficientFunds {
        have: sum,
        need: amount,
    })
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
