//! Transaction composition, signing, and submission.
//!
//! Composition keeps the contract from the fee layer: inputs equal
//! outputs plus fee, exactly. Submission normalises the node's
//! "already in mempool" rejection to success, carrying whichever
//! transaction id the node (or our own encoding) provides.

use tracing::{info, warn};

use kasmix_chain::{ChainRpc, RpcError};
use kasmix_core::address::Address;
use kasmix_core::constants::DUST_THRESHOLD;
use kasmix_core::crypto::{sign_transaction, KeyPair};
use kasmix_core::mass::{calculate_mass, MAXIMUM_STANDARD_MASS};
use kasmix_core::types::{
    SignableTransaction, Transaction, TransactionId, TxInput, TxOutput, UtxoEntry,
};

use crate::error::WalletError;

/// A composed transaction plus its accounting.
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub signable: SignableTransaction,
    pub send_amount: u64,
    pub fee: u64,
    pub change: u64,
}

/// Compose a transaction spending `inputs` to arbitrary `(address, amount)`
/// outputs. The caller is responsible for exactness; this only assembles.
pub fn compose(inputs: &[UtxoEntry], outputs: &[(Address, u64)]) -> SignableTransaction {
    let tx = Transaction {
        version: 0,
        inputs: inputs
            .iter()
            .map(|e| TxInput {
                previous_outpoint: e.outpoint,
                signature_script: vec![],
                sequence: 0,
            })
            .collect(),
        outputs: outputs
            .iter()
            .map(|(address, amount)| TxOutput {
                amount: *amount,
                script_public_key: address.script_public_key(),
            })
            .collect(),
        lock_time: 0,
    };
    SignableTransaction::new(tx, inputs.to_vec())
}

/// Compose a send with change.
///
/// - Ordinary sends: two outputs, unless the change would be dust, in
///   which case the change is folded into the send amount (the recipient
///   absorbs it).
/// - Exact self-sends (`exact = Some(target)`): output 0 is pinned to the
///   target amount and every balancing adjustment lands on the change
///   output, so downstream consumers can rely on `outputs[0].amount`.
pub fn build_with_change(
    inputs: &[UtxoEntry],
    to: &Address,
    send_amount: u64,
    change_address: &Address,
    fee: u64,
    exact: Option<u64>,
) -> Result<BuiltTransaction, WalletError> {
    let inputs_sum: u64 = inputs.iter().map(|e| e.amount).sum();
    if inputs.is_empty() {
        return Err(WalletError::NoUtxos);
    }

    let needed = send_amount
        .checked_add(fee)
        .ok_or_else(|| WalletError::InvalidAmount("amount overflow".into()))?;
    if inputs_sum < needed {
        return Err(WalletError::InsufficientFunds {
            have: inputs_sum,
            need: needed,
        });
    }
    let change = inputs_sum - needed;

    let (outputs, send_amount, change) = match exact {
        Some(target) => {
            // Pinned first output; change takes the rest even when small.
            if send_amount != target {
                return Err(WalletError::InvalidAmount(format!(
                    "exact send mismatch: {send_amount} != {target}"
                )));
            }
            if change == 0 {
                (vec![(to.clone(), target)], target, 0)
            } else {
                (
                    vec![(to.clone(), target), (change_address.clone(), change)],
                    target,
                    change,
                )
            }
        }
        None if change <= DUST_THRESHOLD => {
            // Dust change is folded into the payment.
            (vec![(to.clone(), send_amount + change)], send_amount + change, 0)
        }
        None => (
            vec![(to.clone(), send_amount), (change_address.clone(), change)],
            send_amount,
            change,
        ),
    };

    let signable = compose(inputs, &outputs);
    debug_assert_eq!(
        signable.transaction.total_output_amount().unwrap_or(0) + fee,
        inputs_sum
    );

    Ok(BuiltTransaction {
        signable,
        send_amount,
        fee,
        change,
    })
}

/// Sign every input with one key; fails if any input remains unsigned.
pub fn sign_all(signable: &mut SignableTransaction, keypair: &KeyPair) -> Result<(), WalletError> {
    sign_transaction(signable, keypair)?;
    if !signable.transaction.is_fully_signed() {
        return Err(WalletError::InvalidKey(
            "key does not control all transaction inputs".into(),
        ));
    }
    Ok(())
}

/// Reject transactions over the standard mass ceiling; warn near it.
pub fn check_standard_mass(tx: &Transaction) -> Result<u64, WalletError> {
    let mass = calculate_mass(tx);
    if mass > MAXIMUM_STANDARD_MASS {
        return Err(WalletError::MassExceeded {
            mass,
            max: MAXIMUM_STANDARD_MASS,
        });
    }
    if mass > MAXIMUM_STANDARD_MASS / 10 * 8 {
        warn!(mass, max = MAXIMUM_STANDARD_MASS, "transaction mass above 80% of standard maximum");
    }
    Ok(mass)
}

/// Submit a fully signed transaction.
///
/// The node answering "already in mempool" means an identical submission
/// is in flight; that is success, with the id taken from the node's error
/// text when present, otherwise recomputed locally.
pub async fn submit(
    rpc: &dyn ChainRpc,
    signable: &SignableTransaction,
) -> Result<TransactionId, WalletError> {
    match rpc.submit_transaction(&signable.transaction).await {
        Ok(id) => {
            info!(tx_id = %id, "transaction submitted");
            Ok(id)
        }
        Err(RpcError::AlreadyInMempool { tx_id }) => {
            let id = match tx_id {
                Some(id) => id,
                None => signable
                    .transaction
                    .id()
                    .map_err(|e| WalletError::Rpc(RpcError::Other(e.to_string())))?,
            };
            info!(tx_id = %id, "transaction already in mempool, treating as submitted");
            Ok(id)
        }
        Err(e) => Err(e.into()),
    }
}
