//! Fee estimation, proportional allocation, and exact balancing.
//!
//! All arithmetic is integer sompi. The contract every spending path
//! finishes with: `Σ inputs == Σ outputs + fee`, exactly.

use tracing::debug;

use kasmix_chain::ChainRpc;
use kasmix_core::address::Address;
use kasmix_core::constants::{DUST_THRESHOLD, MIN_FEE, PROPORTION_PRECISION};
use kasmix_core::mass::calculate_mass;
use kasmix_core::types::{Transaction, TxInput, TxOutput, UtxoEntry};

use crate::error::WalletError;

/// How a fee figure was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeBreakdown {
    pub mass: u64,
    pub feerate: u64,
    pub fee: u64,
}

/// The node's priority fee rate, or 1 sompi/mass when unavailable.
pub async fn feerate_or_default(rpc: &dyn ChainRpc) -> u64 {
    match rpc.get_fee_estimate().await {
        Ok(estimate) => estimate.priority_feerate.max(1),
        Err(e) => {
            debug!(error = %e, "fee estimate unavailable, defaulting to 1 sompi/mass");
            1
        }
    }
}

/// feerate × mass, clamped below by [`MIN_FEE`].
pub fn fee_for_mass(mass: u64, feerate: u64) -> u64 {
    feerate.saturating_mul(mass).max(MIN_FEE)
}

/// Compose an unsigned candidate transaction (fee implicitly zero) from
/// inputs and `(address, amount)` outputs.
pub fn candidate_transaction(inputs: &[UtxoEntry], outputs: &[(Address, u64)]) -> Transaction {
    Transaction {
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
    }
}

/// Estimate the fee for a concrete candidate transaction.
pub async fn estimate_fee_for(rpc: &dyn ChainRpc, candidate: &Transaction) -> FeeBreakdown {
    let mass = calculate_mass(candidate);
    let feerate = feerate_or_default(rpc).await;
    FeeBreakdown {
        mass,
        feerate,
        fee: fee_for_mass(mass, feerate),
    }
}

/// Estimate the fee for spending `inputs` into `outputs`.
pub async fn estimate_fee(
    rpc: &dyn ChainRpc,
    inputs: &[UtxoEntry],
    outputs: &[(Address, u64)],
) -> FeeBreakdown {
    estimate_fee_for(rpc, &candidate_transaction(inputs, outputs)).await
}

/// Split `available` across destinations in proportion to their requested
/// amounts.
///
/// Each non-final destination gets
/// `⌊available · ⌊rᵢ·10⁹/R⌋ / 10⁹⌋`, raised to [`DUST_THRESHOLD`] when
/// necessary; the final destination receives the exact remainder (which
/// absorbs any excess the dust raises created). The returned amounts
/// always sum to exactly `available`.
pub fn allocate_proportional(requested: &[u64], available: u64) -> Result<Vec<u64>, WalletError> {
    if requested.is_empty() {
        return Err(WalletError::InvalidAmount("no destinations".into()));
    }
    let total_requested: u64 = requested
        .iter()
        .try_fold(0u64, |acc, r| acc.checked_add(*r))
        .ok_or_else(|| WalletError::InvalidAmount("requested total overflow".into()))?;
    if total_requested == 0 {
        return Err(WalletError::InvalidAmount("requested total is zero".into()));
    }

    let n = requested.len();
    let mut amounts = vec![0u64; n];
    let mut allocated: u64 = 0;

    for i in 0..n - 1 {
        let ratio = (requested[i] as u128) * (PROPORTION_PRECISION as u128)
            / (total_requested as u128);
        let share = ((available as u128) * ratio / (PROPORTION_PRECISION as u128)) as u64;
        let share = share.max(DUST_THRESHOLD);
        amounts[i] = share;
        allocated = allocated
            .checked_add(share)
            .ok_or_else(|| WalletError::InvalidAmount("allocation overflow".into()))?;
    }

    // The last destination takes the exact remainder.
    if allocated >= available {
        return Err(WalletError::InsufficientFunds {
            have: available,
            need: allocated + DUST_THRESHOLD,
        });
    }
    let last = available - allocated;
    if last < DUST_THRESHOLD {
        return Err(WalletError::InsufficientFunds {
            have: available,
            need: allocated + DUST_THRESHOLD,
        });
    }
    amounts[n - 1] = last;

    debug_assert_eq!(amounts.iter().sum::<u64>(), available);
    Ok(amounts)
}

/// Force `Σ amounts + fee == inputs_sum` by adjusting the last output.
pub fn balance_outputs(
    inputs_sum: u64,
    amounts: &mut [u64],
    fee: u64,
) -> Result<(), WalletError> {
    let Some(target) = inputs_sum.checked_sub(fee) else {
        return Err(WalletError::InsufficientFunds {
            have: inputs_sum,
            need: fee,
        });
    };
    let current: u64 = amounts.iter().sum();
    if current == target {
        return Ok(());
    }

    let last = amounts
        .last_mut()
        .ok_or_else(|| WalletError::InvalidAmount("no outputs to balance".into()))?;
    let adjusted = (*last as i128) + (target as i128) - (current as i128);
    if adjusted <= 0 {
        return Err(WalletError::InsufficientFunds {
            have: inputs_sum,
            need: current - *last + fee,
        });
    }
    *last = adjusted as u64;
    Ok(())
}

/// Full payout math: estimate, allocate, re-estimate on the final output
/// set, reallocate at most once if the fee grew, then balance to
/// exactness. Returns the destination amounts and the final fee.
pub async fn allocate_payout(
    rpc: &dyn ChainRpc,
    inputs: &[UtxoEntry],
    destinations: &[(Address, u64)],
) -> Result<(Vec<u64>, u64), WalletError> {
    let inputs_sum: u64 = inputs.iter().map(|e| e.amount).sum();
    let requested: Vec<u64> = destinations.iter().map(|(_, amount)| *amount).collect();

    // Initial estimate against the requested amounts.
    let first = estimate_fee(rpc, inputs, destinations).await;
    let available = inputs_sum
        .checked_sub(first.fee)
        .filter(|v| *v > 0)
        .ok_or(WalletError::InsufficientFunds {
            have: inputs_sum,
            need: first.fee,
        })?;

    let mut amounts = allocate_proportional(&requested, available)?;

    // Re-estimate with the allocated amounts; a larger output encoding can
    // nudge the mass up. At most one reallocation.
    let finalized: Vec<(Address, u64)> = destinations
        .iter()
        .zip(&amounts)
        .map(|((address, _), amount)| (address.clone(), *amount))
        .collect();
    let second = estimate_fee(rpc, inputs, &finalized).await;

    let fee = if second.fee > first.fee {
        let available = inputs_sum
            .checked_sub(second.fee)
            .filter(|v| *v > 0)
            .ok_or(WalletError::InsufficientFunds {
                have: inputs_sum,
                need: second.fee,
            })?;
        amounts = allocate_proportional(&requested, available)?;
        second.fee
    } else {
        first.fee
    };

    balance_outputs(inputs_sum, &mut amounts, fee)?;

    debug_assert_eq!(amounts.iter().sum::<u64>() + fee, inputs_sum);
    Ok((amounts, fee))
}
