//! Transaction mass computation.
//!
//! Mass is the chain's abstract size metric: the canonical encoded size in
//! bytes plus a fixed surcharge per signature operation. Fee rates are
//! quoted in sompi per mass unit, so fee = feerate × mass.

use crate::types::Transaction;

/// Mass charged per input signature operation, on top of encoded bytes.
pub const MASS_PER_SIGOP: u64 = 1_000;

/// Largest mass accepted by standard mempool policy.
pub const MAXIMUM_STANDARD_MASS: u64 = 100_000;

/// Conservative per-input / per-output figures for estimating mass before
/// a concrete transaction exists.
pub const ESTIMATED_MASS_PER_INPUT: u64 = 4_000;
pub const ESTIMATED_MASS_PER_OUTPUT: u64 = 150;

/// Compute the mass of a concrete transaction.
///
/// Signature scripts count toward the byte size, so unsigned candidates
/// weigh slightly less than their final form; the per-sigop surcharge
/// keeps the estimate conservative enough that a fee computed from an
/// unsigned candidate still clears the signed transaction.
pub fn calculate_mass(tx: &Transaction) -> u64 {
    let encoded_len = bincode::encode_to_vec(tx, bincode::config::standard())
        .map(|v| v.len() as u64)
        // Encoding a well-formed transaction cannot fail; fall back to the
        // structural estimate if it somehow does.
        .unwrap_or_else(|_| estimate_mass(tx.inputs.len(), tx.outputs.len()));

    encoded_len + MASS_PER_SIGOP * tx.inputs.len() as u64
}

/// Structural mass estimate from input/output counts alone.
pub fn estimate_mass(num_inputs: usize, num_outputs: usize) -> u64 {
    ESTIMATED_MASS_PER_INPUT * num_inputs as u64 + ESTIMATED_MASS_PER_OUTPUT * num_outputs as u64
}
