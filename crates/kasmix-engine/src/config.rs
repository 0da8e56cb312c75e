//! Engine policy configuration.
//!
//! Protocol constants that are genuinely policy (participant minimums,
//! the equal-amount policing window, the trusted-pool custody material)
//! are configuration here, defaulting to the documented values.

use kasmix_core::address::Network;
use kasmix_core::constants::{
    COINJOIN_FEE_BPS, ENTRY_TOLERANCE, FIXED_ENTRY, MAX_OUTPUTS_PER_TX, MAX_PAYOUT_DELAY_MS,
    MIN_PAYOUT_DELAY_MS, MIN_TRUSTED_PARTICIPANTS, MIN_ZERO_TRUST_PARTICIPANTS,
    POLICING_WINDOW_MS,
};

/// Policy knobs for the mixing and CoinJoin engines.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub network: Network,
    /// Minimum revealed sessions for a zero-trust build.
    pub min_zero_trust: usize,
    /// Minimum entered sessions before the trusted batcher runs.
    pub min_trusted: usize,
    /// Window within which zero-trust reveals must contribute equally.
    pub policing_window_ms: u64,
    /// Trusted-mode fixed entry amount, sompi.
    pub entry_amount: u64,
    /// Accepted slack around the entry amount, sompi.
    pub entry_tolerance: u64,
    /// Pool fee in basis points.
    pub coinjoin_fee_bps: u64,
    pub max_outputs_per_tx: usize,
    /// Randomised mix payout delay bounds, milliseconds.
    pub min_payout_delay_ms: u64,
    pub max_payout_delay_ms: u64,
    /// Operator pool address for trusted mode.
    pub pool_address: Option<String>,
    /// Operator pool key; the batcher idles without it. How the operator
    /// holds this key (HSM, vault, prompt) is outside the engine.
    pub pool_private_key: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            min_zero_trust: MIN_ZERO_TRUST_PARTICIPANTS,
            min_trusted: MIN_TRUSTED_PARTICIPANTS,
            policing_window_ms: POLICING_WINDOW_MS,
            entry_amount: FIXED_ENTRY,
            entry_tolerance: ENTRY_TOLERANCE,
            coinjoin_fee_bps: COINJOIN_FEE_BPS,
            max_outputs_per_tx: MAX_OUTPUTS_PER_TX,
            min_payout_delay_ms: MIN_PAYOUT_DELAY_MS,
            max_payout_delay_ms: MAX_PAYOUT_DELAY_MS,
            pool_address: None,
            pool_private_key: None,
        }
    }
}
