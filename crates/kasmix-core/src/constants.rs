//! Protocol and policy constants. All monetary values in sompi (1 KAS = 10^8 sompi).

pub const SOMPI_PER_KAS: u64 = 100_000_000;

/// Floor for any transaction fee, in sompi.
pub const MIN_FEE: u64 = 10_000;

/// Outputs below this are raised to it during allocation, in sompi.
pub const DUST_THRESHOLD: u64 = 1_000;

/// DAA-score distance required before a UTXO counts as confirmed.
pub const MIN_CONFIRMATIONS: u64 = 20;

/// Coinbase outputs need this many confirmations before they are spendable.
pub const COINBASE_MATURITY: u64 = 100;

/// How long a cached virtual DAA score stays fresh.
pub const DAA_CACHE_TTL_MS: u64 = 5_000;

/// Randomised payout delay bounds for mix sessions, milliseconds.
pub const MIN_PAYOUT_DELAY_MS: u64 = 60_000;
pub const MAX_PAYOUT_DELAY_MS: u64 = 120_000;

pub const MAX_MIX_DESTINATIONS: usize = 10;

/// Trusted CoinJoin entry amount and the slack accepted around it, sompi.
pub const FIXED_ENTRY: u64 = 100_000_000;
pub const ENTRY_TOLERANCE: u64 = 10_000;

pub const MIN_ZERO_TRUST_PARTICIPANTS: usize = 10;
pub const MIN_TRUSTED_PARTICIPANTS: usize = 20;
pub const MAX_OUTPUTS_PER_TX: usize = 20;

/// CoinJoin pool fee in basis points (100 = 1%).
pub const COINJOIN_FEE_BPS: u64 = 100;
pub const BPS_PRECISION: u64 = 10_000;

/// Window within which all zero-trust reveals must contribute equal amounts.
pub const POLICING_WINDOW_MS: u64 = 300_000;

/// Fixed-point precision for proportional payout allocation.
pub const PROPORTION_PRECISION: u64 = 1_000_000_000;

/// Period of the mix and CoinJoin monitors.
pub const MONITOR_PERIOD_MS: u64 = 10_000;

/// Period of the CoinJoin lobby cleanup task.
pub const LOBBY_CLEANUP_PERIOD_MS: u64 = 300_000;

/// Pending signing buffers older than this are considered stale.
pub const PENDING_TX_EXPIRY_MS: u64 = 600_000;

/// Wallet transaction history ring capacity.
pub const TX_HISTORY_CAP: usize = 1_000;

/// UTXO matching tolerance, percent of the target amount.
pub const UTXO_MATCH_TOLERANCE_PCT: u64 = 10;

/// UTXO confirmation polling defaults, milliseconds.
pub const UTXO_CONFIRM_TIMEOUT_MS: u64 = 60_000;
pub const UTXO_CONFIRM_POLL_MS: u64 = 2_000;

/// Sequence-lock submission retries and backoff cap.
pub const SEQUENCE_LOCK_RETRIES: u32 = 3;
pub const SEQUENCE_LOCK_BACKOFF_CAP_MS: u64 = 5_000;

/// Matching-UTXO creation retries and backoff step.
pub const MATCHING_UTXO_RETRIES: u32 = 3;
pub const MATCHING_UTXO_BACKOFF_STEP_MS: u64 = 3_000;

pub const DEFAULT_API_PORT: u16 = 18_771;
pub const DEFAULT_NODE_URL: &str = "ws://127.0.0.1:17110";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_entry_is_one_kas() {
        assert_eq!(FIXED_ENTRY, SOMPI_PER_KAS);
    }

    #[test]
    fn delay_bounds_ordered() {
        assert!(MIN_PAYOUT_DELAY_MS < MAX_PAYOUT_DELAY_MS);
    }

    #[test]
    fn coinjoin_fee_is_one_percent() {
        assert_eq!(FIXED_ENTRY * COINJOIN_FEE_BPS / BPS_PRECISION, FIXED_ENTRY / 100);
    }
}
