//! Engine error taxonomy.
//!
//! Every public engine operation surfaces one of these. `code()` yields
//! the bracket tag written into a session's `error` field and returned to
//! API clients.

use kasmix_chain::RpcError;
use kasmix_session::StoreError;
use kasmix_wallet::WalletError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed request: bad address, non-positive amount, destination
    /// sum mismatch, wrong mode, too many destinations.
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("not found")]
    NotFound,

    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },

    #[error("node not ready: {0}")]
    NodeUnready(String),

    #[error("no confirmed UTXOs at {0}")]
    NoConfirmed(String),

    /// A revealed UTXO cannot be located on chain or in the mempool.
    #[error("cannot resolve UTXO: {0}")]
    UtxoUnresolved(String),

    /// Zero-trust equal-amount policing failed; exact match required.
    #[error("contribution mismatch: expected {expected}, got {actual}")]
    ContributionMismatch { expected: u64, actual: u64 },

    /// A reveal does not match its commitment or destination hash.
    #[error("commitment verification failed: {0}")]
    CommitmentInvalid(String),

    /// A second reveal diverged from the recorded one.
    #[error("session already revealed with different payload")]
    AlreadyRevealed,

    /// The signer produced no signature for an input the session claims.
    #[error("key does not match claimed inputs: {0}")]
    KeyUtxoMismatch(String),

    /// Cached signatures no longer match the candidate transaction.
    #[error("pending transaction hash mismatch")]
    TxHashMismatch,

    #[error("sequence lock not met")]
    SequenceLockNotMet,

    /// Too large for standard mempool policy; carries remediation text.
    #[error("transaction mass {mass} exceeds {max}; {recommendation}")]
    MassExceeded {
        mass: u64,
        max: u64,
        recommendation: String,
    },

    /// The session is locked by a concurrent build/sign/submit window.
    #[error("session busy")]
    SessionBusy,

    #[error("not enough participants: have {have}, need {need}")]
    NotEnoughParticipants { have: usize, need: usize },

    /// Unrecoverable on-chain situation discovered during recovery.
    #[error("recovery failed: {0}")]
    Recovery(String),

    /// Final-step payout failure before submission.
    #[error("payout failed: {0}")]
    Payout(String),

    /// Deposit-to-intermediate forwarding failure.
    #[error("intermediate send failed: {0}")]
    IntermediateSend(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl EngineError {
    /// The bracket tag used in session error fields and API errors.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::BadInput(_) => "E_BAD_INPUT",
            EngineError::NotFound => "E_NOT_FOUND",
            EngineError::InsufficientFunds { .. } => "E_INSUFFICIENT_FUNDS",
            EngineError::NodeUnready(_) => "E_NODE_UNREADY",
            EngineError::NoConfirmed(_) => "E_NO_CONFIRMED",
            EngineError::UtxoUnresolved(_) => "E_UTXO_UNRESOLVED",
            EngineError::ContributionMismatch { .. } => "E_CONTRIBUTION_MISMATCH",
            EngineError::CommitmentInvalid(_) => "E_COMMITMENT_INVALID",
            EngineError::AlreadyRevealed => "E_ALREADY_REVEALED",
            EngineError::KeyUtxoMismatch(_) => "E_KEY_UTXO_MISMATCH",
            EngineError::TxHashMismatch => "E_TX_HASH_MISMATCH",
            EngineError::SequenceLockNotMet => "E_SEQUENCE_LOCK",
            EngineError::MassExceeded { .. } => "E_MASS_EXCEEDED",
            EngineError::SessionBusy => "E_SESSION_BUSY",
            EngineError::NotEnoughParticipants { .. } => "E_NOT_ENOUGH_PARTICIPANTS",
            EngineError::Recovery(_) => "E_RECOVERY",
            EngineError::Payout(_) => "E_PAYOUT",
            EngineError::IntermediateSend(_) => "E_INTERMEDIATE_SEND",
            EngineError::Store(_) => "E_STORE",
            EngineError::Wallet(WalletError::InsufficientFunds { .. }) => "E_INSUFFICIENT_FUNDS",
            EngineError::Wallet(WalletError::NoConfirmed(_)) => "E_NO_CONFIRMED",
            EngineError::Wallet(_) => "E_WALLET",
            EngineError::Rpc(_) => "E_RPC",
        }
    }

    /// The `[E_CODE] message` form persisted on failed sessions.
    pub fn tagged(&self) -> String {
        format!("[{}] {}", self.code(), self)
    }

    /// Transient node conditions that should not poison a session.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::NodeUnready(_) | EngineError::SequenceLockNotMet => true,
            EngineError::Rpc(e) => e.is_transient(),
            EngineError::Wallet(WalletError::Rpc(e)) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_format() {
        let e = EngineError::Payout("no confirmed UTXOs".into());
        assert_eq!(e.tagged(), "[E_PAYOUT] payout failed: no confirmed UTXOs");
    }

    #[test]
    fn recovery_tag_matches_contract() {
        let e = EngineError::Recovery("funds stuck, key missing".into());
        assert!(e.tagged().starts_with("[E_RECOVERY]"));
    }

    #[test]
    fn transient_classification() {
        assert!(EngineError::NodeUnready("syncing".into()).is_transient());
        assert!(EngineError::Rpc(RpcError::Disconnected("x".into())).is_transient());
        assert!(
            EngineError::Wallet(WalletError::Rpc(RpcError::NodeUnready("y".into())))
                .is_transient()
        );
        assert!(!EngineError::NotFound.is_transient());
        assert!(!EngineError::BadInput("x".into()).is_transient());
    }

    #[test]
    fn wallet_insufficient_funds_keeps_code() {
        let e = EngineError::Wallet(WalletError::InsufficientFunds { have: 1, need: 2 });
        assert_eq!(e.code(), "E_INSUFFICIENT_FUNDS");
    }
}
