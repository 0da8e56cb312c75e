//! Wallet error types.

use kasmix_chain::RpcError;
use kasmix_core::error::{AddressError, AmountError, CryptoError};
use thiserror::Error;

/// Errors that can occur in wallet operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// No wallet record has been imported yet.
    #[error("no wallet imported")]
    NoWallet,

    /// Insufficient funds to cover the transaction amount plus fees.
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds {
        /// Available balance in sompi.
        have: u64,
        /// Required amount in sompi.
        need: u64,
    },

    /// No UTXOs available for spending.
    #[error("no UTXOs available")]
    NoUtxos,

    /// Expected confirmed UTXOs are absent at the given address.
    #[error("no confirmed UTXOs at {0}")]
    NoConfirmed(String),

    /// Invalid monetary amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Invalid address string.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid private key material.
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// Invalid BIP-39 mnemonic phrase.
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    /// Wallet file is corrupted or has invalid format.
    #[error("corrupted wallet file: {0}")]
    CorruptedFile(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Atomic store write failed.
    #[error("wallet store write failed: {0}")]
    WriteFailed(String),

    /// Transaction exceeds the standard mass ceiling.
    #[error("transaction mass {mass} exceeds standard maximum {max}")]
    MassExceeded { mass: u64, max: u64 },

    /// Gave up waiting for a UTXO to confirm.
    #[error("timed out waiting for UTXO confirmation")]
    ConfirmationTimeout,

    /// Cryptographic error from kasmix-core.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Address error from kasmix-core.
    #[error(transparent)]
    Address(#[from] AddressError),

    /// Amount parsing error from kasmix-core.
    #[error(transparent)]
    Amount(#[from] AmountError),

    /// RPC failure from the chain layer.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_insufficient_funds() {
        let e = WalletError::InsufficientFunds { have: 100, need: 200 };
        assert_eq!(e.to_string(), "insufficient funds: have 100, need 200");
    }

    #[test]
    fn from_rpc_error() {
        let e: WalletError = RpcError::NotFound.into();
        assert_eq!(e, WalletError::Rpc(RpcError::NotFound));
    }

    #[test]
    fn from_crypto_error() {
        let e: WalletError = CryptoError::InvalidPublicKey.into();
        assert_eq!(e, WalletError::Crypto(CryptoError::InvalidPublicKey));
    }
}
