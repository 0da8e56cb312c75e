//! Error types for the Kasmix chain model.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount: {0}")] Invalid(String),
    #[error("too many decimal places: {0}")] TooManyDecimals(usize),
    #[error("amount overflow")] Overflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid prefix: {0}")] UnknownNetwork(String),
    #[error("missing separator")] MissingSeparator,
    #[error("invalid length")] InvalidLength,
    #[error("invalid checksum")] InvalidChecksum,
    #[error("invalid character: {0}")] InvalidCharacter(char),
    #[error("invalid version: {0}")] InvalidVersion(u8),
    #[error("invalid padding bits")] InvalidPadding,
    #[error("mixed case")] MixedCase,
    #[error("empty prefix")] InvalidHrp,
    #[error("script is not pay-to-pubkey")] NotPayToPubkey,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature script")] InvalidSignatureScript,
    #[error("signature verification failed")] VerificationFailed,
    #[error("invalid secret key hex: {0}")] InvalidSecretKey(String),
    #[error("input index out of bounds: {index} >= {len}")] InputIndexOutOfBounds { index: usize, len: usize },
    #[error("input count does not match UTXO entry count: {inputs} != {entries}")]
    EntryCountMismatch { inputs: usize, entries: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("empty inputs or outputs")] EmptyInputsOrOutputs,
    #[error("value overflow")] ValueOverflow,
    #[error("serialization: {0}")] Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitmentError {
    #[error("invalid salt hex: {0}")] InvalidSalt(String),
    #[error("serialization: {0}")] Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error(transparent)] Amount(#[from] AmountError),
    #[error(transparent)] Address(#[from] AddressError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Commitment(#[from] CommitmentError),
}
