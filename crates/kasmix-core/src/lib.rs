//! # kasmix-core — Chain-model types and primitives for Kasmix.
//!
//! Models the subset of the Kaspa-style chain that the mixing and CoinJoin
//! engines need: hashes, outpoints, transactions, UTXO entries, addresses,
//! transaction mass, and the whole-transaction signer. Also provides the
//! commitment scheme used by the zero-trust CoinJoin protocol and the
//! decimal-string amount encoding used at every storage and wire boundary.
//!
//! # Modules
//!
//! - [`error`] — per-concern error enums
//! - [`constants`] — protocol and policy constants
//! - [`amount`] — sompi arithmetic and decimal-string serde
//! - [`types`] — hashes, outpoints, transactions, UTXO entries
//! - [`address`] — Bech32m address codec and script mapping
//! - [`crypto`] — Ed25519 keypairs and transaction signing
//! - [`mass`] — transaction mass computation
//! - [`commitment`] — SHA-256 commit/reveal primitives

pub mod address;
pub mod amount;
pub mod commitment;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod mass;
pub mod types;

// Re-exports for convenient access
pub use address::{Address, Network};
pub use amount::{kas_to_sompi, sompi_to_kas_string};
pub use crypto::{KeyPair, PublicKey};
pub use error::CoreError;
pub use types::{
    Hash256, Outpoint, ScriptPublicKey, SerializedUtxo, SignableTransaction, Transaction,
    TransactionId, TxInput, TxOutput, UtxoEntry,
};
