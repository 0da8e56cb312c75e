//! # kasmix-wallet — Wallet substrate for the mixing and CoinJoin engines.
//!
//! Provides the durable single-record wallet store, key import (hex and
//! BIP-39 mnemonic), DAA-aware UTXO helpers, mass-based fee math with
//! proportional allocation, the transaction builder, and the high-level
//! wallet operations the service API exposes.
//!
//! # Modules
//!
//! - [`error`] — `WalletError` enum
//! - [`store`] — `wallet.json` record store with history ring and address book
//! - [`keys`] — key generation and import
//! - [`utxo`] — DAA score cache, confirmation filter, matching-UTXO search
//! - [`fee`] — fee estimation, proportional allocation, exact balancing
//! - [`builder`] — transaction composition, signing, submission
//! - [`wallet`] — high-level wallet composition

pub mod builder;
pub mod error;
pub mod fee;
pub mod keys;
pub mod store;
pub mod utxo;
pub mod wallet;

// Re-exports for convenient access
pub use builder::BuiltTransaction;
pub use error::WalletError;
pub use fee::FeeBreakdown;
pub use keys::ImportedKey;
pub use store::{AddressBookEntry, TxHistoryEntry, WalletRecord, WalletStore};
pub use utxo::UtxoManager;
pub use wallet::{SendEstimate, SendResult, Wallet, WalletBalance};
