//! # kasmix-session — Session records and their durable store.
//!
//! A session is the unit of user-visible state: one mixing request or one
//! CoinJoin participation. Records are tagged variants sharing a common
//! header, statuses form an explicit DAG, and the store enforces the
//! transitions plus the never-overwrite-an-intermediate-key rule on every
//! write.
//!
//! # Modules
//!
//! - [`error`] — `StoreError`
//! - [`record`] — session shapes, statuses, the pending-transaction buffer
//! - [`store`] — atomic `sessions.json` map store

pub mod error;
pub mod record;
pub mod store;

pub use error::StoreError;
pub use record::{
    CoinJoinSession, CoinJoinStatus, CoinJoinTxData, ContributionStats, Destination, MixSession,
    MixStatus, PendingTransaction, PlannedInput, PlannedOutput, Session, SessionId, SessionMeta,
    UtxoCommitment, now_millis,
};
pub use store::SessionStore;
