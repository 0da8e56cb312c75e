//! # kasmix-chain — Chain-node RPC access for Kasmix.
//!
//! Defines the [`ChainRpc`] capability trait consumed by every component
//! that talks to the chain, a jsonrpsee WebSocket implementation against
//! the node's JSON-RPC wire format, and the error-text classification that
//! turns the node's stringly-typed failures into structured variants.
//!
//! # Modules
//!
//! - [`error`] — `RpcError`
//! - [`api`] — `ChainRpc` trait and response records
//! - [`classify`] — node error-text classification
//! - [`client`] — `NodeClient` over jsonrpsee WebSocket
//! - [`mock`] — scriptable in-memory node (feature `testing`)

pub mod api;
pub mod classify;
pub mod client;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub use api::{BlockDagInfo, ChainRpc, FeeEstimate, MempoolEntry, RpcBlock, TransactionRecord};
pub use client::NodeClient;
pub use error::RpcError;
#[cfg(any(test, feature = "testing"))]
pub use mock::MockNode;
