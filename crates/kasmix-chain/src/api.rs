//! The chain-RPC capability set consumed by the rest of the service.
//!
//! [`ChainRpc`] is the seam between Kasmix and the node: the engine,
//! wallet, and monitors only ever see this trait, which keeps them
//! testable against the in-memory [`crate::mock::MockNode`]. The concrete
//! network implementation is [`crate::client::NodeClient`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use kasmix_core::amount::sompi_string;
use kasmix_core::types::{Hash256, Transaction, TransactionId, UtxoEntry};

use crate::error::RpcError;

/// Snapshot of the node's DAG view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDagInfo {
    /// The virtual chain's current DAA score, the confirmation clock.
    pub virtual_daa_score: u64,
    /// Network name reported by the node (e.g. "kaspa-mainnet").
    pub network_name: String,
}

/// Fee-rate buckets in sompi per mass unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeEstimate {
    pub priority_feerate: u64,
    pub normal_feerate: u64,
    pub low_feerate: u64,
}

/// A mempool transaction touching one of the queried addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MempoolEntry {
    pub transaction: Transaction,
    #[serde(with = "sompi_string")]
    pub fee: u64,
    pub is_orphan: bool,
}

/// Best-effort transaction lookup result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub transaction: Transaction,
    /// DAA score of the accepting block; `None` while mempool-only.
    pub block_daa_score: Option<u64>,
}

/// Best-effort block lookup result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub hash: Hash256,
    pub daa_score: u64,
    pub transaction_ids: Vec<TransactionId>,
}

/// The capability set Kasmix needs from a chain node.
///
/// `get_transaction` and `get_block` are best-effort: nodes without the
/// relevant indices answer `Ok(None)`, and callers must fail cleanly
/// rather than guess.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// All UTXOs currently held by the given addresses.
    async fn get_utxos_by_addresses(&self, addresses: &[String])
        -> Result<Vec<UtxoEntry>, RpcError>;

    async fn get_block_dag_info(&self) -> Result<BlockDagInfo, RpcError>;

    async fn get_fee_estimate(&self) -> Result<FeeEstimate, RpcError>;

    /// Submit a fully signed transaction; returns its id.
    async fn submit_transaction(&self, tx: &Transaction) -> Result<TransactionId, RpcError>;

    /// Mempool transactions spending from or paying to the given addresses.
    async fn get_mempool_entries_by_addresses(
        &self,
        addresses: &[String],
    ) -> Result<Vec<MempoolEntry>, RpcError>;

    /// Look up a transaction by id. Best-effort.
    async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<TransactionRecord>, RpcError>;

    /// Look up a block by hash. Best-effort.
    async fn get_block(&self, hash: Hash256) -> Result<Option<RpcBlock>, RpcError>;
}
