//! RPC error taxonomy.

use kasmix_core::types::TransactionId;
use thiserror::Error;

/// Structured failures surfaced by the chain RPC layer.
///
/// `AlreadyInMempool` and `SequenceLockNotMet` are recognised from node
/// error text (see [`crate::classify`]); everything the node reports only
/// as free text lands in `Other`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The node connection is down or could not be established.
    #[error("node disconnected: {0}")]
    Disconnected(String),

    /// The node is reachable but not ready to serve (syncing, no peers).
    #[error("node not ready: {0}")]
    NodeUnready(String),

    /// The requested object does not exist.
    #[error("not found")]
    NotFound,

    /// The submitted transaction is already in the mempool.
    ///
    /// Carries the transaction id when it could be extracted from the
    /// node's error text. Callers treat this as success.
    #[error("transaction already in mempool")]
    AlreadyInMempool { tx_id: Option<TransactionId> },

    /// A spent output's sequence lock has not matured yet. Transient.
    #[error("sequence lock not met")]
    SequenceLockNotMet,

    /// The transaction exceeds the standard mass ceiling.
    #[error("transaction mass exceeded: {0}")]
    MassExceeded(String),

    /// An input is already spent by another mempool transaction.
    #[error("output already spent by a mempool transaction")]
    OutputSpentInMempool,

    #[error("rpc error: {0}")]
    Other(String),
}

impl RpcError {
    /// True for failures worth retrying after a reconnect or short wait.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::Disconnected(_) | RpcError::NodeUnready(_) | RpcError::SequenceLockNotMet
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(RpcError::NotFound.to_string(), "not found");
        assert!(RpcError::Disconnected("x".into()).to_string().contains("x"));
    }

    #[test]
    fn transient_classification() {
        assert!(RpcError::SequenceLockNotMet.is_transient());
        assert!(RpcError::NodeUnready("syncing".into()).is_transient());
        assert!(!RpcError::AlreadyInMempool { tx_id: None }.is_transient());
        assert!(!RpcError::Other("boom".into()).is_transient());
    }
}
