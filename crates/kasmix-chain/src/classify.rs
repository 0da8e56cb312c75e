//! Node error-text classification.
//!
//! The node reports several conditions only as free-text error messages.
//! These are the two sanctioned stringly-typed detection paths
//! (`already in mempool`, `sequence lock`) plus a handful of readiness
//! and policy patterns; everything else stays `Other`.

use kasmix_core::types::TransactionId;

use crate::error::RpcError;

/// Map a node error message to a structured [`RpcError`].
pub fn classify(message: &str) -> RpcError {
    let lower = message.to_ascii_lowercase();

    if lower.contains("already in the mempool") || lower.contains("already in mempool") {
        return RpcError::AlreadyInMempool {
            tx_id: extract_tx_id(message),
        };
    }
    if lower.contains("sequence lock") {
        return RpcError::SequenceLockNotMet;
    }
    if lower.contains("already spent by transaction") && lower.contains("mempool") {
        return RpcError::OutputSpentInMempool;
    }
    if lower.contains("mass") && (lower.contains("exceed") || lower.contains("too large")) {
        return RpcError::MassExceeded(message.to_string());
    }
    if lower.contains("not synced") || lower.contains("syncing") || lower.contains("no peers") {
        return RpcError::NodeUnready(message.to_string());
    }
    if lower.contains("not found") {
        return RpcError::NotFound;
    }

    RpcError::Other(message.to_string())
}

/// Pull a 64-hex-character transaction id out of an error message, if any.
pub fn extract_tx_id(message: &str) -> Option<TransactionId> {
    for token in message.split(|c: char| !c.is_ascii_hexdigit()) {
        if token.len() == 64 {
            if let Ok(id) = TransactionId::from_hex(&token.to_ascii_lowercase()) {
                return Some(id);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use kasmix_core::types::Hash256;

    #[test]
    fn classifies_already_in_mempool_with_id() {
        let id = "ab".repeat(32);
        let msg = format!("Rejected transaction {id}: transaction is already in the mempool");
        match classify(&msg) {
            RpcError::AlreadyInMempool { tx_id: Some(t) } => {
                assert_eq!(t, Hash256([0xAB; 32]));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classifies_already_in_mempool_without_id() {
        match classify("transaction already in mempool") {
            RpcError::AlreadyInMempool { tx_id: None } => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classifies_sequence_lock() {
        assert_eq!(
            classify("rejected: sequence lock condition not satisfied"),
            RpcError::SequenceLockNotMet
        );
    }

    #[test]
    fn classifies_output_spent_in_mempool() {
        assert_eq!(
            classify("output 3f..:0 already spent by transaction x in the mempool"),
            RpcError::OutputSpentInMempool
        );
    }

    #[test]
    fn classifies_mass_exceeded() {
        assert!(matches!(
            classify("transaction mass of 120000 exceeds the maximum of 100000"),
            RpcError::MassExceeded(_)
        ));
    }

    #[test]
    fn classifies_node_unready() {
        assert!(matches!(
            classify("the node is not synced yet"),
            RpcError::NodeUnready(_)
        ));
    }

    #[test]
    fn classifies_not_found() {
        assert_eq!(classify("transaction not found"), RpcError::NotFound);
    }

    #[test]
    fn unknown_text_stays_other() {
        assert!(matches!(classify("mysterious failure"), RpcError::Other(_)));
    }

    #[test]
    fn extract_ignores_short_hex_runs() {
        assert_eq!(extract_tx_id("deadbeef is not an id"), None);
    }

    #[test]
    fn extract_finds_id_between_punctuation() {
        let id = "0f".repeat(32);
        let msg = format!("tx({id}) rejected");
        assert_eq!(extract_tx_id(&msg), Some(Hash256([0x0F; 32])));
    }

    #[test]
    fn extract_handles_uppercase_hex() {
        let id = "AB".repeat(32);
        let msg = format!("tx {id} duplicate");
        assert_eq!(extract_tx_id(&msg), Some(Hash256([0xAB; 32])));
    }
}
