//! Session store error types.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store file exists but cannot be parsed. Never silently treated
    /// as an empty map.
    #[error("store corrupt: {0}")]
    Corrupt(String),

    #[error("store write failed: {0}")]
    WriteFailed(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// A write attempted a status edge that is not in the session DAG.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A write attempted to replace an already persisted intermediate key.
    #[error("intermediate key is write-once")]
    IntermediateKeyOverwrite,

    /// A write attempted to change a session's variant (mix vs coinjoin).
    #[error("session type is immutable")]
    TypeMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_transition() {
        let e = StoreError::InvalidTransition {
            from: "confirmed".into(),
            to: "waiting_deposit".into(),
        };
        assert_eq!(e.to_string(), "invalid status transition: confirmed -> waiting_deposit");
    }
}
