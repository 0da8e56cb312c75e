//! SHA-256 commit/reveal primitives for the zero-trust CoinJoin protocol.
//!
//! A commitment binds a participant to a UTXO or destination address
//! without disclosing it: `commit = SHA-256(payload || salt)` where the
//! payload is the canonical JSON of the UTXO triple (or the address
//! string's bytes) and the salt is 32 CSPRNG bytes. Commitments and salts
//! travel as hex strings.

use sha2::{Digest, Sha256};

use crate::error::CommitmentError;
use crate::types::SerializedUtxo;

/// Byte length of commitment salts.
pub const SALT_LEN: usize = 32;

/// Draw a fresh salt from the OS cryptographic RNG, hex-encoded.
pub fn random_salt() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Commit to an arbitrary payload with a hex salt.
pub fn commit_bytes(payload: &[u8], salt_hex: &str) -> Result<String, CommitmentError> {
    let salt = hex::decode(salt_hex).map_err(|e| CommitmentError::InvalidSalt(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(&salt);
    Ok(hex::encode(hasher.finalize()))
}

/// Commit to a UTXO via its canonical JSON triple.
pub fn commit_utxo(utxo: &SerializedUtxo, salt_hex: &str) -> Result<String, CommitmentError> {
    let canonical = utxo
        .canonical_json()
        .map_err(|e| CommitmentError::Serialization(e.to_string()))?;
    commit_bytes(canonical.as_bytes(), salt_hex)
}

/// Commit to a destination address string.
pub fn commit_destination(address: &str, salt_hex: &str) -> Result<String, CommitmentError> {
    commit_bytes(address.as_bytes(), salt_hex)
}

/// Recompute and compare. Any error in recomputation counts as mismatch.
pub fn verify_utxo_commitment(utxo: &SerializedUtxo, salt_hex: &str, expected: &str) -> bool {
    match commit_utxo(utxo, salt_hex) {
        Ok(c) => c == expected,
        Err(_) => false,
    }
}

/// Recompute and compare a destination commitment.
pub fn verify_destination_commitment(address: &str, salt_hex: &str, expected: &str) -> bool {
    match commit_destination(address, salt_hex) {
        Ok(c) => c == expected,
        Err(_) => false,
    }
}
