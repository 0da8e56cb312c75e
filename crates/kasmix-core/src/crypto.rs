//! Ed25519 cryptographic operations for the Kasmix chain model.
//!
//! Provides key generation, whole-transaction signing, and signature
//! verification. Uses ed25519-dalek for the underlying Ed25519
//! implementation and BLAKE3 for signing hashes.
//!
//! # Signing scheme
//!
//! [`sign_transaction`] is the *whole-transaction* signer: given one key,
//! it walks every input and produces a signature script only on inputs
//! whose UTXO locking script belongs to that key. Callers that hold the
//! key for every input get a fully signed transaction; CoinJoin
//! participants get signature scripts exactly on their own inputs and
//! empty scripts everywhere else. Because all participants run the same
//! signer over the same canonical transaction, the produced script
//! encoding is bit-compatible across participants.
//!
//! The per-input **sighash** commits to:
//! - transaction version and lock_time
//! - every input's outpoint and sequence
//! - every spent UTXO's amount and locking script
//! - every output (amount + locking script)
//! - the index of the input being signed
//!
//! Signature scripts are excluded, so inputs can be signed independently
//! and in any order.

use ed25519_dalek::{Signer, Verifier};
use std::fmt;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::types::{Hash256, ScriptPublicKey, SignableTransaction};

/// Signature script layout: one push opcode followed by the 64-byte signature.
const OP_DATA_64: u8 = 0x40;
const SIGNATURE_SCRIPT_LEN: usize = 65;

/// Ed25519 keypair for signing transactions.
///
/// Wraps [`ed25519_dalek::SigningKey`]; the secret key is zeroized on drop
/// by the underlying library.
pub struct KeyPair {
    signing_key: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Generate a random keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    /// Create a keypair from 32-byte secret key material.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(&bytes),
        }
    }

    /// Parse a keypair from a 64-character hex secret key.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            hex::decode(s.trim()).map_err(|e| CryptoError::InvalidSecretKey(e.to_string()))?,
        );
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidSecretKey("secret key must be 32 bytes".into()))?;
        Ok(Self::from_secret_bytes(arr))
    }

    /// Derive the public key from this keypair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Get the raw secret key bytes (32 bytes). Handle with care.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Hex encoding of the secret key. Handle with care.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_bytes())
    }

    /// Sign a message, returning the raw 64-byte Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self::from_secret_bytes(self.secret_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Ed25519 public key for verifying signatures and deriving addresses.
#[derive(Clone)]
pub struct PublicKey {
    verifying_key: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    /// Create a public key from raw bytes (32 bytes).
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let vk = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { verifying_key: vk })
    }

    /// Get the raw public key bytes (32 bytes).
    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Verify an Ed25519 signature on a message.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        self.verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PublicKey {}

/// Compute the signing hash (sighash) for one input of a signable transaction.
pub fn signing_hash(
    signable: &SignableTransaction,
    input_index: usize,
) -> Result<Hash256, CryptoError> {
    let tx = &signable.transaction;
    if input_index >= tx.inputs.len() {
        return Err(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        });
    }
    if signable.entries.len() != tx.inputs.len() {
        return Err(CryptoError::EntryCountMismatch {
            inputs: tx.inputs.len(),
            entries: signable.entries.len(),
        });
    }

    let mut data = Vec::new();

    data.extend_from_slice(&tx.version.to_le_bytes());

    // All input outpoints and sequences, plus the spent UTXO's amount and
    // locking script (no signature scripts).
    data.extend_from_slice(&(tx.inputs.len() as u64).to_le_bytes());
    for (input, entry) in tx.inputs.iter().zip(&signable.entries) {
        data.extend_from_slice(input.previous_outpoint.transaction_id.as_bytes());
        data.extend_from_slice(&input.previous_outpoint.index.to_le_bytes());
        data.extend_from_slice(&input.sequence.to_le_bytes());
        data.extend_from_slice(&entry.amount.to_le_bytes());
        data.extend_from_slice(&entry.script_public_key.version.to_le_bytes());
        data.extend_from_slice(&(entry.script_public_key.script.len() as u64).to_le_bytes());
        data.extend_from_slice(&entry.script_public_key.script);
    }

    // All outputs
    data.extend_from_slice(&(tx.outputs.len() as u64).to_le_bytes());
    for output in &tx.outputs {
        data.extend_from_slice(&output.amount.to_le_bytes());
        data.extend_from_slice(&output.script_public_key.version.to_le_bytes());
        data.extend_from_slice(&(output.script_public_key.script.len() as u64).to_le_bytes());
        data.extend_from_slice(&output.script_public_key.script);
    }

    data.extend_from_slice(&tx.lock_time.to_le_bytes());
    data.extend_from_slice(&(input_index as u64).to_le_bytes());

    Ok(Hash256(blake3::hash(&data).into()))
}

/// The pay-to-pubkey locking script controlled by a public key.
pub fn script_for_public_key(public_key: &PublicKey) -> ScriptPublicKey {
    let mut script = Vec::with_capacity(34);
    script.push(0x20);
    script.extend_from_slice(&public_key.to_bytes());
    script.push(0xac);
    ScriptPublicKey { version: 0, script }
}

/// Sign every input of `signable` that the given keypair controls.
///
/// Writes a signature script into each matching input and returns the
/// indices that were signed. Inputs locked to other keys are left
/// untouched (empty signature script).
pub fn sign_transaction(
    signable: &mut SignableTransaction,
    keypair: &KeyPair,
) -> Result<Vec<usize>, CryptoError> {
    if signable.entries.len() != signable.transaction.inputs.len() {
        return Err(CryptoError::EntryCountMismatch {
            inputs: signable.transaction.inputs.len(),
            entries: signable.entries.len(),
        });
    }

    let own_script = script_for_public_key(&keypair.public_key());
    let mut signed = Vec::new();

    for index in 0..signable.transaction.inputs.len() {
        if signable.entries[index].script_public_key != own_script {
            continue;
        }
        let sighash = signing_hash(signable, index)?;
        let signature = keypair.sign(sighash.as_bytes());

        let mut script = Vec::with_capacity(SIGNATURE_SCRIPT_LEN);
        script.push(OP_DATA_64);
        script.extend_from_slice(&signature);
        signable.transaction.inputs[index].signature_script = script;
        signed.push(index);
    }

    Ok(signed)
}

/// Verify one input's signature script against its UTXO entry.
pub fn verify_input(
    signable: &SignableTransaction,
    input_index: usize,
) -> Result<(), CryptoError> {
    let tx = &signable.transaction;
    if input_index >= tx.inputs.len() {
        return Err(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        });
    }

    let script_sig = &tx.inputs[input_index].signature_script;
    if script_sig.len() != SIGNATURE_SCRIPT_LEN || script_sig[0] != OP_DATA_64 {
        return Err(CryptoError::InvalidSignatureScript);
    }
    let sig_bytes: [u8; 64] = script_sig[1..]
        .try_into()
        .map_err(|_| CryptoError::InvalidSignatureScript)?;

    // The public key lives in the pay-to-pubkey locking script.
    let spk = &signable.entries[input_index].script_public_key;
    if spk.script.len() != 34 {
        return Err(CryptoError::InvalidPublicKey);
    }
    let pk_bytes: [u8; 32] = spk.script[1..33]
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let pk = PublicKey::from_bytes(&pk_bytes)?;

    let sighash = signing_hash(signable, input_index)?;
    pk.verify(sighash.as_bytes(), &sig_bytes)
}
