//! Chain-model types: hashes, outpoints, transactions, UTXO entries.
//!
//! All monetary values are in sompi (1 KAS = 10^8 sompi) and serialise as
//! decimal strings (see [`crate::amount::sompi_string`]). Wire-facing
//! structs use camelCase field names matching the node's JSON shapes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::amount::sompi_string;
use crate::error::TransactionError;

/// A 32-byte hash value, rendered as 64 hex characters in JSON.
///
/// Used for transaction IDs (BLAKE3 of the canonical encoding) and
/// signing hashes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, bincode::Encode, bincode::Decode)]
pub struct Hash256(pub [u8; 32]);

/// Transaction IDs are plain 32-byte hashes.
pub type TransactionId = Hash256;

impl Hash256 {
    /// The zero hash (32 zero bytes).
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TransactionError> {
        let bytes = hex::decode(s)
            .map_err(|e| TransactionError::Serialization(format!("invalid hash hex: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TransactionError::Serialization("hash must be 32 bytes".into()))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for byte vectors rendered as hex strings.
pub mod hex_bytes {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(D::Error::custom)
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "camelCase")]
pub struct Outpoint {
    /// Transaction ID containing the referenced output.
    pub transaction_id: TransactionId,
    /// Index of the output within the transaction.
    pub index: u32,
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transaction_id, self.index)
    }
}

/// The locking script of an output.
///
/// Kasmix only produces pay-to-pubkey scripts (`OP_DATA_32 <pubkey>
/// OP_CHECKSIG`), but carries foreign scripts opaquely.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "camelCase")]
pub struct ScriptPublicKey {
    pub version: u16,
    #[serde(with = "hex_bytes")]
    pub script: Vec<u8>,
}

/// A transaction input, spending a previous output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "camelCase")]
pub struct TxInput {
    /// The outpoint being spent.
    pub previous_outpoint: Outpoint,
    /// Unlocking script. Empty until the input is signed.
    #[serde(with = "hex_bytes", default)]
    pub signature_script: Vec<u8>,
    /// Sequence-lock field.
    pub sequence: u64,
}

/// A transaction output, creating a new UTXO.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "camelCase")]
pub struct TxOutput {
    /// Value in sompi.
    #[serde(with = "sompi_string")]
    pub amount: u64,
    pub script_public_key: ScriptPublicKey,
}

/// A transaction transferring value between addresses.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub version: u16,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u64,
}

impl Transaction {
    /// Compute the transaction ID.
    ///
    /// BLAKE3 over the canonical bincode encoding with all signature
    /// scripts stripped, so the ID is stable across signing.
    pub fn id(&self) -> Result<TransactionId, TransactionError> {
        let mut stripped = self.clone();
        for input in &mut stripped.inputs {
            input.signature_script.clear();
        }
        let encoded = bincode::encode_to_vec(&stripped, bincode::config::standard())
            .map_err(|e| TransactionError::Serialization(e.to_string()))?;
        Ok(Hash256(blake3::hash(&encoded).into()))
    }

    /// Sum of all output values. Fails on overflow.
    pub fn total_output_amount(&self) -> Result<u64, TransactionError> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.amount))
            .ok_or(TransactionError::ValueOverflow)
    }

    /// True once every input carries a non-empty signature script.
    pub fn is_fully_signed(&self) -> bool {
        !self.inputs.is_empty() && self.inputs.iter().all(|i| !i.signature_script.is_empty())
    }
}

/// An unspent transaction output together with its chain context.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UtxoEntry {
    pub outpoint: Outpoint,
    #[serde(with = "sompi_string")]
    pub amount: u64,
    pub script_public_key: ScriptPublicKey,
    /// DAA score of the accepting block; 0 while unconfirmed.
    pub block_daa_score: u64,
    pub is_coinbase: bool,
}

impl UtxoEntry {
    /// Confirmation count relative to the current virtual DAA score.
    ///
    /// An entry with `block_daa_score == 0` is mempool-only and has no
    /// confirmations regardless of the current score.
    pub fn confirmations(&self, current_daa_score: u64) -> u64 {
        if self.block_daa_score == 0 {
            return 0;
        }
        current_daa_score.saturating_sub(self.block_daa_score)
    }

    /// The canonical serialized triple used by the commitment scheme.
    pub fn serialized(&self) -> SerializedUtxo {
        SerializedUtxo {
            transaction_id: self.outpoint.transaction_id,
            index: self.outpoint.index,
            amount: self.amount,
        }
    }
}

/// The canonical UTXO triple `{transactionId, index, amount}`.
///
/// This is the form participants commit to and reveal. Serialisation is
/// canonical (field order as declared, amount as a decimal string);
/// deserialisation additionally accepts the `outpoint`-nested shape some
/// callers send and normalises it.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct SerializedUtxo {
    pub transaction_id: TransactionId,
    pub index: u32,
    #[serde(with = "sompi_string")]
    pub amount: u64,
}

impl SerializedUtxo {
    pub fn outpoint(&self) -> Outpoint {
        Outpoint {
            transaction_id: self.transaction_id,
            index: self.index,
        }
    }

    /// The canonical JSON form hashed by the commitment scheme.
    pub fn canonical_json(&self) -> Result<String, TransactionError> {
        serde_json::to_string(self).map_err(|e| TransactionError::Serialization(e.to_string()))
    }
}

impl<'de> Deserialize<'de> for SerializedUtxo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Flat {
            transaction_id: TransactionId,
            index: u32,
            #[serde(with = "sompi_string")]
            amount: u64,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Nested {
            outpoint: Outpoint,
            #[serde(with = "sompi_string")]
            amount: u64,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Shape {
            Flat(Flat),
            Nested(Nested),
        }

        match Shape::deserialize(deserializer)? {
            Shape::Flat(f) => Ok(Self {
                transaction_id: f.transaction_id,
                index: f.index,
                amount: f.amount,
            }),
            Shape::Nested(n) => Ok(Self {
                transaction_id: n.outpoint.transaction_id,
                index: n.outpoint.index,
                amount: n.amount,
            }),
        }
    }
}

/// A transaction paired with the UTXO entries its inputs spend.
///
/// The signer needs each input's locking script to decide which inputs a
/// given key can satisfy, so entries travel alongside the transaction
/// until it is fully signed. `entries[i]` corresponds to `inputs[i]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignableTransaction {
    pub transaction: Transaction,
    pub entries: Vec<UtxoEntry>,
}

impl SignableTransaction {
    pub fn new(transaction: Transaction, entries: Vec<UtxoEntry>) -> Self {
        Self { transaction, entries }
    }

    /// Sum of the spent input amounts. Fails on overflow.
    pub fn total_input_amount(&self) -> Result<u64, TransactionError> {
        self.entries
            .iter()
            .try_fold(0u64, |acc, e| acc.checked_add(e.amount))
            .ok_or(TransactionError::ValueOverflow)
    }
}
