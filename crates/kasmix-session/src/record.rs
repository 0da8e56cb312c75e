//! Session record shapes and status machines.
//!
//! Sessions are tagged variants (`mix` / `coinjoin`) sharing a flattened
//! header. Statuses are explicit enums whose DAG is encoded in
//! `may_transition_to`: forward edges only, with `error` reachable from
//! anywhere. All amounts persist as decimal strings.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use kasmix_core::amount::{sompi_string, sompi_string_opt};
use kasmix_core::types::{Outpoint, ScriptPublicKey, SerializedUtxo};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Opaque 128-bit session identifier, hex-encoded.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Draw a fresh identifier from the OS cryptographic RNG.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fields shared by every session variant.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionMeta {
    pub id: SessionId,
    pub created_at: u64,
    pub updated_at: u64,
    /// Tagged error string (`[E_CODE] message`); presence implies a
    /// terminal error state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionMeta {
    pub fn new() -> Self {
        let now = now_millis();
        Self {
            id: SessionId::generate(),
            created_at: now,
            updated_at: now,
            error: None,
        }
    }
}

impl Default for SessionMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Mix session lifecycle.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MixStatus {
    WaitingDeposit,
    DepositReceived,
    SentToIntermediate,
    IntermediateConfirmed,
    Confirmed,
    Error,
}

impl MixStatus {
    /// Forward edges of the status DAG. `Error` is reachable from any
    /// state; nothing leaves `Confirmed` or `Error`.
    pub fn may_transition_to(self, next: MixStatus) -> bool {
        use MixStatus::*;
        if next == Error {
            return self != Error;
        }
        matches!(
            (self, next),
            (WaitingDeposit, DepositReceived)
                | (DepositReceived, SentToIntermediate)
                | (SentToIntermediate, IntermediateConfirmed)
                | (IntermediateConfirmed, Confirmed)
                // Recovery may fast-forward past states it can prove on-chain.
                | (WaitingDeposit, SentToIntermediate)
                | (WaitingDeposit, IntermediateConfirmed)
                | (DepositReceived, IntermediateConfirmed)
                | (SentToIntermediate, Confirmed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MixStatus::Confirmed | MixStatus::Error)
    }

    pub fn name(self) -> &'static str {
        match self {
            MixStatus::WaitingDeposit => "waiting_deposit",
            MixStatus::DepositReceived => "deposit_received",
            MixStatus::SentToIntermediate => "sent_to_intermediate",
            MixStatus::IntermediateConfirmed => "intermediate_confirmed",
            MixStatus::Confirmed => "confirmed",
            MixStatus::Error => "error",
        }
    }
}

/// CoinJoin session lifecycle, covering both sub-protocols.
///
/// Trusted mode walks `waiting_deposit → entered → ready_for_batch →
/// completed`; zero-trust walks `committed → revealed → completed`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoinJoinStatus {
    WaitingDeposit,
    Entered,
    ReadyForBatch,
    Committed,
    Revealed,
    Completed,
    Error,
}

impl CoinJoinStatus {
    pub fn may_transition_to(self, next: CoinJoinStatus) -> bool {
        use CoinJoinStatus::*;
        if next == Error {
            return self != Error;
        }
        matches!(
            (self, next),
            (WaitingDeposit, Entered)
                | (Entered, ReadyForBatch)
                | (ReadyForBatch, Completed)
                | (Committed, Revealed)
                | (Revealed, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CoinJoinStatus::Completed | CoinJoinStatus::Error)
    }

    pub fn name(self) -> &'static str {
        match self {
            CoinJoinStatus::WaitingDeposit => "waiting_deposit",
            CoinJoinStatus::Entered => "entered",
            CoinJoinStatus::ReadyForBatch => "ready_for_batch",
            CoinJoinStatus::Committed => "committed",
            CoinJoinStatus::Revealed => "revealed",
            CoinJoinStatus::Completed => "completed",
            CoinJoinStatus::Error => "error",
        }
    }
}

/// A payout destination: address plus its requested share.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub address: String,
    #[serde(with = "sompi_string")]
    pub amount: u64,
}

/// A mixing session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MixSession {
    #[serde(flatten)]
    pub meta: SessionMeta,
    pub status: MixStatus,
    #[serde(with = "sompi_string")]
    pub amount: u64,
    pub destinations: Vec<Destination>,
    pub deposit_address: String,
    pub deposit_private_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_private_key: Option<String>,
    #[serde(with = "sompi_string_opt", default, skip_serializing_if = "Option::is_none")]
    pub received_amount: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_tx_id: Option<String>,
    #[serde(default)]
    pub intermediate_confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_delay_until: Option<u64>,
    #[serde(default)]
    pub payout_tx_ids: Vec<String>,
}

impl MixSession {
    pub fn new(
        amount: u64,
        destinations: Vec<Destination>,
        deposit_address: String,
        deposit_private_key: String,
    ) -> Self {
        Self {
            meta: SessionMeta::new(),
            status: MixStatus::WaitingDeposit,
            amount,
            destinations,
            deposit_address,
            deposit_private_key,
            intermediate_address: None,
            intermediate_private_key: None,
            received_amount: None,
            intermediate_tx_id: None,
            intermediate_confirmed: false,
            intermediate_delay_until: None,
            payout_tx_ids: vec![],
        }
    }

    /// True once the session has spent toward its destinations; no further
    /// spending is ever allowed afterwards.
    pub fn has_paid_out(&self) -> bool {
        !self.payout_tx_ids.is_empty()
    }
}

/// One salted UTXO commitment.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UtxoCommitment {
    pub commitment: String,
    pub salt: String,
}

/// A planned CoinJoin input: the resolved UTXO plus where it was found.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlannedInput {
    pub outpoint: Outpoint,
    #[serde(with = "sompi_string")]
    pub amount: u64,
    pub script_public_key: ScriptPublicKey,
    pub block_daa_score: u64,
    pub is_coinbase: bool,
    pub source_address: String,
}

/// A planned CoinJoin output (all outputs carry the same amount).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlannedOutput {
    pub address: String,
    #[serde(with = "sompi_string")]
    pub amount: u64,
}

/// Per-session contribution spread of a build.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContributionStats {
    #[serde(with = "sompi_string")]
    pub min: u64,
    #[serde(with = "sompi_string")]
    pub max: u64,
    #[serde(with = "sompi_string")]
    pub total: u64,
}

/// The candidate transaction circulated between CoinJoin participants.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CoinJoinTxData {
    pub inputs: Vec<PlannedInput>,
    pub outputs: Vec<PlannedOutput>,
    #[serde(with = "sompi_string")]
    pub fee: u64,
    #[serde(with = "sompi_string")]
    pub total_input: u64,
    #[serde(with = "sompi_string")]
    pub total_output: u64,
    pub participants: usize,
    pub session_ids: Vec<SessionId>,
    /// For each input index, every session that claims that input.
    pub input_owners: BTreeMap<u32, Vec<SessionId>>,
    pub contribution_stats: ContributionStats,
}

impl CoinJoinTxData {
    /// SHA-256 content hash binding signatures to this exact candidate.
    ///
    /// Covers the input outpoints, the outputs (address + decimal amount),
    /// the fee, and the participating session ids. Any divergence in the
    /// rebuilt candidate produces a different hash, which invalidates
    /// cached signatures.
    pub fn content_hash(&self) -> String {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct HashedInput {
            transaction_id: String,
            index: u32,
        }
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct HashedView<'a> {
            inputs: Vec<HashedInput>,
            outputs: Vec<(&'a str, String)>,
            fee: String,
            session_ids: &'a [SessionId],
        }

        let view = HashedView {
            inputs: self
                .inputs
                .iter()
                .map(|i| HashedInput {
                    transaction_id: i.outpoint.transaction_id.to_string(),
                    index: i.outpoint.index,
                })
                .collect(),
            outputs: self
                .outputs
                .iter()
                .map(|o| (o.address.as_str(), o.amount.to_string()))
                .collect(),
            fee: self.fee.to_string(),
            session_ids: &self.session_ids,
        };

        let canonical = serde_json::to_vec(&view).expect("hash view serialization is infallible");
        hex::encode(Sha256::digest(&canonical))
    }

    /// Input indices claimed by one session, per `input_owners`.
    pub fn indices_owned_by(&self, session_id: &SessionId) -> Vec<u32> {
        self.input_owners
            .iter()
            .filter(|(_, owners)| owners.contains(session_id))
            .map(|(index, _)| *index)
            .collect()
    }
}

/// The multi-party signing buffer attached to a CoinJoin session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PendingTransaction {
    pub tx_hash: String,
    pub transaction_data: CoinJoinTxData,
    /// Input index → hex signature script.
    pub signatures: BTreeMap<u32, String>,
    pub updated_at: u64,
}

/// A CoinJoin session (either sub-protocol).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CoinJoinSession {
    #[serde(flatten)]
    pub meta: SessionMeta,
    pub status: CoinJoinStatus,
    pub zero_trust_mode: bool,
    /// Declared contribution (informational in zero-trust mode).
    #[serde(with = "sompi_string")]
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_salt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub utxo_commitments: Vec<UtxoCommitment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revealed_utxos: Vec<SerializedUtxo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub utxo_source_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revealed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposit_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposit_private_key: Option<String>,
    #[serde(with = "sompi_string_opt", default, skip_serializing_if = "Option::is_none")]
    pub entered_amount: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_transaction: Option<PendingTransaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coinjoin_tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl CoinJoinSession {
    /// Start a trusted-mode session waiting for its fixed entry deposit.
    pub fn new_trusted(amount: u64, destination_address: String, deposit_address: String, deposit_private_key: String) -> Self {
        Self {
            meta: SessionMeta::new(),
            status: CoinJoinStatus::WaitingDeposit,
            zero_trust_mode: false,
            amount,
            destination_address: Some(destination_address),
            destination_hash: None,
            destination_salt: None,
            utxo_commitments: vec![],
            revealed_utxos: vec![],
            utxo_source_addresses: vec![],
            revealed_at: None,
            deposit_address: Some(deposit_address),
            deposit_private_key: Some(deposit_private_key),
            entered_amount: None,
            entry_tx_id: None,
            pending_transaction: None,
            coinjoin_tx_id: None,
            completed_at: None,
        }
    }

    /// Start a zero-trust session holding only commitments.
    pub fn new_committed(
        amount: u64,
        destination_hash: String,
        destination_salt: String,
        utxo_commitments: Vec<UtxoCommitment>,
    ) -> Self {
        Self {
            meta: SessionMeta::new(),
            status: CoinJoinStatus::Committed,
            zero_trust_mode: true,
            amount,
            destination_address: None,
            destination_hash: Some(destination_hash),
            destination_salt: Some(destination_salt),
            utxo_commitments,
            revealed_utxos: vec![],
            utxo_source_addresses: vec![],
            revealed_at: None,
            deposit_address: None,
            deposit_private_key: None,
            entered_amount: None,
            entry_tx_id: None,
            pending_transaction: None,
            coinjoin_tx_id: None,
            completed_at: None,
        }
    }

    /// Sum of this session's revealed UTXO amounts.
    pub fn revealed_total(&self) -> u64 {
        self.revealed_utxos.iter().map(|u| u.amount).sum()
    }
}

/// A session record: one mixing request or one CoinJoin participation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Session {
    Mix(MixSession),
    #[serde(rename = "coinjoin")]
    CoinJoin(CoinJoinSession),
}

impl Session {
    pub fn meta(&self) -> &SessionMeta {
        match self {
            Session::Mix(s) => &s.meta,
            Session::CoinJoin(s) => &s.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut SessionMeta {
        match self {
            Session::Mix(s) => &mut s.meta,
            Session::CoinJoin(s) => &mut s.meta,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.meta().id
    }

    pub fn status_name(&self) -> &'static str {
        match self {
            Session::Mix(s) => s.status.name(),
            Session::CoinJoin(s) => s.status.name(),
        }
    }

    /// Refresh the update timestamp.
    pub fn touch(&mut self) {
        self.meta_mut().updated_at = now_millis();
    }

    /// Enter the terminal error state with a tagged message.
    pub fn fail(&mut self, tagged_message: String) {
        match self {
            Session::Mix(s) => s.status = MixStatus::Error,
            Session::CoinJoin(s) => s.status = CoinJoinStatus::Error,
        }
        self.meta_mut().error = Some(tagged_message);
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kasmix_core::types::Hash256;

    fn mix() -> MixSession {
        MixSession::new(
            100,
            vec![Destination { address: "kaspa:dest".into(), amount: 100 }],
            "kaspa:dep".into(),
            "aa".repeat(32),
        )
    }

    fn tx_data() -> CoinJoinTxData {
        let sid = SessionId::from_string("s1");
        CoinJoinTxData {
            inputs: vec![PlannedInput {
                outpoint: Outpoint { transaction_id: Hash256([1; 32]), index: 0 },
                amount: 100_000_000,
                script_public_key: ScriptPublicKey { version: 0, script: vec![0x20; 34] },
                block_daa_score: 10,
                is_coinbase: false,
                source_address: "kaspa:src".into(),
            }],
            outputs: vec![PlannedOutput { address: "kaspa:out".into(), amount: 99_000_000 }],
            fee: 1_000_000,
            total_input: 100_000_000,
            total_output: 99_000_000,
            participants: 1,
            session_ids: vec![sid.clone()],
            input_owners: BTreeMap::from([(0u32, vec![sid])]),
            contribution_stats: ContributionStats {
                min: 100_000_000,
                max: 100_000_000,
                total: 100_000_000,
            },
        }
    }

    // --- SessionId ---

    #[test]
    fn session_id_is_32_hex_chars() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn session_ids_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    // --- Mix status DAG ---

    #[test]
    fn mix_forward_edges() {
        use MixStatus::*;
        assert!(WaitingDeposit.may_transition_to(DepositReceived));
        assert!(DepositReceived.may_transition_to(SentToIntermediate));
        assert!(SentToIntermediate.may_transition_to(IntermediateConfirmed));
        assert!(IntermediateConfirmed.may_transition_to(Confirmed));
    }

    #[test]
    fn mix_no_reverse_edges() {
        use MixStatus::*;
        assert!(!Confirmed.may_transition_to(WaitingDeposit));
        assert!(!IntermediateConfirmed.may_transition_to(DepositReceived));
        assert!(!DepositReceived.may_transition_to(WaitingDeposit));
    }

    #[test]
    fn mix_error_reachable_from_anywhere_but_itself() {
        use MixStatus::*;
        for s in [WaitingDeposit, DepositReceived, SentToIntermediate, IntermediateConfirmed, Confirmed] {
            assert!(s.may_transition_to(Error), "{s:?} should reach error");
        }
        assert!(!Error.may_transition_to(Error));
        assert!(!Error.may_transition_to(Confirmed));
    }

    #[test]
    fn mix_terminals() {
        assert!(MixStatus::Confirmed.is_terminal());
        assert!(MixStatus::Error.is_terminal());
        assert!(!MixStatus::WaitingDeposit.is_terminal());
    }

    // --- CoinJoin status DAG ---

    #[test]
    fn coinjoin_trusted_path() {
        use CoinJoinStatus::*;
        assert!(WaitingDeposit.may_transition_to(Entered));
        assert!(Entered.may_transition_to(ReadyForBatch));
        assert!(ReadyForBatch.may_transition_to(Completed));
    }

    #[test]
    fn coinjoin_zero_trust_path() {
        use CoinJoinStatus::*;
        assert!(Committed.may_transition_to(Revealed));
        assert!(Revealed.may_transition_to(Completed));
        assert!(!Committed.may_transition_to(Completed));
    }

    #[test]
    fn coinjoin_paths_do_not_cross() {
        use CoinJoinStatus::*;
        assert!(!WaitingDeposit.may_transition_to(Revealed));
        assert!(!Committed.may_transition_to(Entered));
        assert!(!Completed.may_transition_to(Revealed));
    }

    // --- Records ---

    #[test]
    fn mix_serde_roundtrip_preserves_amount_strings() {
        let s = Session::Mix(mix());
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"type\":\"mix\""));
        assert!(json.contains("\"amount\":\"100\""));
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn coinjoin_serde_roundtrip() {
        let s = Session::CoinJoin(CoinJoinSession::new_committed(
            100_000_000,
            "ff".repeat(32),
            "ee".repeat(32),
            vec![UtxoCommitment { commitment: "cc".repeat(32), salt: "dd".repeat(32) }],
        ));
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"type\":\"coinjoin\""));
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn fail_sets_error_state() {
        let mut s = Session::Mix(mix());
        s.fail("[E_PAYOUT] boom".into());
        assert_eq!(s.meta().error.as_deref(), Some("[E_PAYOUT] boom"));
        assert_eq!(s.status_name(), "error");
    }

    #[test]
    fn has_paid_out() {
        let mut m = mix();
        assert!(!m.has_paid_out());
        m.payout_tx_ids.push("tx".into());
        assert!(m.has_paid_out());
    }

    // --- Content hash ---

    #[test]
    fn content_hash_is_stable() {
        let d = tx_data();
        assert_eq!(d.content_hash(), d.content_hash());
    }

    #[test]
    fn content_hash_binds_outputs() {
        let d1 = tx_data();
        let mut d2 = d1.clone();
        d2.outputs[0].amount += 1;
        assert_ne!(d1.content_hash(), d2.content_hash());
    }

    #[test]
    fn content_hash_binds_fee_and_sessions() {
        let d1 = tx_data();
        let mut d2 = d1.clone();
        d2.fee += 1;
        assert_ne!(d1.content_hash(), d2.content_hash());

        let mut d3 = d1.clone();
        d3.session_ids.push(SessionId::from_string("s2"));
        assert_ne!(d1.content_hash(), d3.content_hash());
    }

    #[test]
    fn content_hash_ignores_resolution_metadata() {
        // Script data and DAA scores are resolution details, not identity.
        let d1 = tx_data();
        let mut d2 = d1.clone();
        d2.inputs[0].block_daa_score = 999;
        d2.inputs[0].source_address = "kaspa:elsewhere".into();
        assert_eq!(d1.content_hash(), d2.content_hash());
    }

    #[test]
    fn indices_owned_by_filters_owners() {
        let d = tx_data();
        let sid = SessionId::from_string("s1");
        assert_eq!(d.indices_owned_by(&sid), vec![0]);
        assert!(d.indices_owned_by(&SessionId::from_string("sX")).is_empty());
    }

    #[test]
    fn revealed_total_sums() {
        let mut s = CoinJoinSession::new_committed(0, "h".into(), "s".into(), vec![]);
        s.revealed_utxos = vec![
            SerializedUtxo { transaction_id: Hash256([1; 32]), index: 0, amount: 30 },
            SerializedUtxo { transaction_id: Hash256([2; 32]), index: 1, amount: 12 },
        ];
        assert_eq!(s.revealed_total(), 42);
    }
}
