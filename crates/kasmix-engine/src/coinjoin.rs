//! The CoinJoin coordinator.
//!
//! Two sub-protocols share the session shape:
//!
//! - **Trusted**: participants deposit a fixed entry amount to a
//!   pool-controlled address; a batcher pays equal amounts back out of
//!   the pool once enough sessions entered.
//! - **Zero-trust**: participants commit to UTXOs and a destination
//!   (salted SHA-256), later reveal them, and cooperatively build ONE
//!   transaction whose outputs are all exactly equal. Each participant
//!   signs only the inputs their key controls; signatures meet in a
//!   hash-bound pending buffer until every input is covered.
//!
//! The equal-output invariant is absolute: the integer remainder of the
//! equal division goes to the fee, never into any output.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use kasmix_core::address::Address;
use kasmix_core::commitment;
use kasmix_core::constants::{
    DUST_THRESHOLD, BPS_PRECISION, MIN_CONFIRMATIONS, PENDING_TX_EXPIRY_MS,
    SEQUENCE_LOCK_BACKOFF_CAP_MS, SEQUENCE_LOCK_RETRIES,
};
use kasmix_core::crypto::{sign_transaction, KeyPair};
use kasmix_core::mass::{calculate_mass, MAXIMUM_STANDARD_MASS};
use kasmix_core::types::{
    Outpoint, SerializedUtxo, SignableTransaction, TransactionId, UtxoEntry,
};
use kasmix_session::{
    CoinJoinSession, CoinJoinStatus, CoinJoinTxData, ContributionStats, PendingTransaction,
    PlannedInput, PlannedOutput, Session, SessionId, UtxoCommitment, now_millis,
};
use kasmix_wallet::builder::{check_standard_mass, compose, sign_all, submit};
use kasmix_wallet::fee;

use crate::context::Engine;
use crate::error::EngineError;

/// Aggregate session counters for `coinjoin.stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoinJoinStats {
    pub total: usize,
    pub waiting_deposit: usize,
    pub entered: usize,
    pub committed: usize,
    pub revealed: usize,
    pub completed: usize,
    pub errored: usize,
    pub zero_trust: usize,
    pub trusted: usize,
}

impl Engine {
    // --- Session creation ---

    /// Create a zero-trust session: store salted commitments only.
    pub fn create_zero_trust_session(
        &self,
        destination: &str,
        utxos: &[SerializedUtxo],
    ) -> Result<CoinJoinSession, EngineError> {
        self.parse_address(destination)?;
        if utxos.is_empty() {
            return Err(EngineError::BadInput("no UTXOs committed".into()));
        }

        let destination_salt = commitment::random_salt();
        let destination_hash = commitment::commit_destination(destination, &destination_salt)
            .map_err(|e| EngineError::BadInput(e.to_string()))?;

        let mut commitments = Vec::with_capacity(utxos.len());
        let mut amount: u64 = 0;
        for utxo in utxos {
            if utxo.amount == 0 {
                return Err(EngineError::BadInput(format!(
                    "zero-amount UTXO {}",
                    utxo.outpoint()
                )));
            }
            let salt = commitment::random_salt();
            let commit = commitment::commit_utxo(utxo, &salt)
                .map_err(|e| EngineError::BadInput(e.to_string()))?;
            commitments.push(UtxoCommitment { commitment: commit, salt });
            amount = amount
                .checked_add(utxo.amount)
                .ok_or_else(|| EngineError::BadInput("contribution overflow".into()))?;
        }

        let session =
            CoinJoinSession::new_committed(amount, destination_hash, destination_salt, commitments);
        self.sessions().set(Session::CoinJoin(session.clone()))?;
        info!(session = %session.meta.id, utxos = utxos.len(), "zero-trust coinjoin session committed");
        Ok(session)
    }

    /// Create a trusted session with a fresh single-use deposit address.
    pub fn create_trusted_session(
        &self,
        destination: &str,
    ) -> Result<CoinJoinSession, EngineError> {
        self.parse_address(destination)?;
        let (keypair, deposit) = kasmix_wallet::keys::generate_keypair(self.config().network);
        let session = CoinJoinSession::new_trusted(
            self.config().entry_amount,
            destination.to_string(),
            deposit.encode(),
            keypair.secret_hex(),
        );
        self.sessions().set(Session::CoinJoin(session.clone()))?;
        info!(session = %session.meta.id, deposit = %session.deposit_address.as_deref().unwrap_or(""), "trusted coinjoin session created");
        Ok(session)
    }

    pub fn get_coinjoin_session(&self, id: &SessionId) -> Result<CoinJoinSession, EngineError> {
        match self.sessions().get(id) {
            Some(Session::CoinJoin(session)) => Ok(session),
            _ => Err(EngineError::NotFound),
        }
    }

    pub fn list_coinjoin_sessions(&self) -> Vec<CoinJoinSession> {
        self.sessions()
            .enumerate()
            .into_iter()
            .filter_map(|s| match s {
                Session::CoinJoin(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    // --- Reveal ---

    /// Reveal the committed UTXOs and destination.
    ///
    /// Every commitment is re-derived and compared byte for byte; the
    /// destination hash likewise. A second identical reveal is an
    /// idempotent success; a diverging one is `AlreadyRevealed`. The
    /// revealed contribution must equal, exactly, the contribution of
    /// every other session revealed within the policing window.
    pub fn reveal_session(
        &self,
        id: &SessionId,
        utxos: &[SerializedUtxo],
        destination: &str,
        source_addresses: &[String],
    ) -> Result<CoinJoinSession, EngineError> {
        let _guard = self.lock_session(id)?;
        let mut session = self.get_coinjoin_session(id)?;
        if !session.zero_trust_mode {
            return Err(EngineError::BadInput(
                "reveal applies to zero-trust sessions only".into(),
            ));
        }

        if session.status == CoinJoinStatus::Revealed {
            let same_utxos = session.revealed_utxos == utxos;
            let same_destination = session.destination_address.as_deref() == Some(destination);
            return if same_utxos && same_destination {
                Ok(session)
            } else {
                Err(EngineError::AlreadyRevealed)
            };
        }
        if session.status != CoinJoinStatus::Committed {
            return Err(EngineError::BadInput(format!(
                "cannot reveal in status {}",
                session.status.name()
            )));
        }

        if utxos.len() != session.utxo_commitments.len() {
            return Err(EngineError::CommitmentInvalid(format!(
                "expected {} UTXOs, got {}",
                session.utxo_commitments.len(),
                utxos.len()
            )));
        }
        for (index, (utxo, committed)) in utxos.iter().zip(&session.utxo_commitments).enumerate() {
            if !commitment::verify_utxo_commitment(utxo, &committed.salt, &committed.commitment) {
                return Err(EngineError::CommitmentInvalid(format!(
                    "UTXO {index} does not match its commitment"
                )));
            }
        }
        let (dest_hash, dest_salt) = match (&session.destination_hash, &session.destination_salt) {
            (Some(h), Some(s)) => (h.clone(), s.clone()),
            _ => {
                return Err(EngineError::CommitmentInvalid(
                    "session has no destination commitment".into(),
                ))
            }
        };
        if !commitment::verify_destination_commitment(destination, &dest_salt, &dest_hash) {
            return Err(EngineError::CommitmentInvalid(
                "destination does not match its commitment".into(),
            ));
        }
        for source in source_addresses {
            self.parse_address(source)?;
        }

        // Equal-amount policing against the reveal window. Exact match,
        // no tolerance: mismatched inflow shapes deanonymise.
        let contribution: u64 = utxos.iter().map(|u| u.amount).sum();
        if let Some(reference) = self.reference_contribution(id) {
            if contribution != reference {
                return Err(EngineError::ContributionMismatch {
                    expected: reference,
                    actual: contribution,
                });
            }
        }

        session.revealed_utxos = utxos.to_vec();
        session.destination_address = Some(destination.to_string());
        session.utxo_source_addresses = source_addresses.to_vec();
        session.revealed_at = Some(now_millis());
        session.status = CoinJoinStatus::Revealed;
        session.meta.updated_at = now_millis();
        self.sessions().set(Session::CoinJoin(session.clone()))?;
        info!(session = %id, contribution, "coinjoin session revealed");
        Ok(session)
    }

    /// The contribution every reveal in the current window must match.
    fn reference_contribution(&self, revealing: &SessionId) -> Option<u64> {
        let cutoff = now_millis().saturating_sub(self.config().policing_window_ms);
        self.list_coinjoin_sessions()
            .into_iter()
            .filter(|s| {
                s.zero_trust_mode
                    && s.status == CoinJoinStatus::Revealed
                    && &s.meta.id != revealing
                    && s.revealed_at.unwrap_or(0) >= cutoff
            })
            .map(|s| s.revealed_total())
            .next()
    }

    // --- Build ---

    /// Build the cooperative zero-trust transaction for a session set.
    pub async fn build_zero_trust(
        &self,
        ids: &[SessionId],
    ) -> Result<CoinJoinTxData, EngineError> {
        if ids.len() < self.config().min_zero_trust {
            return Err(EngineError::NotEnoughParticipants {
                have: ids.len(),
                need: self.config().min_zero_trust,
            });
        }
        let unique: HashSet<&SessionId> = ids.iter().collect();
        if unique.len() != ids.len() {
            return Err(EngineError::BadInput("duplicate session ids".into()));
        }
        let _guards = self.lock_session_set(ids)?;

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            let session = self.get_coinjoin_session(id)?;
            if !session.zero_trust_mode {
                return Err(EngineError::BadInput(format!(
                    "session {id} is not zero-trust"
                )));
            }
            if session.status != CoinJoinStatus::Revealed {
                return Err(EngineError::BadInput(format!(
                    "session {id} is {} (expected revealed)",
                    session.status.name()
                )));
            }
            sessions.push(session);
        }

        // Deduplicate by outpoint, tracking every claiming session.
        let mut owners_by_outpoint: BTreeMap<Outpoint, Vec<SessionId>> = BTreeMap::new();
        let mut revealed_by_outpoint: HashMap<Outpoint, SerializedUtxo> = HashMap::new();
        for session in &sessions {
            for utxo in &session.revealed_utxos {
                let outpoint = utxo.outpoint();
                let owners = owners_by_outpoint.entry(outpoint).or_default();
                if !owners.contains(&session.meta.id) {
                    owners.push(session.meta.id.clone());
                }
                revealed_by_outpoint.entry(outpoint).or_insert(*utxo);
            }
        }

        // Contribution policing across the full set: every session's
        // revealed total must be identical.
        let contributions: Vec<u64> = sessions.iter().map(|s| s.revealed_total()).collect();
        let min_contribution = *contributions.iter().min().expect("non-empty");
        let max_contribution = *contributions.iter().max().expect("non-empty");
        if min_contribution != max_contribution {
            return Err(EngineError::ContributionMismatch {
                expected: min_contribution,
                actual: max_contribution,
            });
        }

        // Resolve every unique outpoint to a full UTXO entry.
        let resolved = self
            .resolve_utxos(&sessions, &owners_by_outpoint, &revealed_by_outpoint)
            .await?;

        let total_input: u64 = resolved
            .iter()
            .map(|p| p.amount)
            .try_fold(0u64, |acc, v| acc.checked_add(v))
            .ok_or_else(|| EngineError::BadInput("input total overflow".into()))?;

        // One equal output per participant, at their revealed destination.
        let mut outputs = Vec::with_capacity(sessions.len());
        for session in &sessions {
            let destination = session.destination_address.clone().ok_or_else(|| {
                EngineError::BadInput(format!("session {} has no destination", session.meta.id))
            })?;
            outputs.push(destination);
        }
        let participants = outputs.len();

        // Fee from a candidate with one equal output per destination.
        let entries: Vec<UtxoEntry> = resolved.iter().map(planned_to_entry).collect();
        let placeholder = total_input / participants as u64;
        let candidate_outputs: Vec<(Address, u64)> = outputs
            .iter()
            .map(|d| Ok((self.parse_address(d)?, placeholder)))
            .collect::<Result<_, EngineError>>()?;
        let estimate = fee::estimate_fee(self.rpc().as_ref(), &entries, &candidate_outputs).await;

        let available = total_input
            .checked_sub(estimate.fee)
            .filter(|v| *v > 0)
            .ok_or(EngineError::InsufficientFunds {
                have: total_input,
                need: estimate.fee,
            })?;
        let equal_amount = available / participants as u64;
        let remainder = available % participants as u64;
        if equal_amount < DUST_THRESHOLD {
            return Err(EngineError::InsufficientFunds {
                have: total_input,
                need: estimate.fee + participants as u64 * DUST_THRESHOLD,
            });
        }
        // The remainder is absorbed by the fee so that every output is
        // byte-identical.
        let fee = estimate.fee + remainder;
        let total_output = equal_amount * participants as u64;
        debug_assert_eq!(total_output + fee, total_input);

        let input_owners: BTreeMap<u32, Vec<SessionId>> = resolved
            .iter()
            .enumerate()
            .map(|(index, planned)| {
                (
                    index as u32,
                    owners_by_outpoint
                        .get(&planned.outpoint)
                        .cloned()
                        .unwrap_or_default(),
                )
            })
            .collect();

        let data = CoinJoinTxData {
            inputs: resolved,
            outputs: outputs
                .into_iter()
                .map(|address| PlannedOutput { address, amount: equal_amount })
                .collect(),
            fee,
            total_input,
            total_output,
            participants,
            session_ids: ids.to_vec(),
            input_owners,
            contribution_stats: ContributionStats {
                min: min_contribution,
                max: max_contribution,
                total: total_input,
            },
        };
        info!(
            participants,
            inputs = data.inputs.len(),
            equal_amount,
            fee,
            "zero-trust coinjoin built"
        );
        Ok(data)
    }

    /// Resolve revealed outpoints to full entries: first through every
    /// declared source address, then through the originating transaction,
    /// deriving the owning address from its locking script. Unresolvable
    /// outpoints fail the build; placeholder script data is never
    /// fabricated.
    async fn resolve_utxos(
        &self,
        sessions: &[CoinJoinSession],
        owners_by_outpoint: &BTreeMap<Outpoint, Vec<SessionId>>,
        revealed_by_outpoint: &HashMap<Outpoint, SerializedUtxo>,
    ) -> Result<Vec<PlannedInput>, EngineError> {
        let mut sources: Vec<String> = Vec::new();
        for session in sessions {
            for address in &session.utxo_source_addresses {
                if !sources.contains(address) {
                    sources.push(address.clone());
                }
            }
        }

        let mut found: HashMap<Outpoint, (UtxoEntry, String)> = HashMap::new();
        if !sources.is_empty() {
            for entry in self.rpc().get_utxos_by_addresses(&sources).await? {
                let address =
                    Address::from_script_public_key(&entry.script_public_key, self.config().network)
                        .map(|a| a.encode())
                        .unwrap_or_default();
                found.insert(entry.outpoint, (entry, address));
            }
        }

        let mut resolved = Vec::with_capacity(owners_by_outpoint.len());
        for outpoint in owners_by_outpoint.keys() {
            let revealed = revealed_by_outpoint
                .get(outpoint)
                .expect("revealed map covers every owned outpoint");

            let (entry, source_address) = match found.remove(outpoint) {
                Some(hit) => hit,
                None => self.resolve_via_transaction(*outpoint).await?,
            };
            if entry.amount != revealed.amount {
                return Err(EngineError::UtxoUnresolved(format!(
                    "{outpoint}: revealed amount {} does not match chain amount {}",
                    revealed.amount, entry.amount
                )));
            }
            resolved.push(PlannedInput {
                outpoint: *outpoint,
                amount: entry.amount,
                script_public_key: entry.script_public_key,
                block_daa_score: entry.block_daa_score,
                is_coinbase: entry.is_coinbase,
                source_address,
            });
        }
        Ok(resolved)
    }

    /// Fallback resolution through `get_transaction`.
    async fn resolve_via_transaction(
        &self,
        outpoint: Outpoint,
    ) -> Result<(UtxoEntry, String), EngineError> {
        let record = self
            .rpc()
            .get_transaction(outpoint.transaction_id)
            .await?
            .ok_or_else(|| EngineError::UtxoUnresolved(outpoint.to_string()))?;
        let output = record
            .transaction
            .outputs
            .get(outpoint.index as usize)
            .ok_or_else(|| {
                EngineError::UtxoUnresolved(format!("{outpoint}: no such output index"))
            })?;
        let address =
            Address::from_script_public_key(&output.script_public_key, self.config().network)
                .map_err(|_| {
                    EngineError::UtxoUnresolved(format!(
                        "{outpoint}: cannot derive address from locking script"
                    ))
                })?;
        debug!(%outpoint, "UTXO resolved through originating transaction");
        Ok((
            UtxoEntry {
                outpoint,
                amount: output.amount,
                script_public_key: output.script_public_key.clone(),
                block_daa_score: record.block_daa_score.unwrap_or(0),
                is_coinbase: false,
            },
            address.encode(),
        ))
    }

    // --- Signing ---

    /// Sign the caller's own inputs of a built candidate.
    ///
    /// The whole transaction is signed with the one key; the signer
    /// naturally produces signature scripts only on inputs whose locking
    /// script matches it. All of the session's claimed input indices must
    /// come out signed, or the key does not match the reveal.
    pub fn sign_coinjoin_inputs(
        &self,
        id: &SessionId,
        tx_data: &CoinJoinTxData,
        private_key_hex: &str,
    ) -> Result<BTreeMap<u32, String>, EngineError> {
        let _guard = self.lock_session(id)?;
        let session = self.get_coinjoin_session(id)?;
        if !tx_data.session_ids.contains(id) {
            return Err(EngineError::BadInput(
                "session does not participate in this transaction".into(),
            ));
        }
        if session.status != CoinJoinStatus::Revealed {
            return Err(EngineError::BadInput(format!(
                "cannot sign in status {}",
                session.status.name()
            )));
        }

        let keypair = KeyPair::from_hex(private_key_hex)
            .map_err(|e| EngineError::BadInput(format!("invalid private key: {e}")))?;

        let mut signable =
            rebuild_signable(tx_data, self.config().network).map_err(EngineError::BadInput)?;
        let signed_indices = sign_transaction(&mut signable, &keypair)
            .map_err(|e| EngineError::BadInput(e.to_string()))?;

        let claimed = tx_data.indices_owned_by(id);
        let signed_set: HashSet<u32> = signed_indices.iter().map(|i| *i as u32).collect();
        let missing: Vec<u32> = claimed
            .iter()
            .copied()
            .filter(|index| !signed_set.contains(index))
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::KeyUtxoMismatch(format!(
                "inputs {missing:?} were not signed by the supplied key"
            )));
        }

        let mut signatures = BTreeMap::new();
        for index in signed_indices {
            signatures.insert(
                index as u32,
                hex::encode(&signable.transaction.inputs[index].signature_script),
            );
        }

        // Fan the signatures out to every participating session's pending
        // buffer, keyed by the candidate's content hash.
        let tx_hash = tx_data.content_hash();
        for sid in &tx_data.session_ids {
            let Ok(mut peer) = self.get_coinjoin_session(sid) else { continue };
            match &mut peer.pending_transaction {
                Some(pending) if pending.tx_hash == tx_hash => {
                    pending.signatures.extend(signatures.clone());
                    pending.updated_at = now_millis();
                }
                stale => {
                    // A diverging candidate invalidates whatever was cached.
                    *stale = Some(PendingTransaction {
                        tx_hash: tx_hash.clone(),
                        transaction_data: tx_data.clone(),
                        signatures: signatures.clone(),
                        updated_at: now_millis(),
                    });
                }
            }
            peer.meta.updated_at = now_millis();
            if let Err(e) = self.sessions().set(Session::CoinJoin(peer)) {
                warn!(session = %sid, error = %e, "failed to persist pending signatures");
            }
        }

        info!(session = %id, signed = signatures.len(), "coinjoin inputs signed");
        Ok(signatures)
    }

    /// Fetch a session's pending buffer, dropping it if its hash no
    /// longer matches the stored candidate (stale signatures).
    pub fn pending_coinjoin_transaction(
        &self,
        id: &SessionId,
    ) -> Result<Option<PendingTransaction>, EngineError> {
        let mut session = self.get_coinjoin_session(id)?;
        let Some(pending) = session.pending_transaction.clone() else {
            return Ok(None);
        };
        if pending.transaction_data.content_hash() != pending.tx_hash {
            warn!(session = %id, "pending transaction hash diverged, invalidating cached signatures");
            session.pending_transaction = None;
            session.meta.updated_at = now_millis();
            self.sessions().set(Session::CoinJoin(session))?;
            return Ok(None);
        }
        Ok(Some(pending))
    }

    // --- Submission ---

    /// Assemble and submit a fully signed zero-trust transaction.
    pub async fn submit_coinjoin(
        &self,
        tx_data: &CoinJoinTxData,
        signatures: &BTreeMap<u32, String>,
    ) -> Result<TransactionId, EngineError> {
        for index in 0..tx_data.inputs.len() as u32 {
            if !signatures.contains_key(&index) {
                return Err(EngineError::BadInput(format!(
                    "missing signature for input {index}"
                )));
            }
        }
        let _guards = self.lock_session_set(&tx_data.session_ids)?;

        let mut signable = rebuild_signable(tx_data, self.config().network)
            .map_err(EngineError::BadInput)?;
        for (index, script_hex) in signatures {
            let script = hex::decode(script_hex).map_err(|e| {
                EngineError::BadInput(format!("signature {index} is not valid hex: {e}"))
            })?;
            signable.transaction.inputs[*index as usize].signature_script = script;
        }

        let mass = calculate_mass(&signable.transaction);
        if mass > MAXIMUM_STANDARD_MASS {
            return Err(EngineError::MassExceeded {
                mass,
                max: MAXIMUM_STANDARD_MASS,
                recommendation: "reduce the participant count and rebuild".into(),
            });
        }
        if mass > MAXIMUM_STANDARD_MASS / 10 * 8 {
            warn!(mass, max = MAXIMUM_STANDARD_MASS, "coinjoin mass above 80% of standard maximum");
        }

        let local_id = signable
            .transaction
            .id()
            .map_err(|e| EngineError::BadInput(e.to_string()))?;

        // Submit, riding out sequence locks with capped backoff.
        let mut attempt: u32 = 0;
        let tx_id = loop {
            match self.rpc().submit_transaction(&signable.transaction).await {
                Ok(id) => break id,
                Err(kasmix_chain::RpcError::AlreadyInMempool { tx_id }) => {
                    break tx_id.unwrap_or(local_id);
                }
                Err(kasmix_chain::RpcError::SequenceLockNotMet)
                    if attempt < SEQUENCE_LOCK_RETRIES =>
                {
                    let backoff = ((1u64 << attempt) * 1_000).min(SEQUENCE_LOCK_BACKOFF_CAP_MS);
                    warn!(attempt, backoff_ms = backoff, "sequence lock not met, retrying");
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(kasmix_chain::RpcError::SequenceLockNotMet) => {
                    return Err(EngineError::SequenceLockNotMet);
                }
                Err(kasmix_chain::RpcError::MassExceeded(msg)) => {
                    return Err(EngineError::MassExceeded {
                        mass,
                        max: MAXIMUM_STANDARD_MASS,
                        recommendation: format!(
                            "node rejected: {msg}; reduce the participant count and rebuild"
                        ),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        };

        // Mark every participant completed exactly once.
        for sid in &tx_data.session_ids {
            let Ok(mut session) = self.get_coinjoin_session(sid) else { continue };
            if session.status == CoinJoinStatus::Completed {
                continue;
            }
            session.status = CoinJoinStatus::Completed;
            session.coinjoin_tx_id = Some(tx_id.to_string());
            session.completed_at = Some(now_millis());
            session.pending_transaction = None;
            session.meta.updated_at = now_millis();
            if let Err(e) = self.sessions().set(Session::CoinJoin(session)) {
                error!(session = %sid, tx = %tx_id, error = %e, "coinjoin submitted but session save failed");
            }
        }

        info!(tx = %tx_id, participants = tx_data.participants, "coinjoin submitted");
        Ok(tx_id)
    }

    // --- Trusted-mode monitor ---

    /// One monitor pass: detect trusted entries and run the batcher.
    pub async fn coinjoin_monitor_tick(&self) {
        if let Err(e) = self.utxos().refresh_daa_score().await {
            warn!(error = %e, "coinjoin monitor: DAA score unavailable, skipping tick");
            return;
        }

        for session in self.list_coinjoin_sessions() {
            if session.zero_trust_mode || session.status != CoinJoinStatus::WaitingDeposit {
                continue;
            }
            let id = session.meta.id.clone();
            let Some(_guard) = self.locks().try_lock(&id) else { continue };
            if let Err(e) = self.check_trusted_deposit(session).await {
                if e.is_transient() {
                    debug!(session = %id, error = %e, "trusted deposit check: transient failure");
                } else {
                    warn!(session = %id, error = %e, "trusted deposit check failed");
                    self.fail_session(&id, &e);
                }
            }
        }

        self.run_trusted_batcher().await;
    }

    /// `waiting_deposit`: forward a matching entry deposit to the pool.
    async fn check_trusted_deposit(
        &self,
        mut session: CoinJoinSession,
    ) -> Result<(), EngineError> {
        let Some(pool_address) = self.config().pool_address.clone() else {
            debug!("no pool address configured, trusted deposits idle");
            return Ok(());
        };
        let deposit_address = session
            .deposit_address
            .clone()
            .ok_or_else(|| EngineError::BadInput("trusted session without deposit address".into()))?;

        let (inputs, sum) = self
            .utxos()
            .confirmed_utxos(&deposit_address, MIN_CONFIRMATIONS)
            .await?;
        if inputs.is_empty() {
            return Ok(());
        }

        let entry = self.config().entry_amount;
        let tolerance = self.config().entry_tolerance;
        if sum < entry.saturating_sub(tolerance) || sum > entry.saturating_add(tolerance) {
            debug!(session = %session.meta.id, sum, entry, "deposit outside entry tolerance, waiting");
            return Ok(());
        }

        let pool = self.parse_address(&pool_address)?;
        let key = KeyPair::from_hex(session.deposit_private_key.as_deref().unwrap_or(""))
            .map_err(|e| EngineError::BadInput(format!("deposit key unusable: {e}")))?;

        let estimate = fee::estimate_fee(self.rpc().as_ref(), &inputs, &[(pool.clone(), sum)]).await;
        let forward = sum
            .checked_sub(estimate.fee)
            .filter(|v| *v > 0)
            .ok_or(EngineError::InsufficientFunds { have: sum, need: estimate.fee })?;

        let mut signable = compose(&inputs, &[(pool, forward)]);
        sign_all(&mut signable, &key).map_err(|e| EngineError::BadInput(e.to_string()))?;
        let tx_id = submit(self.rpc().as_ref(), &signable).await?;

        session.entered_amount = Some(forward);
        session.entry_tx_id = Some(tx_id.to_string());
        session.status = CoinJoinStatus::Entered;
        session.meta.updated_at = now_millis();
        self.sessions().set(Session::CoinJoin(session.clone()))?;
        info!(session = %session.meta.id, tx = %tx_id, amount = forward, "trusted entry forwarded to pool");
        Ok(())
    }

    /// Group entered sessions into sub-batches and pay them out of the
    /// pool: each destination gets `⌊(batch · 99% − txfee) / N⌋`, the 1%
    /// share plus integer remainder returning to the pool as change.
    async fn run_trusted_batcher(&self) {
        let entered: Vec<CoinJoinSession> = self
            .list_coinjoin_sessions()
            .into_iter()
            .filter(|s| {
                !s.zero_trust_mode
                    && s.status == CoinJoinStatus::Entered
                    && s.entered_amount.is_some()
                    && s.destination_address.is_some()
            })
            .collect();
        if entered.len() < self.config().min_trusted {
            return;
        }
        if self.config().pool_private_key.is_none() || self.config().pool_address.is_none() {
            warn!(
                entered = entered.len(),
                "trusted batch ready but no pool key configured, batcher idle"
            );
            return;
        }

        let chunk_size = self.config().max_outputs_per_tx;
        for chunk in entered.chunks(chunk_size) {
            if let Err(e) = self.run_trusted_batch(chunk).await {
                warn!(error = %e, batch = chunk.len(), "trusted batch failed, will retry next tick");
            }
        }
    }

    async fn run_trusted_batch(&self, chunk: &[CoinJoinSession]) -> Result<(), EngineError> {
        let pool_address = self.config().pool_address.clone().expect("checked by caller");
        let pool_key_hex = self.config().pool_private_key.clone().expect("checked by caller");
        let pool = self.parse_address(&pool_address)?;
        let pool_key = KeyPair::from_hex(&pool_key_hex)
            .map_err(|e| EngineError::BadInput(format!("pool key unusable: {e}")))?;

        let ids: Vec<SessionId> = chunk.iter().map(|s| s.meta.id.clone()).collect();
        let _guards = self.lock_session_set(&ids)?;

        let batch_total: u64 = chunk.iter().filter_map(|s| s.entered_amount).sum();
        let participants = chunk.len() as u64;

        let (pool_utxos, pool_sum) = self
            .utxos()
            .confirmed_utxos(&pool_address, MIN_CONFIRMATIONS)
            .await?;
        if pool_utxos.is_empty() || pool_sum < batch_total {
            return Err(EngineError::NoConfirmed(pool_address));
        }

        // Greedy largest-first until the batch total is covered.
        let mut inputs: Vec<UtxoEntry> = pool_utxos;
        inputs.sort_by(|a, b| b.amount.cmp(&a.amount));
        let mut selected = Vec::new();
        let mut selected_sum = 0u64;
        for entry in inputs {
            selected_sum += entry.amount;
            selected.push(entry);
            if selected_sum >= batch_total {
                break;
            }
        }

        let fee_bps = self.config().coinjoin_fee_bps;
        let distributable = batch_total / BPS_PRECISION * (BPS_PRECISION - fee_bps)
            + batch_total % BPS_PRECISION * (BPS_PRECISION - fee_bps) / BPS_PRECISION;

        let destinations: Vec<Address> = chunk
            .iter()
            .map(|s| self.parse_address(s.destination_address.as_deref().unwrap_or("")))
            .collect::<Result<_, EngineError>>()?;

        let mut candidate_outputs: Vec<(Address, u64)> = destinations
            .iter()
            .map(|a| (a.clone(), distributable / participants))
            .collect();
        candidate_outputs.push((pool.clone(), 0));
        let estimate = fee::estimate_fee(self.rpc().as_ref(), &selected, &candidate_outputs).await;

        let payable = distributable
            .checked_sub(estimate.fee)
            .filter(|v| *v > 0)
            .ok_or(EngineError::InsufficientFunds {
                have: distributable,
                need: estimate.fee,
            })?;
        let equal_amount = payable / participants;
        if equal_amount < DUST_THRESHOLD {
            return Err(EngineError::InsufficientFunds {
                have: distributable,
                need: estimate.fee + participants * DUST_THRESHOLD,
            });
        }

        // Everything not paid out (pool fee, remainder, unselected input
        // surplus) returns to the pool as change.
        let paid = equal_amount * participants;
        let change = selected_sum - paid - estimate.fee;
        let mut outputs: Vec<(Address, u64)> = destinations
            .into_iter()
            .map(|address| (address, equal_amount))
            .collect();
        if change > DUST_THRESHOLD {
            outputs.push((pool, change));
        }

        // Persist the batch assignment before the spend goes out.
        for session in chunk {
            let mut s = session.clone();
            s.status = CoinJoinStatus::ReadyForBatch;
            s.meta.updated_at = now_millis();
            self.sessions().set(Session::CoinJoin(s))?;
        }

        let mut signable = compose(&selected, &outputs);
        check_standard_mass(&signable.transaction)
            .map_err(|e| EngineError::BadInput(e.to_string()))?;
        sign_all(&mut signable, &pool_key).map_err(|e| EngineError::BadInput(e.to_string()))?;
        let tx_id = submit(self.rpc().as_ref(), &signable).await?;

        for session in chunk {
            let Ok(mut s) = self.get_coinjoin_session(&session.meta.id) else { continue };
            s.status = CoinJoinStatus::Completed;
            s.coinjoin_tx_id = Some(tx_id.to_string());
            s.completed_at = Some(now_millis());
            s.meta.updated_at = now_millis();
            if let Err(e) = self.sessions().set(Session::CoinJoin(s)) {
                error!(session = %session.meta.id, tx = %tx_id, error = %e, "batch submitted but session save failed");
            }
        }

        info!(tx = %tx_id, batch = chunk.len(), equal_amount, "trusted coinjoin batch paid out");
        Ok(())
    }

    // --- Housekeeping ---

    /// Drop pending signing buffers that have gone stale.
    pub fn lobby_cleanup_tick(&self) {
        let cutoff = now_millis().saturating_sub(PENDING_TX_EXPIRY_MS);
        for session in self.list_coinjoin_sessions() {
            let Some(pending) = &session.pending_transaction else { continue };
            if pending.updated_at >= cutoff || session.status == CoinJoinStatus::Completed {
                continue;
            }
            let Some(_guard) = self.locks().try_lock(&session.meta.id) else { continue };
            let mut s = session.clone();
            s.pending_transaction = None;
            s.meta.updated_at = now_millis();
            if self.sessions().set(Session::CoinJoin(s)).is_ok() {
                debug!(session = %session.meta.id, "stale pending transaction cleared");
            }
        }
    }

    /// Aggregate counters for the stats endpoint.
    pub fn coinjoin_stats(&self) -> CoinJoinStats {
        let mut stats = CoinJoinStats::default();
        for session in self.list_coinjoin_sessions() {
            stats.total += 1;
            if session.zero_trust_mode {
                stats.zero_trust += 1;
            } else {
                stats.trusted += 1;
            }
            match session.status {
                CoinJoinStatus::WaitingDeposit => stats.waiting_deposit += 1,
                CoinJoinStatus::Entered | CoinJoinStatus::ReadyForBatch => stats.entered += 1,
                CoinJoinStatus::Committed => stats.committed += 1,
                CoinJoinStatus::Revealed => stats.revealed += 1,
                CoinJoinStatus::Completed => stats.completed += 1,
                CoinJoinStatus::Error => stats.errored += 1,
            }
        }
        stats
    }
}

/// Convert a planned input back to its UTXO entry.
fn planned_to_entry(planned: &PlannedInput) -> UtxoEntry {
    UtxoEntry {
        outpoint: planned.outpoint,
        amount: planned.amount,
        script_public_key: planned.script_public_key.clone(),
        block_daa_score: planned.block_daa_score,
        is_coinbase: planned.is_coinbase,
    }
}

/// Reconstruct the canonical signable transaction from circulated data.
///
/// The input order in `tx_data` IS the canonical order (sorted by
/// outpoint at build time); every participant rebuilding from the same
/// data gets a byte-identical transaction.
fn rebuild_signable(
    tx_data: &CoinJoinTxData,
    network: kasmix_core::address::Network,
) -> Result<SignableTransaction, String> {
    let entries: Vec<UtxoEntry> = tx_data.inputs.iter().map(planned_to_entry).collect();
    let outputs: Vec<(Address, u64)> = tx_data
        .outputs
        .iter()
        .map(|o| {
            let address = Address::decode(&o.address)
                .map_err(|e| format!("invalid output address {}: {e}", o.address))?;
            if address.network() != network {
                return Err(format!("output address {} is for the wrong network", o.address));
            }
            Ok((address, o.amount))
        })
        .collect::<Result<_, String>>()?;
    Ok(compose(&entries, &outputs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{engine_with_node, zt_participant, Participant};
    use kasmix_core::constants::SOMPI_PER_KAS;

    fn commit_and_reveal(
        engine: &Engine,
        node: &std::sync::Arc<kasmix_chain::MockNode>,
        amount: u64,
    ) -> (Participant, CoinJoinSession) {
        let participant = zt_participant(node, amount);
        let session = engine
            .create_zero_trust_session(&participant.destination, &participant.utxos)
            .unwrap();
        let revealed = engine
            .reveal_session(
                &session.meta.id,
                &participant.utxos,
                &participant.destination,
                &[participant.source.clone()],
            )
            .unwrap();
        (participant, revealed)
    }

    // --- Commit / reveal ---

    #[test]
    fn commit_stores_hashes_not_secrets() {
        let (engine, node, _dir) = engine_with_node();
        let participant = zt_participant(&node, SOMPI_PER_KAS);
        let session = engine
            .create_zero_trust_session(&participant.destination, &participant.utxos)
            .unwrap();

        assert_eq!(session.status, CoinJoinStatus::Committed);
        assert!(session.destination_address.is_none());
        assert!(session.revealed_utxos.is_empty());
        assert_eq!(session.utxo_commitments.len(), participant.utxos.len());
        // The destination never appears in the committed record.
        let json = serde_json::to_string(&session).unwrap();
        assert!(!json.contains(&participant.destination));
    }

    #[test]
    fn reveal_verifies_and_fills_session() {
        let (engine, node, _dir) = engine_with_node();
        let (participant, revealed) = commit_and_reveal(&engine, &node, SOMPI_PER_KAS);
        assert_eq!(revealed.status, CoinJoinStatus::Revealed);
        assert_eq!(revealed.destination_address.as_deref(), Some(participant.destination.as_str()));
        assert_eq!(revealed.revealed_total(), SOMPI_PER_KAS);
    }

    #[test]
    fn reveal_rejects_tampered_utxo() {
        let (engine, node, _dir) = engine_with_node();
        let participant = zt_participant(&node, SOMPI_PER_KAS);
        let session = engine
            .create_zero_trust_session(&participant.destination, &participant.utxos)
            .unwrap();

        let mut tampered = participant.utxos.clone();
        tampered[0].amount += 1;
        let err = engine
            .reveal_session(&session.meta.id, &tampered, &participant.destination, &[])
            .unwrap_err();
        assert!(matches!(err, EngineError::CommitmentInvalid(_)));
    }

    #[test]
    fn reveal_rejects_wrong_destination() {
        let (engine, node, _dir) = engine_with_node();
        let participant = zt_participant(&node, SOMPI_PER_KAS);
        let other = zt_participant(&node, SOMPI_PER_KAS);
        let session = engine
            .create_zero_trust_session(&participant.destination, &participant.utxos)
            .unwrap();

        let err = engine
            .reveal_session(&session.meta.id, &participant.utxos, &other.destination, &[])
            .unwrap_err();
        assert!(matches!(err, EngineError::CommitmentInvalid(_)));
    }

    #[test]
    fn identical_re_reveal_is_idempotent() {
        let (engine, node, _dir) = engine_with_node();
        let (participant, _) = commit_and_reveal(&engine, &node, SOMPI_PER_KAS);
        let id = engine.list_coinjoin_sessions()[0].meta.id.clone();

        let again = engine
            .reveal_session(&id, &participant.utxos, &participant.destination, &[participant.source.clone()])
            .unwrap();
        assert_eq!(again.status, CoinJoinStatus::Revealed);
    }

    #[test]
    fn diverging_re_reveal_rejected() {
        let (engine, node, _dir) = engine_with_node();
        let (participant, _) = commit_and_reveal(&engine, &node, SOMPI_PER_KAS);
        let id = engine.list_coinjoin_sessions()[0].meta.id.clone();

        let other = zt_participant(&node, SOMPI_PER_KAS);
        let err = engine
            .reveal_session(&id, &participant.utxos, &other.destination, &[])
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRevealed));
    }

    #[test]
    fn contribution_policing_enforces_exact_match() {
        let (engine, node, _dir) = engine_with_node();
        commit_and_reveal(&engine, &node, SOMPI_PER_KAS);

        // One sompi off is rejected, exact is accepted.
        let off = zt_participant(&node, SOMPI_PER_KAS + 1);
        let session = engine
            .create_zero_trust_session(&off.destination, &off.utxos)
            .unwrap();
        let err = engine
            .reveal_session(&session.meta.id, &off.utxos, &off.destination, &[])
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::ContributionMismatch {
                expected: SOMPI_PER_KAS,
                actual: SOMPI_PER_KAS + 1
            }
        );

        commit_and_reveal(&engine, &node, SOMPI_PER_KAS);
    }

    // --- Build ---

    #[tokio::test]
    async fn build_requires_minimum_participants() {
        let (engine, node, _dir) = engine_with_node();
        let (_, s) = commit_and_reveal(&engine, &node, SOMPI_PER_KAS);
        let err = engine.build_zero_trust(&[s.meta.id]).await.unwrap_err();
        assert!(matches!(err, EngineError::NotEnoughParticipants { have: 1, need: 10 }));
    }

    #[tokio::test]
    async fn build_ten_equal_participants() {
        let (engine, node, _dir) = engine_with_node();
        let mut ids = Vec::new();
        for _ in 0..10 {
            let (_, s) = commit_and_reveal(&engine, &node, SOMPI_PER_KAS);
            ids.push(s.meta.id);
        }

        let data = engine.build_zero_trust(&ids).await.unwrap();
        assert_eq!(data.participants, 10);
        assert_eq!(data.total_input, 10 * SOMPI_PER_KAS);
        // Every output byte-identical; remainder absorbed by the fee.
        let amounts: HashSet<u64> = data.outputs.iter().map(|o| o.amount).collect();
        assert_eq!(amounts.len(), 1);
        assert_eq!(data.total_output + data.fee, data.total_input);
        assert_eq!(data.outputs.len(), 10);
        assert_eq!(data.outputs[0].amount * 10 + data.fee, data.total_input);
        assert_eq!(data.contribution_stats.min, SOMPI_PER_KAS);
        assert_eq!(data.contribution_stats.max, SOMPI_PER_KAS);
    }

    #[tokio::test]
    async fn build_rejects_contribution_spread() {
        let (engine, node, _dir) = engine_with_node();
        let mut ids = Vec::new();
        for _ in 0..10 {
            let (_, s) = commit_and_reveal(&engine, &node, SOMPI_PER_KAS);
            ids.push(s.meta.id);
        }
        // Doctor one session's revealed set behind the policing window's
        // back to simulate a mismatched contribution at build time.
        let mut doctored = engine.get_coinjoin_session(&ids[9]).unwrap();
        doctored.revealed_utxos[0].amount += 1;
        engine.sessions().set(Session::CoinJoin(doctored)).unwrap();

        let err = engine.build_zero_trust(&ids).await.unwrap_err();
        assert!(matches!(err, EngineError::ContributionMismatch { .. }));
    }

    #[tokio::test]
    async fn build_dedups_shared_utxos_with_owners() {
        let (engine, node, _dir) = engine_with_node();

        // Eight independent participants plus two sharing one UTXO.
        let mut ids = Vec::new();
        for _ in 0..8 {
            let (_, s) = commit_and_reveal(&engine, &node, SOMPI_PER_KAS);
            ids.push(s.meta.id);
        }

        let a = zt_participant(&node, SOMPI_PER_KAS / 2);
        let b = zt_participant(&node, SOMPI_PER_KAS / 2);
        let shared = zt_participant(&node, SOMPI_PER_KAS / 2);

        let mut utxos_a = a.utxos.clone();
        utxos_a.extend_from_slice(&shared.utxos);
        let mut utxos_b = b.utxos.clone();
        utxos_b.extend_from_slice(&shared.utxos);

        let sa = engine.create_zero_trust_session(&a.destination, &utxos_a).unwrap();
        let sb = engine.create_zero_trust_session(&b.destination, &utxos_b).unwrap();
        engine
            .reveal_session(&sa.meta.id, &utxos_a, &a.destination, &[a.source.clone(), shared.source.clone()])
            .unwrap();
        engine
            .reveal_session(&sb.meta.id, &utxos_b, &b.destination, &[b.source.clone(), shared.source.clone()])
            .unwrap();
        ids.push(sa.meta.id.clone());
        ids.push(sb.meta.id.clone());

        let data = engine.build_zero_trust(&ids).await.unwrap();
        // 8 singles + (a, b, shared) = 11 inputs, not 12.
        assert_eq!(data.inputs.len(), 11);

        let shared_outpoint = shared.utxos[0].outpoint();
        let shared_index = data
            .inputs
            .iter()
            .position(|i| i.outpoint == shared_outpoint)
            .unwrap() as u32;
        let owners = &data.input_owners[&shared_index];
        assert!(owners.contains(&sa.meta.id));
        assert!(owners.contains(&sb.meta.id));
        assert_eq!(owners.len(), 2);
    }

    #[tokio::test]
    async fn build_fails_on_unresolvable_utxo() {
        let (engine, node, _dir) = engine_with_node();
        let mut ids = Vec::new();
        for _ in 0..9 {
            let (_, s) = commit_and_reveal(&engine, &node, SOMPI_PER_KAS);
            ids.push(s.meta.id);
        }

        // A participant whose claimed UTXO exists nowhere on chain.
        let ghost = zt_participant(&node, SOMPI_PER_KAS);
        let mut phantom = ghost.utxos.clone();
        phantom[0].transaction_id = kasmix_core::types::Hash256([0xEE; 32]);
        let session = engine
            .create_zero_trust_session(&ghost.destination, &phantom)
            .unwrap();
        engine
            .reveal_session(&session.meta.id, &phantom, &ghost.destination, &[ghost.source.clone()])
            .unwrap();
        ids.push(session.meta.id);

        let err = engine.build_zero_trust(&ids).await.unwrap_err();
        assert!(matches!(err, EngineError::UtxoUnresolved(_)));
    }

    #[tokio::test]
    async fn build_resolves_through_transaction_fallback() {
        let (engine, node, _dir) = engine_with_node();
        let mut ids = Vec::new();
        for _ in 0..9 {
            let (_, s) = commit_and_reveal(&engine, &node, SOMPI_PER_KAS);
            ids.push(s.meta.id);
        }

        // Participant reveals without naming any source address; the UTXO
        // must be found through its originating transaction record.
        let p = zt_participant(&node, SOMPI_PER_KAS);
        let entry = node.utxos_at(&p.source)[0].clone();
        node.insert_record(kasmix_chain::TransactionRecord {
            transaction: kasmix_core::types::Transaction {
                version: 0,
                inputs: vec![],
                outputs: vec![kasmix_core::types::TxOutput {
                    amount: entry.amount,
                    script_public_key: entry.script_public_key.clone(),
                }],
                lock_time: 0,
            },
            block_daa_score: Some(entry.block_daa_score),
        });
        // Point the reveal at the synthetic transaction's outpoint.
        let record_txid = {
            let tx = kasmix_core::types::Transaction {
                version: 0,
                inputs: vec![],
                outputs: vec![kasmix_core::types::TxOutput {
                    amount: entry.amount,
                    script_public_key: entry.script_public_key.clone(),
                }],
                lock_time: 0,
            };
            tx.id().unwrap()
        };
        let utxos = vec![SerializedUtxo {
            transaction_id: record_txid,
            index: 0,
            amount: entry.amount,
        }];
        let session = engine.create_zero_trust_session(&p.destination, &utxos).unwrap();
        engine
            .reveal_session(&session.meta.id, &utxos, &p.destination, &[])
            .unwrap();
        ids.push(session.meta.id);

        let data = engine.build_zero_trust(&ids).await.unwrap();
        assert_eq!(data.participants, 10);
        let fallback_input = data
            .inputs
            .iter()
            .find(|i| i.outpoint.transaction_id == record_txid)
            .unwrap();
        assert_eq!(fallback_input.source_address, p.source);
    }

    #[tokio::test]
    async fn build_locks_participants() {
        let (engine, node, _dir) = engine_with_node();
        let mut ids = Vec::new();
        for _ in 0..10 {
            let (_, s) = commit_and_reveal(&engine, &node, SOMPI_PER_KAS);
            ids.push(s.meta.id);
        }
        let _guard = engine.lock_session(&ids[3]).unwrap();
        let err = engine.build_zero_trust(&ids).await.unwrap_err();
        assert!(matches!(err, EngineError::SessionBusy));
    }

    // --- Sign / submit ---

    async fn built_ten(
        engine: &Engine,
        node: &std::sync::Arc<kasmix_chain::MockNode>,
    ) -> (Vec<Participant>, Vec<SessionId>, CoinJoinTxData) {
        let mut participants = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..10 {
            let (p, s) = commit_and_reveal(engine, node, SOMPI_PER_KAS);
            participants.push(p);
            ids.push(s.meta.id);
        }
        let data = engine.build_zero_trust(&ids).await.unwrap();
        (participants, ids, data)
    }

    #[tokio::test]
    async fn each_participant_signs_only_their_inputs() {
        let (engine, node, _dir) = engine_with_node();
        let (participants, ids, data) = built_ten(&engine, &node).await;

        let sigs = engine
            .sign_coinjoin_inputs(&ids[0], &data, &participants[0].key_hex)
            .unwrap();
        let claimed = data.indices_owned_by(&ids[0]);
        assert_eq!(sigs.len(), claimed.len());
        for index in sigs.keys() {
            assert!(claimed.contains(index));
        }
    }

    #[tokio::test]
    async fn wrong_key_is_key_utxo_mismatch() {
        let (engine, node, _dir) = engine_with_node();
        let (participants, ids, data) = built_ten(&engine, &node).await;

        let err = engine
            .sign_coinjoin_inputs(&ids[0], &data, &participants[1].key_hex)
            .unwrap_err();
        assert!(matches!(err, EngineError::KeyUtxoMismatch(_)));
    }

    #[tokio::test]
    async fn signatures_fan_out_to_pending_buffers() {
        let (engine, node, _dir) = engine_with_node();
        let (participants, ids, data) = built_ten(&engine, &node).await;

        engine
            .sign_coinjoin_inputs(&ids[0], &data, &participants[0].key_hex)
            .unwrap();
        engine
            .sign_coinjoin_inputs(&ids[1], &data, &participants[1].key_hex)
            .unwrap();

        // Any peer can read the aggregated buffer.
        let pending = engine
            .pending_coinjoin_transaction(&ids[5])
            .unwrap()
            .unwrap();
        assert_eq!(pending.tx_hash, data.content_hash());
        let expected: usize = data.indices_owned_by(&ids[0]).len() + data.indices_owned_by(&ids[1]).len();
        assert_eq!(pending.signatures.len(), expected);
    }

    #[tokio::test]
    async fn divergent_pending_hash_invalidates_cache() {
        let (engine, node, _dir) = engine_with_node();
        let (participants, ids, data) = built_ten(&engine, &node).await;
        engine
            .sign_coinjoin_inputs(&ids[0], &data, &participants[0].key_hex)
            .unwrap();

        // Corrupt the stored buffer's hash binding.
        let mut session = engine.get_coinjoin_session(&ids[0]).unwrap();
        session.pending_transaction.as_mut().unwrap().transaction_data.fee += 1;
        engine.sessions().set(Session::CoinJoin(session)).unwrap();

        assert!(engine.pending_coinjoin_transaction(&ids[0]).unwrap().is_none());
        // And the invalidation is persisted.
        assert!(engine
            .get_coinjoin_session(&ids[0])
            .unwrap()
            .pending_transaction
            .is_none());
    }

    async fn sign_all_participants(
        engine: &Engine,
        participants: &[Participant],
        ids: &[SessionId],
        data: &CoinJoinTxData,
    ) -> BTreeMap<u32, String> {
        let mut all = BTreeMap::new();
        for (participant, id) in participants.iter().zip(ids) {
            let sigs = engine
                .sign_coinjoin_inputs(id, data, &participant.key_hex)
                .unwrap();
            all.extend(sigs);
        }
        all
    }

    #[tokio::test]
    async fn full_sign_and_submit_completes_sessions() {
        let (engine, node, _dir) = engine_with_node();
        let (participants, ids, data) = built_ten(&engine, &node).await;
        let signatures = sign_all_participants(&engine, &participants, &ids, &data).await;

        let tx_id = engine.submit_coinjoin(&data, &signatures).await.unwrap();

        for id in &ids {
            let session = engine.get_coinjoin_session(id).unwrap();
            assert_eq!(session.status, CoinJoinStatus::Completed);
            assert_eq!(session.coinjoin_tx_id.as_deref(), Some(tx_id.to_string().as_str()));
            assert!(session.pending_transaction.is_none());
            assert!(session.completed_at.is_some());
        }

        // On-chain equal outputs.
        node.confirm_pending();
        for participant in &participants {
            let received: u64 = node
                .utxos_at(&participant.destination)
                .iter()
                .map(|u| u.amount)
                .sum();
            assert_eq!(received, data.outputs[0].amount);
        }
    }

    #[tokio::test]
    async fn submit_requires_every_signature() {
        let (engine, node, _dir) = engine_with_node();
        let (participants, ids, data) = built_ten(&engine, &node).await;
        let mut signatures = sign_all_participants(&engine, &participants, &ids, &data).await;
        signatures.remove(&0);

        let err = engine.submit_coinjoin(&data, &signatures).await.unwrap_err();
        assert!(matches!(err, EngineError::BadInput(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn submit_retries_sequence_lock_then_succeeds() {
        let (engine, node, _dir) = engine_with_node();
        let (participants, ids, data) = built_ten(&engine, &node).await;
        let signatures = sign_all_participants(&engine, &participants, &ids, &data).await;

        node.queue_submit_failure(kasmix_chain::RpcError::SequenceLockNotMet);
        node.queue_submit_failure(kasmix_chain::RpcError::SequenceLockNotMet);

        let start = tokio::time::Instant::now();
        let tx_id = engine.submit_coinjoin(&data, &signatures).await.unwrap();
        // Two backoffs: 1 s + 2 s.
        assert!(start.elapsed() >= Duration::from_millis(2_900));
        assert_eq!(node.submitted(), vec![tx_id]);

        // Completed exactly once.
        let completed = ids
            .iter()
            .filter(|id| {
                engine.get_coinjoin_session(id).unwrap().status == CoinJoinStatus::Completed
            })
            .count();
        assert_eq!(completed, 10);
    }

    #[tokio::test]
    async fn resubmission_is_idempotent() {
        let (engine, node, _dir) = engine_with_node();
        let (participants, ids, data) = built_ten(&engine, &node).await;
        let signatures = sign_all_participants(&engine, &participants, &ids, &data).await;

        let first = engine.submit_coinjoin(&data, &signatures).await.unwrap();
        let second = engine.submit_coinjoin(&data, &signatures).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(node.submitted().len(), 1);
    }

    // --- Stats / cleanup ---

    #[test]
    fn stats_count_by_status_and_mode() {
        let (engine, node, _dir) = engine_with_node();
        commit_and_reveal(&engine, &node, SOMPI_PER_KAS);
        let p = zt_participant(&node, SOMPI_PER_KAS);
        engine.create_zero_trust_session(&p.destination, &p.utxos).unwrap();

        let stats = engine.coinjoin_stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.zero_trust, 2);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.revealed, 1);
    }

    #[tokio::test]
    async fn lobby_cleanup_drops_stale_buffers() {
        let (engine, node, _dir) = engine_with_node();
        let (participants, ids, data) = built_ten(&engine, &node).await;
        engine
            .sign_coinjoin_inputs(&ids[0], &data, &participants[0].key_hex)
            .unwrap();

        // Age the buffer past expiry.
        let mut session = engine.get_coinjoin_session(&ids[0]).unwrap();
        session.pending_transaction.as_mut().unwrap().updated_at = 1;
        engine.sessions().set(Session::CoinJoin(session)).unwrap();

        engine.lobby_cleanup_tick();
        assert!(engine
            .get_coinjoin_session(&ids[0])
            .unwrap()
            .pending_transaction
            .is_none());
    }
}
