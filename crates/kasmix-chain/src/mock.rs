//! Scriptable in-memory chain node for tests.
//!
//! [`MockNode`] implements [`ChainRpc`] over a mutex-guarded state bag:
//! UTXO sets keyed by address string, a virtual DAA score the test
//! advances by hand, a pending list of submitted transactions, and a
//! queue of scripted submission failures. `confirm_pending` plays the
//! role of block acceptance: it credits every pending transaction's
//! outputs as confirmed UTXOs at the current DAA score.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use kasmix_core::address::{Address, Network};
use kasmix_core::types::{Hash256, Outpoint, Transaction, TransactionId, UtxoEntry};

use crate::api::{BlockDagInfo, ChainRpc, FeeEstimate, MempoolEntry, RpcBlock, TransactionRecord};
use crate::error::RpcError;

#[derive(Default)]
struct MockState {
    daa_score: u64,
    priority_feerate: u64,
    utxos: HashMap<String, Vec<UtxoEntry>>,
    records: HashMap<TransactionId, TransactionRecord>,
    pending: Vec<Transaction>,
    submitted_ids: Vec<TransactionId>,
    submit_failures: VecDeque<RpcError>,
    fail_all: Option<RpcError>,
    next_synth_txid: u64,
}

/// In-memory [`ChainRpc`] implementation with test hooks.
pub struct MockNode {
    network: Network,
    state: Mutex<MockState>,
}

impl MockNode {
    pub fn new() -> Self {
        Self::with_network(Network::Mainnet)
    }

    pub fn with_network(network: Network) -> Self {
        Self {
            network,
            state: Mutex::new(MockState {
                daa_score: 10_000,
                priority_feerate: 1,
                ..MockState::default()
            }),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    // --- Scripting hooks ---

    pub fn set_daa_score(&self, score: u64) {
        self.state.lock().daa_score = score;
    }

    pub fn advance_daa(&self, delta: u64) {
        self.state.lock().daa_score += delta;
    }

    pub fn daa_score(&self) -> u64 {
        self.state.lock().daa_score
    }

    pub fn set_priority_feerate(&self, feerate: u64) {
        self.state.lock().priority_feerate = feerate;
    }

    /// Plant a UTXO at an address with an explicit accepting DAA score.
    /// Returns the synthetic outpoint.
    pub fn add_utxo(&self, address: &str, amount: u64, block_daa_score: u64) -> Outpoint {
        let spk = Address::decode(address)
            .expect("mock add_utxo requires a valid address")
            .script_public_key();
        let mut state = self.state.lock();
        state.next_synth_txid += 1;
        let mut txid = [0u8; 32];
        txid[..8].copy_from_slice(&state.next_synth_txid.to_le_bytes());
        txid[8] = 0x5E; // marks synthetic ids in test failures
        let outpoint = Outpoint { transaction_id: Hash256(txid), index: 0 };
        state.utxos.entry(address.to_string()).or_default().push(UtxoEntry {
            outpoint,
            amount,
            script_public_key: spk,
            block_daa_score,
            is_coinbase: false,
        });
        outpoint
    }

    /// Plant a UTXO that is already well confirmed at the current score.
    pub fn add_confirmed_utxo(&self, address: &str, amount: u64) -> Outpoint {
        let score = self.daa_score().saturating_sub(1_000);
        self.add_utxo(address, amount, score)
    }

    /// Plant a full entry verbatim (for foreign scripts and edge cases).
    pub fn add_utxo_entry(&self, address: &str, entry: UtxoEntry) {
        self.state.lock().utxos.entry(address.to_string()).or_default().push(entry);
    }

    /// Make a transaction discoverable through `get_transaction`.
    pub fn insert_record(&self, record: TransactionRecord) {
        if let Ok(id) = record.transaction.id() {
            self.state.lock().records.insert(id, record);
        }
    }

    /// The next `submit_transaction` call pops this failure instead.
    pub fn queue_submit_failure(&self, error: RpcError) {
        self.state.lock().submit_failures.push_back(error);
    }

    /// Make every RPC call fail with the given error until cleared.
    pub fn set_fail_all(&self, error: Option<RpcError>) {
        self.state.lock().fail_all = error;
    }

    /// Ids of all successfully submitted transactions, in order.
    pub fn submitted(&self) -> Vec<TransactionId> {
        self.state.lock().submitted_ids.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Accept all pending transactions: credit their outputs as confirmed
    /// UTXOs at the current DAA score and record them for lookup.
    pub fn confirm_pending(&self) {
        let mut state = self.state.lock();
        let daa = state.daa_score;
        let pending = std::mem::take(&mut state.pending);
        for tx in pending {
            let Ok(id) = tx.id() else { continue };
            for (index, output) in tx.outputs.iter().enumerate() {
                let Ok(addr) =
                    Address::from_script_public_key(&output.script_public_key, self.network)
                else {
                    continue;
                };
                state.utxos.entry(addr.encode()).or_default().push(UtxoEntry {
                    outpoint: Outpoint { transaction_id: id, index: index as u32 },
                    amount: output.amount,
                    script_public_key: output.script_public_key.clone(),
                    block_daa_score: daa,
                    is_coinbase: false,
                });
            }
            state.records.insert(
                id,
                TransactionRecord { transaction: tx, block_daa_score: Some(daa) },
            );
        }
    }

    /// Current UTXO list at an address (test assertions).
    pub fn utxos_at(&self, address: &str) -> Vec<UtxoEntry> {
        self.state.lock().utxos.get(address).cloned().unwrap_or_default()
    }

    fn check_fail_all(&self) -> Result<(), RpcError> {
        if let Some(err) = &self.state.lock().fail_all {
            return Err(err.clone());
        }
        Ok(())
    }
}

impl Default for MockNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainRpc for MockNode {
    async fn get_utxos_by_addresses(
        &self,
        addresses: &[String],
    ) -> Result<Vec<UtxoEntry>, RpcError> {
        self.check_fail_all()?;
        let state = self.state.lock();
        let mut out = Vec::new();
        for addr in addresses {
            if let Some(entries) = state.utxos.get(addr) {
                out.extend(entries.iter().cloned());
            }
        }
        Ok(out)
    }

    async fn get_block_dag_info(&self) -> Result<BlockDagInfo, RpcError> {
        self.check_fail_all()?;
        Ok(BlockDagInfo {
            virtual_daa_score: self.state.lock().daa_score,
            network_name: match self.network {
                Network::Mainnet => "kaspa-mainnet".to_string(),
                Network::Testnet => "kaspa-testnet".to_string(),
            },
        })
    }

    async fn get_fee_estimate(&self) -> Result<FeeEstimate, RpcError> {
        self.check_fail_all()?;
        let feerate = self.state.lock().priority_feerate;
        Ok(FeeEstimate {
            priority_feerate: feerate,
            normal_feerate: feerate.max(1),
            low_feerate: 1,
        })
    }

    async fn submit_transaction(&self, tx: &Transaction) -> Result<TransactionId, RpcError> {
        self.check_fail_all()?;
        let id = tx
            .id()
            .map_err(|e| RpcError::Other(format!("unencodable transaction: {e}")))?;

        let mut state = self.state.lock();
        if let Some(err) = state.submit_failures.pop_front() {
            return Err(err);
        }

        // Resubmission of a known transaction behaves like the real node.
        if state.records.contains_key(&id)
            || state.pending.iter().any(|p| p.id().ok() == Some(id))
        {
            return Err(RpcError::AlreadyInMempool { tx_id: Some(id) });
        }

        // Consume the spent outpoints.
        for input in &tx.inputs {
            for entries in state.utxos.values_mut() {
                entries.retain(|e| e.outpoint != input.previous_outpoint);
            }
        }

        state.pending.push(tx.clone());
        state.submitted_ids.push(id);
        Ok(id)
    }

    async fn get_mempool_entries_by_addresses(
        &self,
        addresses: &[String],
    ) -> Result<Vec<MempoolEntry>, RpcError> {
        self.check_fail_all()?;
        let state = self.state.lock();
        let mut out = Vec::new();
        for tx in &state.pending {
            let touches = tx.outputs.iter().any(|o| {
                Address::from_script_public_key(&o.script_public_key, self.network)
                    .map(|a| addresses.contains(&a.encode()))
                    .unwrap_or(false)
            });
            if touches {
                out.push(MempoolEntry {
                    transaction: tx.clone(),
                    fee: 0,
                    is_orphan: false,
                });
            }
        }
        Ok(out)
    }

    async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<TransactionRecord>, RpcError> {
        self.check_fail_all()?;
        Ok(self.state.lock().records.get(&id).cloned())
    }

    async fn get_block(&self, _hash: Hash256) -> Result<Option<RpcBlock>, RpcError> {
        self.check_fail_all()?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kasmix_core::crypto::{script_for_public_key, KeyPair};
    use kasmix_core::types::{ScriptPublicKey, TxInput, TxOutput};

    fn addr_for(kp: &KeyPair) -> String {
        Address::from_public_key(&kp.public_key(), Network::Mainnet).encode()
    }

    fn pay_to(kp: &KeyPair, amount: u64, spending: Outpoint) -> Transaction {
        Transaction {
            version: 0,
            inputs: vec![TxInput {
                previous_outpoint: spending,
                signature_script: vec![0x40; 65],
                sequence: 0,
            }],
            outputs: vec![TxOutput {
                amount,
                script_public_key: script_for_public_key(&kp.public_key()),
            }],
            lock_time: 0,
        }
    }

    #[tokio::test]
    async fn planted_utxos_are_returned() {
        let node = MockNode::new();
        let kp = KeyPair::generate();
        let addr = addr_for(&kp);
        node.add_confirmed_utxo(&addr, 500);

        let utxos = node.get_utxos_by_addresses(&[addr]).await.unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].amount, 500);
    }

    #[tokio::test]
    async fn submit_confirm_cycle_credits_outputs() {
        let node = MockNode::new();
        let source = KeyPair::generate();
        let dest = KeyPair::generate();
        let outpoint = node.add_confirmed_utxo(&addr_for(&source), 1_000);

        let tx = pay_to(&dest, 900, outpoint);
        let id = node.submit_transaction(&tx).await.unwrap();
        assert_eq!(node.pending_count(), 1);

        // The spent UTXO is gone immediately.
        assert!(node.utxos_at(&addr_for(&source)).is_empty());

        node.confirm_pending();
        let utxos = node.utxos_at(&addr_for(&dest));
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].outpoint.transaction_id, id);
        assert_eq!(utxos[0].block_daa_score, node.daa_score());

        // And the transaction is now discoverable.
        let rec = node.get_transaction(id).await.unwrap().unwrap();
        assert_eq!(rec.block_daa_score, Some(node.daa_score()));
    }

    #[tokio::test]
    async fn resubmission_reports_already_in_mempool() {
        let node = MockNode::new();
        let kp = KeyPair::generate();
        let outpoint = node.add_confirmed_utxo(&addr_for(&kp), 1_000);
        let tx = pay_to(&kp, 900, outpoint);

        let id = node.submit_transaction(&tx).await.unwrap();
        let err = node.submit_transaction(&tx).await.unwrap_err();
        assert_eq!(err, RpcError::AlreadyInMempool { tx_id: Some(id) });
    }

    #[tokio::test]
    async fn scripted_failures_pop_in_order() {
        let node = MockNode::new();
        let kp = KeyPair::generate();
        let outpoint = node.add_confirmed_utxo(&addr_for(&kp), 1_000);
        let tx = pay_to(&kp, 900, outpoint);

        node.queue_submit_failure(RpcError::SequenceLockNotMet);
        assert_eq!(
            node.submit_transaction(&tx).await.unwrap_err(),
            RpcError::SequenceLockNotMet
        );
        assert!(node.submit_transaction(&tx).await.is_ok());
    }

    #[tokio::test]
    async fn fail_all_blocks_every_call() {
        let node = MockNode::new();
        node.set_fail_all(Some(RpcError::NodeUnready("syncing".into())));
        assert!(node.get_block_dag_info().await.is_err());
        node.set_fail_all(None);
        assert!(node.get_block_dag_info().await.is_ok());
    }

    #[tokio::test]
    async fn foreign_scripts_are_skipped_on_confirm() {
        let node = MockNode::new();
        let kp = KeyPair::generate();
        let outpoint = node.add_confirmed_utxo(&addr_for(&kp), 1_000);

        let mut tx = pay_to(&kp, 900, outpoint);
        tx.outputs[0].script_public_key = ScriptPublicKey { version: 0, script: vec![0x51] };
        node.submit_transaction(&tx).await.unwrap();
        node.confirm_pending();
        // Nothing credited anywhere, but no panic either.
        assert_eq!(node.pending_count(), 0);
    }
}
