//! Shared fixtures for the integration tests.

use std::sync::Arc;

use kasmix_chain::{ChainRpc, MockNode};
use kasmix_core::address::{Address, Network};
use kasmix_core::crypto::KeyPair;
use kasmix_core::types::SerializedUtxo;
use kasmix_engine::{Engine, EngineConfig};
use kasmix_session::{Destination, SessionStore};
use kasmix_wallet::{Wallet, WalletStore};

/// A complete service instance over a mock node and temp-dir stores.
pub struct Harness {
    pub engine: Arc<Engine>,
    pub node: Arc<MockNode>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let node = Arc::new(MockNode::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let sessions = Arc::new(
            SessionStore::open(dir.path().join("sessions.json")).expect("session store"),
        );
        let wallet_store =
            Arc::new(WalletStore::open(dir.path().join("wallet.json")).expect("wallet store"));
        let wallet = Arc::new(Wallet::new(
            node.clone() as Arc<dyn ChainRpc>,
            wallet_store,
            Network::Mainnet,
        ));
        let engine = Arc::new(Engine::new(
            node.clone() as Arc<dyn ChainRpc>,
            sessions,
            wallet,
            config,
        ));
        Self { engine, node, _dir: dir }
    }

    /// Simulate block acceptance: confirm pending transactions and age
    /// them past the confirmation depth.
    pub fn mine(&self) {
        self.node.advance_daa(100);
        self.node.confirm_pending();
        self.node.advance_daa(100);
    }

    /// Sum of confirmed amounts currently sitting at an address.
    pub fn balance_at(&self, address: &str) -> u64 {
        self.node.utxos_at(address).iter().map(|u| u.amount).sum()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// A fresh mainnet address string.
pub fn fresh_address() -> String {
    let kp = KeyPair::generate();
    Address::from_public_key(&kp.public_key(), Network::Mainnet).encode()
}

/// A destination wanting `amount` sompi.
pub fn destination(amount: u64) -> Destination {
    Destination { address: fresh_address(), amount }
}

/// A zero-trust participant: a funded source UTXO, its key, and a
/// payout destination.
pub struct Participant {
    pub utxos: Vec<SerializedUtxo>,
    pub destination: String,
    pub source: String,
    pub key_hex: String,
}

/// Fund a fresh participant with one confirmed UTXO of `amount` sompi.
pub fn participant(node: &Arc<MockNode>, amount: u64) -> Participant {
    let key = KeyPair::generate();
    let source = Address::from_public_key(&key.public_key(), Network::Mainnet).encode();
    let outpoint = node.add_confirmed_utxo(&source, amount);
    Participant {
        utxos: vec![SerializedUtxo {
            transaction_id: outpoint.transaction_id,
            index: outpoint.index,
            amount,
        }],
        destination: fresh_address(),
        source,
        key_hex: key.secret_hex(),
    }
}
