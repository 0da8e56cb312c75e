//! Shared test fixtures for the engine crate.

use std::sync::Arc;

use kasmix_chain::{ChainRpc, MockNode};
use kasmix_core::address::{Address, Network};
use kasmix_core::crypto::KeyPair;
use kasmix_core::types::SerializedUtxo;
use kasmix_session::{Destination, SessionStore};
use kasmix_wallet::{Wallet, WalletStore};

use crate::config::EngineConfig;
use crate::context::Engine;

/// A fresh engine over a mock node and temp-dir stores.
pub(crate) fn engine_with_node() -> (Engine, Arc<MockNode>, tempfile::TempDir) {
    let node = Arc::new(MockNode::new());
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(SessionStore::open(dir.path().join("sessions.json")).unwrap());
    let wallet_store = Arc::new(WalletStore::open(dir.path().join("wallet.json")).unwrap());
    let wallet = Arc::new(Wallet::new(
        node.clone() as Arc<dyn ChainRpc>,
        wallet_store,
        Network::Mainnet,
    ));
    let engine = Engine::new(
        node.clone() as Arc<dyn ChainRpc>,
        sessions,
        wallet,
        EngineConfig::default(),
    );
    (engine, node, dir)
}

/// A fresh mainnet destination wanting `amount`.
pub(crate) fn dest(amount: u64) -> Destination {
    let kp = KeyPair::generate();
    Destination {
        address: Address::from_public_key(&kp.public_key(), Network::Mainnet).encode(),
        amount,
    }
}

/// Plant a confirmed UTXO at an address.
pub(crate) fn fund_confirmed(node: &Arc<MockNode>, address: &str, amount: u64) {
    node.add_confirmed_utxo(address, amount);
}

/// A zero-trust participant: one funded source UTXO, a destination, and
/// the key controlling the source.
pub(crate) struct Participant {
    pub utxos: Vec<SerializedUtxo>,
    pub destination: String,
    pub source: String,
    pub key_hex: String,
}

/// Create a participant whose single confirmed UTXO holds `amount`.
pub(crate) fn zt_participant(node: &Arc<MockNode>, amount: u64) -> Participant {
    let source_key = KeyPair::generate();
    let source = Address::from_public_key(&source_key.public_key(), Network::Mainnet).encode();
    let outpoint = node.add_confirmed_utxo(&source, amount);

    let dest_key = KeyPair::generate();
    let destination = Address::from_public_key(&dest_key.public_key(), Network::Mainnet).encode();

    Participant {
        utxos: vec![SerializedUtxo {
            transaction_id: outpoint.transaction_id,
            index: outpoint.index,
            amount,
        }],
        destination,
        source,
        key_hex: source_key.secret_hex(),
    }
}
