//! UTXO helpers: DAA score cache, confirmation filter, matching search.
//!
//! The DAA score is the confirmation clock. It is memoised with a short
//! TTL so monitor iterations hitting many sessions share one node query;
//! stale reads are acceptable because the confirmation margin is wide.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use kasmix_chain::{ChainRpc, RpcError};
use kasmix_core::constants::{DAA_CACHE_TTL_MS, MIN_CONFIRMATIONS};
use kasmix_core::types::{Outpoint, UtxoEntry};

use crate::error::WalletError;

struct DaaSample {
    score: u64,
    fetched_at: Instant,
}

/// Shared UTXO and DAA-score facilities over the chain RPC.
pub struct UtxoManager {
    rpc: Arc<dyn ChainRpc>,
    daa_cache: Mutex<Option<DaaSample>>,
}

impl UtxoManager {
    pub fn new(rpc: Arc<dyn ChainRpc>) -> Self {
        Self {
            rpc,
            daa_cache: Mutex::new(None),
        }
    }

    pub fn rpc(&self) -> &Arc<dyn ChainRpc> {
        &self.rpc
    }

    /// The current virtual DAA score, memoised with a 5 s TTL.
    ///
    /// Any node failure surfaces as [`RpcError::NodeUnready`]: callers
    /// making confirmation decisions must not proceed on a stale clock
    /// older than the TTL.
    pub async fn current_daa_score(&self) -> Result<u64, WalletError> {
        let ttl = Duration::from_millis(DAA_CACHE_TTL_MS);
        if let Some(sample) = self.daa_cache.lock().as_ref() {
            if sample.fetched_at.elapsed() < ttl {
                return Ok(sample.score);
            }
        }
        self.refresh_daa_score().await
    }

    /// Fetch a fresh DAA score, bypassing the cache.
    pub async fn refresh_daa_score(&self) -> Result<u64, WalletError> {
        let info = self
            .rpc
            .get_block_dag_info()
            .await
            .map_err(|e| WalletError::Rpc(RpcError::NodeUnready(e.to_string())))?;
        let score = info.virtual_daa_score;
        *self.daa_cache.lock() = Some(DaaSample {
            score,
            fetched_at: Instant::now(),
        });
        debug!(score, "virtual DAA score refreshed");
        Ok(score)
    }

    /// Raw UTXO list at one address.
    pub async fn fetch_utxos(&self, address: &str) -> Result<Vec<UtxoEntry>, WalletError> {
        Ok(self
            .rpc
            .get_utxos_by_addresses(&[address.to_string()])
            .await?)
    }

    /// Confirmed UTXOs at one address plus their sum.
    ///
    /// An entry counts as confirmed when its accepting block's DAA score
    /// is known (`> 0`) and at least `min_confirmations` behind the
    /// current score.
    pub async fn confirmed_utxos(
        &self,
        address: &str,
        min_confirmations: u64,
    ) -> Result<(Vec<UtxoEntry>, u64), WalletError> {
        let current = self.current_daa_score().await?;
        let entries = self.fetch_utxos(address).await?;
        let confirmed: Vec<UtxoEntry> = entries
            .into_iter()
            .filter(|e| e.block_daa_score > 0 && e.confirmations(current) >= min_confirmations)
            .collect();
        let sum = confirmed.iter().map(|e| e.amount).sum();
        Ok((confirmed, sum))
    }

    /// Confirmed UTXOs with the default confirmation depth.
    pub async fn default_confirmed_utxos(
        &self,
        address: &str,
    ) -> Result<(Vec<UtxoEntry>, u64), WalletError> {
        self.confirmed_utxos(address, MIN_CONFIRMATIONS).await
    }

    /// Find a confirmed UTXO matching `target`: exact amount first, then
    /// anything within ±`tolerance_pct` percent. Outpoints in `exclude`
    /// are already promised to other sessions and never returned.
    pub async fn has_matching_utxo(
        &self,
        address: &str,
        target: u64,
        tolerance_pct: u64,
        exclude: &HashSet<Outpoint>,
    ) -> Result<Option<UtxoEntry>, WalletError> {
        let (confirmed, _) = self.confirmed_utxos(address, MIN_CONFIRMATIONS).await?;
        let candidates: Vec<&UtxoEntry> = confirmed
            .iter()
            .filter(|e| !exclude.contains(&e.outpoint))
            .collect();

        if let Some(exact) = candidates.iter().find(|e| e.amount == target) {
            return Ok(Some((**exact).clone()));
        }

        let slack = target / 100 * tolerance_pct;
        let lo = target.saturating_sub(slack);
        let hi = target.saturating_add(slack);
        Ok(candidates
            .iter()
            .find(|e| e.amount >= lo && e.amount <= hi)
            .map(|e| (**e).clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kasmix_chain::MockNode;
    use kasmix_core::address::{Address, Network};
    use kasmix_core::crypto::KeyPair;

    fn setup() -> (Arc<MockNode>, UtxoManager, String) {
        let node = Arc::new(MockNode::new());
        let manager = UtxoManager::new(node.clone() as Arc<dyn ChainRpc>);
        let kp = KeyPair::generate();
        let address = Address::from_public_key(&kp.public_key(), Network::Mainnet).encode();
        (node, manager, address)
    }

    #[tokio::test]
    async fn daa_score_is_cached() {
        let (node, manager, _) = setup();
        node.set_daa_score(5_000);
        assert_eq!(manager.current_daa_score().await.unwrap(), 5_000);

        // Within the TTL, the cached value is served even after advance.
        node.set_daa_score(6_000);
        assert_eq!(manager.current_daa_score().await.unwrap(), 5_000);

        // Explicit refresh bypasses the cache.
        assert_eq!(manager.refresh_daa_score().await.unwrap(), 6_000);
    }

    #[tokio::test]
    async fn daa_failure_maps_to_node_unready() {
        let (node, manager, _) = setup();
        node.set_fail_all(Some(RpcError::Disconnected("down".into())));
        match manager.refresh_daa_score().await.unwrap_err() {
            WalletError::Rpc(RpcError::NodeUnready(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn confirmed_filter_applies_depth_and_score() {
        let (node, manager, address) = setup();
        node.set_daa_score(10_000);
        node.add_utxo(&address, 100, 10_000 - MIN_CONFIRMATIONS); // exactly at depth
        node.add_utxo(&address, 200, 10_000 - 5); // too shallow
        node.add_utxo(&address, 300, 0); // mempool-only

        let (confirmed, sum) = manager
            .confirmed_utxos(&address, MIN_CONFIRMATIONS)
            .await
            .unwrap();
        assert_eq!(confirmed.len(), 1);
        assert_eq!(sum, 100);
    }

    #[tokio::test]
    async fn matching_prefers_exact() {
        let (node, manager, address) = setup();
        node.add_confirmed_utxo(&address, 105_000_000); // within tolerance
        node.add_confirmed_utxo(&address, 100_000_000); // exact

        let found = manager
            .has_matching_utxo(&address, 100_000_000, 10, &HashSet::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.amount, 100_000_000);
    }

    #[tokio::test]
    async fn matching_falls_back_to_tolerance() {
        let (node, manager, address) = setup();
        node.add_confirmed_utxo(&address, 109_000_000); // within +10%
        node.add_confirmed_utxo(&address, 150_000_000); // outside

        let found = manager
            .has_matching_utxo(&address, 100_000_000, 10, &HashSet::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.amount, 109_000_000);
    }

    #[tokio::test]
    async fn matching_honours_exclusions() {
        let (node, manager, address) = setup();
        let outpoint = node.add_confirmed_utxo(&address, 100_000_000);

        let exclude: HashSet<Outpoint> = [outpoint].into();
        let found = manager
            .has_matching_utxo(&address, 100_000_000, 10, &exclude)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn matching_none_when_out_of_range() {
        let (node, manager, address) = setup();
        node.add_confirmed_utxo(&address, 50_000_000);
        let found = manager
            .has_matching_utxo(&address, 100_000_000, 10, &HashSet::new())
            .await
            .unwrap();
        assert!(found.is_none());
    }
}
