//! jsonrpsee WebSocket implementation of [`ChainRpc`].
//!
//! The client is created cheaply without touching the network; the
//! WebSocket is dialled on first use and cached. Any transport-level
//! failure drops the cached connection so the next call redials, which
//! gives the "reconnect on first failure" behaviour the monitors rely on.

use std::sync::Arc;

use async_trait::async_trait;
use jsonrpsee::core::client::{ClientT, Error as ClientError};
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::rpc_params;
use jsonrpsee::ws_client::{WsClient, WsClientBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use kasmix_core::types::{Hash256, Transaction, TransactionId, UtxoEntry};

use crate::api::{BlockDagInfo, ChainRpc, FeeEstimate, MempoolEntry, RpcBlock, TransactionRecord};
use crate::classify::classify;
use crate::error::RpcError;

/// Wire shape of a successful `submitTransaction` response.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitTransactionResponse {
    transaction_id: TransactionId,
}

/// A lazily-connected WebSocket JSON-RPC client for the chain node.
pub struct NodeClient {
    url: String,
    inner: tokio::sync::RwLock<Option<Arc<WsClient>>>,
}

impl NodeClient {
    /// Create a client for the given `ws://` URL. Does not connect.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            inner: tokio::sync::RwLock::new(None),
        }
    }

    /// The node URL this client dials.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the cached connection, dialling if necessary.
    async fn connection(&self) -> Result<Arc<WsClient>, RpcError> {
        if let Some(client) = self.inner.read().await.as_ref() {
            return Ok(Arc::clone(client));
        }

        let mut guard = self.inner.write().await;
        // Another caller may have connected while we waited for the lock.
        if let Some(client) = guard.as_ref() {
            return Ok(Arc::clone(client));
        }

        debug!(url = %self.url, "dialling chain node");
        let client = WsClientBuilder::default()
            .build(&self.url)
            .await
            .map_err(|e| RpcError::Disconnected(e.to_string()))?;
        let client = Arc::new(client);
        *guard = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Drop the cached connection so the next call redials.
    async fn reset(&self) {
        *self.inner.write().await = None;
    }

    /// Perform one request, mapping failures and resetting the connection
    /// on transport errors.
    async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: ArrayParams,
    ) -> Result<R, RpcError> {
        let client = self.connection().await?;
        match client.request::<R, _>(method, params).await {
            Ok(value) => Ok(value),
            Err(ClientError::Call(err)) => Err(classify(err.message())),
            Err(err) => {
                warn!(url = %self.url, method, error = %err, "transport failure, resetting connection");
                self.reset().await;
                Err(RpcError::Disconnected(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl ChainRpc for NodeClient {
    async fn get_utxos_by_addresses(
        &self,
        addresses: &[String],
    ) -> Result<Vec<UtxoEntry>, RpcError> {
        self.call("getUtxosByAddresses", rpc_params![addresses]).await
    }

    async fn get_block_dag_info(&self) -> Result<BlockDagInfo, RpcError> {
        self.call("getBlockDagInfo", rpc_params![]).await
    }

    async fn get_fee_estimate(&self) -> Result<FeeEstimate, RpcError> {
        self.call("getFeeEstimate", rpc_params![]).await
    }

    async fn submit_transaction(&self, tx: &Transaction) -> Result<TransactionId, RpcError> {
        let response: SubmitTransactionResponse =
            self.call("submitTransaction", rpc_params![tx]).await?;
        Ok(response.transaction_id)
    }

    async fn get_mempool_entries_by_addresses(
        &self,
        addresses: &[String],
    ) -> Result<Vec<MempoolEntry>, RpcError> {
        self.call("getMempoolEntriesByAddresses", rpc_params![addresses])
            .await
    }

    async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<TransactionRecord>, RpcError> {
        match self
            .call::<TransactionRecord>("getTransaction", rpc_params![id])
            .await
        {
            Ok(record) => Ok(Some(record)),
            Err(RpcError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_block(&self, hash: Hash256) -> Result<Option<RpcBlock>, RpcError> {
        match self.call::<RpcBlock>("getBlock", rpc_params![hash]).await {
            Ok(block) => Ok(Some(block)),
            Err(RpcError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_does_not_connect() {
        let client = NodeClient::new("ws://127.0.0.1:1");
        assert_eq!(client.url(), "ws://127.0.0.1:1");
    }

    #[tokio::test]
    async fn unreachable_node_reports_disconnected() {
        // Port 1 is never a WebSocket server.
        let client = NodeClient::new("ws://127.0.0.1:1");
        let err = client.get_block_dag_info().await.unwrap_err();
        assert!(matches!(err, RpcError::Disconnected(_)));
    }

    #[test]
    fn submit_response_wire_shape() {
        let id = "cd".repeat(32);
        let json = format!("{{\"transactionId\":\"{id}\"}}");
        let resp: SubmitTransactionResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(resp.transaction_id.to_string(), id);
    }
}
