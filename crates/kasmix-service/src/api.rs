//! JSON-RPC server exposing the Kasmix API surface.
//!
//! Uses jsonrpsee to expose the mix, wallet, coinjoin, and settings
//! operations under their dotted method names. Session views returned
//! here never carry private keys; `mix.export_keys` is the single,
//! explicit exception.

use std::collections::BTreeMap;
use std::sync::Arc;

use jsonrpsee::core::async_trait;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};

use kasmix_core::amount::{sompi_string, sompi_string_opt};
use kasmix_core::types::SerializedUtxo;
use kasmix_engine::{Engine, EngineError};
use kasmix_session::{
    CoinJoinSession, CoinJoinTxData, Destination, MixSession, PendingTransaction, SessionId,
    UtxoCommitment,
};
use kasmix_wallet::AddressBookEntry;

use crate::settings::{NodeMode, Settings, SettingsStore};

/// Redacted mix session view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixSessionJson {
    pub id: String,
    pub status: String,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "sompi_string")]
    pub amount: u64,
    pub destinations: Vec<Destination>,
    pub deposit_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_address: Option<String>,
    #[serde(with = "sompi_string_opt", default, skip_serializing_if = "Option::is_none")]
    pub received_amount: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_tx_id: Option<String>,
    pub intermediate_confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_delay_until: Option<u64>,
    pub payout_tx_ids: Vec<String>,
}

impl From<MixSession> for MixSessionJson {
    fn from(s: MixSession) -> Self {
        Self {
            id: s.meta.id.to_string(),
            status: s.status.name().to_string(),
            created_at: s.meta.created_at,
            updated_at: s.meta.updated_at,
            error: s.meta.error,
            amount: s.amount,
            destinations: s.destinations,
            deposit_address: s.deposit_address,
            intermediate_address: s.intermediate_address,
            received_amount: s.received_amount,
            intermediate_tx_id: s.intermediate_tx_id,
            intermediate_confirmed: s.intermediate_confirmed,
            intermediate_delay_until: s.intermediate_delay_until,
            payout_tx_ids: s.payout_tx_ids,
        }
    }
}

/// Exported mix key material (`mix.export_keys` only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixKeysJson {
    pub deposit_address: String,
    pub deposit_private_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_private_key: Option<String>,
}

/// Redacted CoinJoin session view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinJoinSessionJson {
    pub id: String,
    pub status: String,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub zero_trust_mode: bool,
    #[serde(with = "sompi_string")]
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub utxo_commitments: Vec<UtxoCommitment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revealed_utxos: Vec<SerializedUtxo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposit_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coinjoin_tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    pub has_pending_transaction: bool,
}

impl From<CoinJoinSession> for CoinJoinSessionJson {
    fn from(s: CoinJoinSession) -> Self {
        Self {
            id: s.meta.id.to_string(),
            status: s.status.name().to_string(),
            created_at: s.meta.created_at,
            updated_at: s.meta.updated_at,
            error: s.meta.error,
            zero_trust_mode: s.zero_trust_mode,
            amount: s.amount,
            destination_address: s.destination_address,
            destination_hash: s.destination_hash,
            utxo_commitments: s.utxo_commitments,
            revealed_utxos: s.revealed_utxos,
            deposit_address: s.deposit_address,
            entry_tx_id: s.entry_tx_id,
            coinjoin_tx_id: s.coinjoin_tx_id,
            completed_at: s.completed_at,
            has_pending_transaction: s.pending_transaction.is_some(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceJson {
    #[serde(with = "sompi_string")]
    pub confirmed: u64,
    #[serde(with = "sompi_string")]
    pub unconfirmed: u64,
    #[serde(with = "sompi_string")]
    pub total: u64,
    #[serde(with = "sompi_string")]
    pub mature: u64,
    pub utxo_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendJson {
    pub tx_id: String,
    #[serde(with = "sompi_string")]
    pub amount: u64,
    #[serde(with = "sompi_string")]
    pub fee: u64,
    #[serde(with = "sompi_string")]
    pub change: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeEstimateJson {
    #[serde(with = "sompi_string")]
    pub amount: u64,
    #[serde(with = "sompi_string")]
    pub fee: u64,
    #[serde(with = "sompi_string")]
    pub change: u64,
    pub mass: u64,
    pub feerate: u64,
    #[serde(with = "sompi_string")]
    pub total_with_fee: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJson {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpub: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinJoinStatsJson {
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

/// The Kasmix JSON-RPC interface.
#[rpc(server)]
pub trait KasmixApi {
    // --- Mixing ---

    /// Create a mix session; `total` is the requested amount in sompi.
    #[method(name = "mix.create")]
    async fn mix_create(
        &self,
        destinations: Vec<Destination>,
        total: String,
    ) -> Result<MixSessionJson, ErrorObjectOwned>;

    #[method(name = "mix.get")]
    async fn mix_get(&self, id: String) -> Result<MixSessionJson, ErrorObjectOwned>;

    #[method(name = "mix.list")]
    async fn mix_list(&self) -> Result<Vec<MixSessionJson>, ErrorObjectOwned>;

    #[method(name = "mix.delete")]
    async fn mix_delete(&self, id: String) -> Result<bool, ErrorObjectOwned>;

    /// Reconstruct a session's state from on-chain observation.
    #[method(name = "mix.recover")]
    async fn mix_recover(&self, id: String) -> Result<MixSessionJson, ErrorObjectOwned>;

    /// Export a session's key material to the user.
    #[method(name = "mix.export_keys")]
    async fn mix_export_keys(&self, id: String) -> Result<MixKeysJson, ErrorObjectOwned>;

    // --- Wallet ---

    #[method(name = "wallet.import_key")]
    async fn wallet_import_key(&self, private_key_hex: String)
        -> Result<ImportJson, ErrorObjectOwned>;

    #[method(name = "wallet.import_mnemonic")]
    async fn wallet_import_mnemonic(
        &self,
        phrase: String,
        passphrase: Option<String>,
    ) -> Result<ImportJson, ErrorObjectOwned>;

    #[method(name = "wallet.balance")]
    async fn wallet_balance(&self) -> Result<BalanceJson, ErrorObjectOwned>;

    /// Send `amount_kas` (KAS decimal string) to an address.
    #[method(name = "wallet.send")]
    async fn wallet_send(
        &self,
        to: String,
        amount_kas: String,
    ) -> Result<SendJson, ErrorObjectOwned>;

    #[method(name = "wallet.estimate_fee")]
    async fn wallet_estimate_fee(
        &self,
        to: String,
        amount_kas: String,
    ) -> Result<FeeEstimateJson, ErrorObjectOwned>;

    #[method(name = "wallet.remove")]
    async fn wallet_remove(&self) -> Result<bool, ErrorObjectOwned>;

    #[method(name = "wallet.address_book")]
    async fn wallet_address_book(&self) -> Result<Vec<AddressBookEntry>, ErrorObjectOwned>;

    #[method(name = "wallet.address_book_add")]
    async fn wallet_address_book_add(
        &self,
        address: String,
        label: String,
        category: String,
    ) -> Result<String, ErrorObjectOwned>;

    #[method(name = "wallet.address_book_remove")]
    async fn wallet_address_book_remove(&self, id: String) -> Result<bool, ErrorObjectOwned>;

    // --- CoinJoin ---

    /// Create a coinjoin session. `mode` is "zero_trust" (requires
    /// `utxos`) or "trusted".
    #[method(name = "coinjoin.create")]
    async fn coinjoin_create(
        &self,
        destination: String,
        mode: String,
        utxos: Option<Vec<SerializedUtxo>>,
    ) -> Result<CoinJoinSessionJson, ErrorObjectOwned>;

    #[method(name = "coinjoin.get")]
    async fn coinjoin_get(&self, id: String) -> Result<CoinJoinSessionJson, ErrorObjectOwned>;

    #[method(name = "coinjoin.reveal")]
    async fn coinjoin_reveal(
        &self,
        id: String,
        utxos: Vec<SerializedUtxo>,
        destination: String,
        source_addresses: Option<Vec<String>>,
    ) -> Result<CoinJoinSessionJson, ErrorObjectOwned>;

    #[method(name = "coinjoin.build")]
    async fn coinjoin_build(&self, ids: Vec<String>)
        -> Result<CoinJoinTxData, ErrorObjectOwned>;

    #[method(name = "coinjoin.sign_inputs")]
    async fn coinjoin_sign_inputs(
        &self,
        id: String,
        tx_data: CoinJoinTxData,
        private_key_hex: String,
    ) -> Result<BTreeMap<u32, String>, ErrorObjectOwned>;

    #[method(name = "coinjoin.submit")]
    async fn coinjoin_submit(
        &self,
        tx_data: CoinJoinTxData,
        signatures: BTreeMap<u32, String>,
    ) -> Result<String, ErrorObjectOwned>;

    /// The session's aggregated pending signing buffer, if current.
    #[method(name = "coinjoin.pending")]
    async fn coinjoin_pending(
        &self,
        id: String,
    ) -> Result<Option<PendingTransaction>, ErrorObjectOwned>;

    #[method(name = "coinjoin.stats")]
    async fn coinjoin_stats(&self) -> Result<CoinJoinStatsJson, ErrorObjectOwned>;

    // --- Settings ---

    #[method(name = "settings.get")]
    async fn settings_get(&self) -> Result<Settings, ErrorObjectOwned>;

    /// Switch between the public and private node. `mode` is "public" or
    /// "private".
    #[method(name = "settings.set_node_mode")]
    async fn settings_set_node_mode(&self, mode: String) -> Result<Settings, ErrorObjectOwned>;
}

/// Map an engine failure to a JSON-RPC error with its bracket code.
fn engine_error(e: EngineError) -> ErrorObjectOwned {
    let code = match &e {
        EngineError::NotFound => -5,
        EngineError::BadInput(_) => -8,
        EngineError::SessionBusy => -10,
        _ => -1,
    };
    ErrorObjectOwned::owned(code, e.tagged(), Some(e.code().to_string()))
}

fn parse_sompi(value: &str) -> Result<u64, ErrorObjectOwned> {
    value
        .parse::<u64>()
        .map_err(|_| engine_error(EngineError::BadInput(format!("invalid amount: {value:?}"))))
}

/// Implementation of the Kasmix JSON-RPC server.
pub struct ApiServerImpl {
    engine: Arc<Engine>,
    settings: Arc<SettingsStore>,
}

impl ApiServerImpl {
    pub fn new(engine: Arc<Engine>, settings: Arc<SettingsStore>) -> Self {
        Self { engine, settings }
    }
}

#[async_trait]
impl KasmixApiServer for ApiServerImpl {
    async fn mix_create(
        &self,
        destinations: Vec<Destination>,
        total: String,
    ) -> Result<MixSessionJson, ErrorObjectOwned> {
        let total = parse_sompi(&total)?;
        self.engine
            .create_mix_session(destinations, total)
            .map(Into::into)
            .map_err(engine_error)
    }

    async fn mix_get(&self, id: String) -> Result<MixSessionJson, ErrorObjectOwned> {
        self.engine
            .get_mix_session(&SessionId::from_string(id))
            .map(Into::into)
            .map_err(engine_error)
    }

    async fn mix_list(&self) -> Result<Vec<MixSessionJson>, ErrorObjectOwned> {
        Ok(self
            .engine
            .list_mix_sessions()
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn mix_delete(&self, id: String) -> Result<bool, ErrorObjectOwned> {
        self.engine
            .delete_mix_session(&SessionId::from_string(id))
            .map(|_| true)
            .map_err(engine_error)
    }

    async fn mix_recover(&self, id: String) -> Result<MixSessionJson, ErrorObjectOwned> {
        self.engine
            .recover_mix_session(&SessionId::from_string(id))
            .await
            .map(Into::into)
            .map_err(engine_error)
    }

    async fn mix_export_keys(&self, id: String) -> Result<MixKeysJson, ErrorObjectOwned> {
        let keys = self
            .engine
            .export_mix_keys(&SessionId::from_string(id))
            .map_err(engine_error)?;
        Ok(MixKeysJson {
            deposit_address: keys.deposit_address,
            deposit_private_key: keys.deposit_private_key,
            intermediate_address: keys.intermediate_address,
            intermediate_private_key: keys.intermediate_private_key,
        })
    }

    async fn wallet_import_key(
        &self,
        private_key_hex: String,
    ) -> Result<ImportJson, ErrorObjectOwned> {
        let address = self
            .engine
            .wallet()
            .import_key(&private_key_hex)
            .map_err(|e| engine_error(e.into()))?;
        Ok(ImportJson { address, kpub: None })
    }

    async fn wallet_import_mnemonic(
        &self,
        phrase: String,
        passphrase: Option<String>,
    ) -> Result<ImportJson, ErrorObjectOwned> {
        let (address, kpub) = self
            .engine
            .wallet()
            .import_mnemonic(&phrase, passphrase.as_deref())
            .map_err(|e| engine_error(e.into()))?;
        Ok(ImportJson { address, kpub: Some(kpub) })
    }

    async fn wallet_balance(&self) -> Result<BalanceJson, ErrorObjectOwned> {
        let balance = self
            .engine
            .wallet()
            .balance()
            .await
            .map_err(|e| engine_error(e.into()))?;
        Ok(BalanceJson {
            confirmed: balance.confirmed,
            unconfirmed: balance.unconfirmed,
            total: balance.total,
            mature: balance.mature,
            utxo_count: balance.utxo_count,
        })
    }

    async fn wallet_send(
        &self,
        to: String,
        amount_kas: String,
    ) -> Result<SendJson, ErrorObjectOwned> {
        let result = self
            .engine
            .wallet()
            .send(&to, &amount_kas)
            .await
            .map_err(|e| engine_error(e.into()))?;
        Ok(SendJson {
            tx_id: result.tx_id,
            amount: result.amount,
            fee: result.fee,
            change: result.change,
        })
    }

    async fn wallet_estimate_fee(
        &self,
        to: String,
        amount_kas: String,
    ) -> Result<FeeEstimateJson, ErrorObjectOwned> {
        let estimate = self
            .engine
            .wallet()
            .estimate_send(&to, &amount_kas)
            .await
            .map_err(|e| engine_error(e.into()))?;
        Ok(FeeEstimateJson {
            amount: estimate.amount,
            fee: estimate.fee,
            change: estimate.change,
            mass: estimate.mass,
            feerate: estimate.feerate,
            total_with_fee: estimate.total_with_fee,
        })
    }

    async fn wallet_remove(&self) -> Result<bool, ErrorObjectOwned> {
        self.engine
            .wallet()
            .remove()
            .map_err(|e| engine_error(e.into()))
    }

    async fn wallet_address_book(&self) -> Result<Vec<AddressBookEntry>, ErrorObjectOwned> {
        let record = self
            .engine
            .wallet()
            .store()
            .require()
            .map_err(|e| engine_error(e.into()))?;
        Ok(record.address_book)
    }

    async fn wallet_address_book_add(
        &self,
        address: String,
        label: String,
        category: String,
    ) -> Result<String, ErrorObjectOwned> {
        self.engine
            .wallet()
            .store()
            .add_address_book_entry(address, label, category)
            .map_err(|e| engine_error(e.into()))
    }

    async fn wallet_address_book_remove(&self, id: String) -> Result<bool, ErrorObjectOwned> {
        self.engine
            .wallet()
            .store()
            .remove_address_book_entry(&id)
            .map_err(|e| engine_error(e.into()))
    }

    async fn coinjoin_create(
        &self,
        destination: String,
        mode: String,
        utxos: Option<Vec<SerializedUtxo>>,
    ) -> Result<CoinJoinSessionJson, ErrorObjectOwned> {
        let session = match mode.as_str() {
            "zero_trust" => {
                let utxos = utxos.ok_or_else(|| {
                    engine_error(EngineError::BadInput(
                        "zero_trust mode requires utxos".into(),
                    ))
                })?;
                self.engine.create_zero_trust_session(&destination, &utxos)
            }
            "trusted" => self.engine.create_trusted_session(&destination),
            other => Err(EngineError::BadInput(format!(
                "unknown mode {other:?} (expected \"zero_trust\" or \"trusted\")"
            ))),
        }
        .map_err(engine_error)?;
        Ok(session.into())
    }

    async fn coinjoin_get(&self, id: String) -> Result<CoinJoinSessionJson, ErrorObjectOwned> {
        self.engine
            .get_coinjoin_session(&SessionId::from_string(id))
            .map(Into::into)
            .map_err(engine_error)
    }

    async fn coinjoin_reveal(
        &self,
        id: String,
        utxos: Vec<SerializedUtxo>,
        destination: String,
        source_addresses: Option<Vec<String>>,
    ) -> Result<CoinJoinSessionJson, ErrorObjectOwned> {
        self.engine
            .reveal_session(
                &SessionId::from_string(id),
                &utxos,
                &destination,
                &source_addresses.unwrap_or_default(),
            )
            .map(Into::into)
            .map_err(engine_error)
    }

    async fn coinjoin_build(
        &self,
        ids: Vec<String>,
    ) -> Result<CoinJoinTxData, ErrorObjectOwned> {
        let ids: Vec<SessionId> = ids.into_iter().map(SessionId::from_string).collect();
        self.engine.build_zero_trust(&ids).await.map_err(engine_error)
    }

    async fn coinjoin_sign_inputs(
        &self,
        id: String,
        tx_data: CoinJoinTxData,
        private_key_hex: String,
    ) -> Result<BTreeMap<u32, String>, ErrorObjectOwned> {
        self.engine
            .sign_coinjoin_inputs(&SessionId::from_string(id), &tx_data, &private_key_hex)
            .map_err(engine_error)
    }

    async fn coinjoin_submit(
        &self,
        tx_data: CoinJoinTxData,
        signatures: BTreeMap<u32, String>,
    ) -> Result<String, ErrorObjectOwned> {
        self.engine
            .submit_coinjoin(&tx_data, &signatures)
            .await
            .map(|id| id.to_string())
            .map_err(engine_error)
    }

    async fn coinjoin_pending(
        &self,
        id: String,
    ) -> Result<Option<PendingTransaction>, ErrorObjectOwned> {
        self.engine
            .pending_coinjoin_transaction(&SessionId::from_string(id))
            .map_err(engine_error)
    }

    async fn coinjoin_stats(&self) -> Result<CoinJoinStatsJson, ErrorObjectOwned> {
        let stats = self.engine.coinjoin_stats();
        Ok(CoinJoinStatsJson {
            total: stats.total,
            waiting_deposit: stats.waiting_deposit,
            entered: stats.entered,
            committed: stats.committed,
            revealed: stats.revealed,
            completed: stats.completed,
            errored: stats.errored,
            zero_trust: stats.zero_trust,
            trusted: stats.trusted,
        })
    }

    async fn settings_get(&self) -> Result<Settings, ErrorObjectOwned> {
        Ok(self.settings.get())
    }

    async fn settings_set_node_mode(&self, mode: String) -> Result<Settings, ErrorObjectOwned> {
        let mode = match mode.as_str() {
            "public" => NodeMode::Public,
            "private" => NodeMode::Private,
            other => {
                return Err(engine_error(EngineError::BadInput(format!(
                    "unknown node mode {other:?}"
                ))))
            }
        };
        self.settings
            .set_node_mode(mode)
            .map_err(|e| engine_error(EngineError::BadInput(e.to_string())))
    }
}

/// Start the API server on the given address.
///
/// Returns a [`ServerHandle`] that stops the server when dropped or
/// explicitly stopped.
pub async fn start_api_server(
    addr: &str,
    engine: Arc<Engine>,
    settings: Arc<SettingsStore>,
) -> Result<ServerHandle, std::io::Error> {
    let server = Server::builder()
        .build(addr)
        .await
        .map_err(std::io::Error::other)?;
    let api = ApiServerImpl::new(engine, settings);
    Ok(server.start(api.into_rpc()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_view_redacts_keys() {
        let session = MixSession::new(
            100,
            vec![Destination { address: "kaspa:dest".into(), amount: 100 }],
            "kaspa:dep".into(),
            "ab".repeat(32),
        );
        let view: MixSessionJson = session.clone().into();
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains(&session.deposit_private_key));
        assert!(json.contains("waiting_deposit"));
        assert!(json.contains("\"amount\":\"100\""));
    }

    #[test]
    fn coinjoin_view_redacts_deposit_key() {
        let session = CoinJoinSession::new_trusted(
            100_000_000,
            "kaspa:dest".into(),
            "kaspa:dep".into(),
            "cd".repeat(32),
        );
        let view: CoinJoinSessionJson = session.clone().into();
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains(&session.deposit_private_key.unwrap()));
        assert!(json.contains("\"deposit_address\":\"kaspa:dep\""));
    }

    #[test]
    fn engine_error_carries_code() {
        let err = engine_error(EngineError::NotFound);
        assert_eq!(err.code(), -5);
        assert!(err.message().contains("[E_NOT_FOUND]"));

        let err = engine_error(EngineError::BadInput("nope".into()));
        assert_eq!(err.code(), -8);
    }

    #[test]
    fn parse_sompi_rejects_garbage() {
        assert!(parse_sompi("100").is_ok());
        assert!(parse_sompi("1.5").is_err());
        assert!(parse_sompi("-3").is_err());
    }

    #[test]
    fn balance_json_uses_decimal_strings() {
        let b = BalanceJson {
            confirmed: u64::MAX,
            unconfirmed: 0,
            total: u64::MAX,
            mature: 1,
            utxo_count: 2,
        };
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.contains(&format!("\"{}\"", u64::MAX)));
        assert!(json.contains("\"utxo_count\":2"));
    }
}
