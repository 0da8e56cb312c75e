//! Durable single-record wallet store.
//!
//! One file, `wallet.json`, holding the imported key, its address,
//! mnemonic metadata, a bounded transaction-history ring, and the address
//! book. Writes are atomic (temp file + rename); `remove` deletes the
//! key-bearing file entirely.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use kasmix_core::amount::sompi_string;
use kasmix_core::constants::TX_HISTORY_CAP;
use kasmix_core::crypto::KeyPair;

use crate::error::WalletError;

/// One entry in the wallet's transaction history ring.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxHistoryEntry {
    pub tx_id: String,
    /// "sent" or "received".
    pub direction: String,
    #[serde(with = "sompi_string")]
    pub amount: u64,
    #[serde(with = "sompi_string")]
    pub fee: u64,
    pub address: String,
    pub timestamp: u64,
}

/// One saved address-book contact.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AddressBookEntry {
    pub id: String,
    pub address: String,
    pub label: String,
    pub category: String,
    pub added_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
}

/// The single persisted wallet record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WalletRecord {
    pub address: String,
    pub private_key_hex: String,
    pub imported_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_path: Option<String>,
    #[serde(default)]
    pub transaction_history: Vec<TxHistoryEntry>,
    #[serde(default)]
    pub address_book: Vec<AddressBookEntry>,
}

impl WalletRecord {
    /// Parse the stored private key.
    pub fn keypair(&self) -> Result<KeyPair, WalletError> {
        KeyPair::from_hex(&self.private_key_hex)
            .map_err(|e| WalletError::InvalidKey(e.to_string()))
    }
}

/// Durable store for the single wallet record.
pub struct WalletStore {
    path: PathBuf,
    inner: RwLock<Option<WalletRecord>>,
}

impl WalletStore {
    /// Open the store at `path`, loading any existing file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, WalletError> {
        let path = path.into();
        let record = match fs::read(&path) {
            Ok(bytes) => Some(
                serde_json::from_slice::<WalletRecord>(&bytes)
                    .map_err(|e| WalletError::CorruptedFile(format!("{}: {e}", path.display())))?,
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(WalletError::IoError(e.to_string())),
        };
        debug!(path = %path.display(), imported = record.is_some(), "wallet store opened");
        Ok(Self {
            path,
            inner: RwLock::new(record),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current record, if a wallet has been imported.
    pub fn get(&self) -> Option<WalletRecord> {
        self.inner.read().clone()
    }

    /// The current record, or [`WalletError::NoWallet`].
    pub fn require(&self) -> Result<WalletRecord, WalletError> {
        self.get().ok_or(WalletError::NoWallet)
    }

    /// Replace the record and persist atomically.
    pub fn set(&self, record: WalletRecord) -> Result<(), WalletError> {
        let mut guard = self.inner.write();
        self.persist(&record)?;
        *guard = Some(record);
        Ok(())
    }

    /// Delete the key-bearing file entirely. Returns whether one existed.
    pub fn remove(&self) -> Result<bool, WalletError> {
        let mut guard = self.inner.write();
        let existed = guard.take().is_some();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(existed),
            Err(e) => Err(WalletError::IoError(e.to_string())),
        }
    }

    /// Prepend a history entry, capping the ring at
    /// [`TX_HISTORY_CAP`] newest-first entries.
    pub fn append_tx_history(&self, entry: TxHistoryEntry) -> Result<(), WalletError> {
        let mut guard = self.inner.write();
        let record = guard.as_mut().ok_or(WalletError::NoWallet)?;
        record.transaction_history.insert(0, entry);
        record.transaction_history.truncate(TX_HISTORY_CAP);
        self.persist(record)
    }

    /// Add an address-book contact; returns its generated id.
    pub fn add_address_book_entry(
        &self,
        address: String,
        label: String,
        category: String,
    ) -> Result<String, WalletError> {
        use rand::RngCore;
        let mut id_bytes = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut id_bytes);
        let id = hex::encode(id_bytes);

        let mut guard = self.inner.write();
        let record = guard.as_mut().ok_or(WalletError::NoWallet)?;
        record.address_book.push(AddressBookEntry {
            id: id.clone(),
            address,
            label,
            category,
            added_at: now_millis(),
            updated_at: None,
        });
        self.persist(record)?;
        Ok(id)
    }

    /// Update a contact's label/category. Returns whether it existed.
    pub fn update_address_book_entry(
        &self,
        id: &str,
        label: Option<String>,
        category: Option<String>,
    ) -> Result<bool, WalletError> {
        let mut guard = self.inner.write();
        let record = guard.as_mut().ok_or(WalletError::NoWallet)?;
        let Some(entry) = record.address_book.iter_mut().find(|e| e.id == id) else {
            return Ok(false);
        };
        if let Some(label) = label {
            entry.label = label;
        }
        if let Some(category) = category {
            entry.category = category;
        }
        entry.updated_at = Some(now_millis());
        self.persist(record)?;
        Ok(true)
    }

    /// Remove a contact. Returns whether it existed.
    pub fn remove_address_book_entry(&self, id: &str) -> Result<bool, WalletError> {
        let mut guard = self.inner.write();
        let record = guard.as_mut().ok_or(WalletError::NoWallet)?;
        let before = record.address_book.len();
        record.address_book.retain(|e| e.id != id);
        let removed = record.address_book.len() != before;
        if removed {
            self.persist(record)?;
        }
        Ok(removed)
    }

    fn persist(&self, record: &WalletRecord) -> Result<(), WalletError> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| WalletError::WriteFailed(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json).map_err(|e| WalletError::WriteFailed(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| WalletError::WriteFailed(e.to_string()))?;
        Ok(())
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> WalletRecord {
        let kp = KeyPair::generate();
        WalletRecord {
            address: "kaspa:test".into(),
            private_key_hex: kp.secret_hex(),
            imported_at: now_millis(),
            kpub: None,
            derivation_path: None,
            transaction_history: vec![],
            address_book: vec![],
        }
    }

    fn history_entry(i: usize) -> TxHistoryEntry {
        TxHistoryEntry {
            tx_id: format!("{i:064x}"),
            direction: "sent".into(),
            amount: i as u64,
            fee: 10_000,
            address: "kaspa:dest".into(),
            timestamp: i as u64,
        }
    }

    fn store() -> (WalletStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = WalletStore::open(dir.path().join("wallet.json")).unwrap();
        (store, dir)
    }

    #[test]
    fn open_missing_is_none() {
        let (store, _dir) = store();
        assert!(store.get().is_none());
        assert_eq!(store.require().unwrap_err(), WalletError::NoWallet);
    }

    #[test]
    fn set_get_persist_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        let r = record();

        {
            let store = WalletStore::open(&path).unwrap();
            store.set(r.clone()).unwrap();
            assert_eq!(store.get().unwrap(), r);
        }

        let reopened = WalletStore::open(&path).unwrap();
        assert_eq!(reopened.get().unwrap(), r);
    }

    #[test]
    fn corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            WalletStore::open(&path),
            Err(WalletError::CorruptedFile(_))
        ));
    }

    #[test]
    fn remove_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        let store = WalletStore::open(&path).unwrap();
        store.set(record()).unwrap();
        assert!(path.exists());

        assert!(store.remove().unwrap());
        assert!(!path.exists());
        assert!(store.get().is_none());
    }

    #[test]
    fn keypair_parses_stored_key() {
        let r = record();
        assert!(r.keypair().is_ok());
    }

    #[test]
    fn history_newest_first() {
        let (store, _dir) = store();
        store.set(record()).unwrap();
        store.append_tx_history(history_entry(1)).unwrap();
        store.append_tx_history(history_entry(2)).unwrap();

        let history = store.get().unwrap().transaction_history;
        assert_eq!(history[0].amount, 2);
        assert_eq!(history[1].amount, 1);
    }

    #[test]
    fn history_capped_at_limit() {
        let (store, _dir) = store();
        store.set(record()).unwrap();
        for i in 0..TX_HISTORY_CAP + 5 {
            store.append_tx_history(history_entry(i)).unwrap();
        }
        let history = store.get().unwrap().transaction_history;
        assert_eq!(history.len(), TX_HISTORY_CAP);
        // Newest survives, oldest evicted.
        assert_eq!(history[0].amount, (TX_HISTORY_CAP + 4) as u64);
    }

    #[test]
    fn history_without_wallet_fails() {
        let (store, _dir) = store();
        assert_eq!(
            store.append_tx_history(history_entry(0)).unwrap_err(),
            WalletError::NoWallet
        );
    }

    #[test]
    fn address_book_crud() {
        let (store, _dir) = store();
        store.set(record()).unwrap();

        let id = store
            .add_address_book_entry("kaspa:friend".into(), "Friend".into(), "personal".into())
            .unwrap();

        let book = store.get().unwrap().address_book;
        assert_eq!(book.len(), 1);
        assert_eq!(book[0].label, "Friend");
        assert!(book[0].updated_at.is_none());

        assert!(store
            .update_address_book_entry(&id, Some("Best Friend".into()), None)
            .unwrap());
        let book = store.get().unwrap().address_book;
        assert_eq!(book[0].label, "Best Friend");
        assert_eq!(book[0].category, "personal");
        assert!(book[0].updated_at.is_some());

        assert!(store.remove_address_book_entry(&id).unwrap());
        assert!(store.get().unwrap().address_book.is_empty());
        assert!(!store.remove_address_book_entry(&id).unwrap());
    }

    #[test]
    fn update_unknown_contact_reports_false() {
        let (store, _dir) = store();
        store.set(record()).unwrap();
        assert!(!store.update_address_book_entry("missing", None, None).unwrap());
    }

    #[test]
    fn amounts_persist_as_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        let store = WalletStore::open(&path).unwrap();
        store.set(record()).unwrap();
        let mut entry = history_entry(0);
        entry.amount = u64::MAX;
        store.append_tx_history(entry).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains(&format!("\"{}\"", u64::MAX)));
    }
}
