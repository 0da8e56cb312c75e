//! Key generation and import.
//!
//! Supports raw hex private keys and BIP-39 mnemonic phrases. Mnemonic
//! import derives an Ed25519 secret with BLAKE3 keyed derivation over the
//! BIP-39 seed, which is simpler than BIP-32 (incompatible with Ed25519)
//! while keeping recovery deterministic from phrase + passphrase.

use bip39::{Language, Mnemonic};
use zeroize::Zeroizing;

use kasmix_core::address::{Address, Network};
use kasmix_core::crypto::KeyPair;

use crate::error::WalletError;

/// BLAKE3 KDF context for mnemonic-derived keys.
const KDF_CONTEXT: &str = "kasmix-wallet-key-derivation-v1";

/// Recorded derivation path for mnemonic imports.
pub const MNEMONIC_DERIVATION_PATH: &str = "m/44'/111111'/0'/0/0";

/// The outcome of a key import: keypair, address, and mnemonic metadata.
#[derive(Debug)]
pub struct ImportedKey {
    pub keypair: KeyPair,
    pub address: Address,
    /// Extended-public-key style identifier, present for mnemonic imports.
    pub kpub: Option<String>,
    pub derivation_path: Option<String>,
}

/// Generate a fresh single-use keypair and its address.
pub fn generate_keypair(network: Network) -> (KeyPair, Address) {
    let keypair = KeyPair::generate();
    let address = Address::from_public_key(&keypair.public_key(), network);
    (keypair, address)
}

/// Import a raw 32-byte hex private key.
pub fn import_private_key(hex_key: &str, network: Network) -> Result<ImportedKey, WalletError> {
    let keypair = KeyPair::from_hex(hex_key).map_err(|e| WalletError::InvalidKey(e.to_string()))?;
    let address = Address::from_public_key(&keypair.public_key(), network);
    Ok(ImportedKey {
        keypair,
        address,
        kpub: None,
        derivation_path: None,
    })
}

/// Import a BIP-39 mnemonic phrase with an optional passphrase.
///
/// Normalizes whitespace and case before parsing, derives the account key
/// at [`MNEMONIC_DERIVATION_PATH`], and reports the public identifier as
/// `kpub`.
pub fn import_mnemonic(
    phrase: &str,
    passphrase: Option<&str>,
    network: Network,
) -> Result<ImportedKey, WalletError> {
    let normalized = phrase
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mnemonic = Mnemonic::parse_in(Language::English, &normalized)
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;

    let seed = Zeroizing::new(mnemonic.to_seed(passphrase.unwrap_or("")));

    let context = format!("{KDF_CONTEXT}/{MNEMONIC_DERIVATION_PATH}");
    let secret = blake3::derive_key(&context, seed.as_ref());
    let keypair = KeyPair::from_secret_bytes(secret);
    let address = Address::from_public_key(&keypair.public_key(), network);
    let kpub = format!("kpub{}", hex::encode(keypair.public_key().to_bytes()));

    Ok(ImportedKey {
        keypair,
        address,
        kpub: Some(kpub),
        derivation_path: Some(MNEMONIC_DERIVATION_PATH.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PHRASE: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn generate_is_unique() {
        let (_, a1) = generate_keypair(Network::Mainnet);
        let (_, a2) = generate_keypair(Network::Mainnet);
        assert_ne!(a1, a2);
    }

    #[test]
    fn generated_address_matches_key() {
        let (kp, addr) = generate_keypair(Network::Mainnet);
        assert_eq!(addr.payload(), kp.public_key().to_bytes());
    }

    #[test]
    fn import_hex_roundtrip() {
        let (kp, addr) = generate_keypair(Network::Mainnet);
        let imported = import_private_key(&kp.secret_hex(), Network::Mainnet).unwrap();
        assert_eq!(imported.address, addr);
        assert!(imported.kpub.is_none());
        assert!(imported.derivation_path.is_none());
    }

    #[test]
    fn import_bad_hex_fails() {
        assert!(matches!(
            import_private_key("nothex", Network::Mainnet).unwrap_err(),
            WalletError::InvalidKey(_)
        ));
        assert!(matches!(
            import_private_key("abcd", Network::Mainnet).unwrap_err(),
            WalletError::InvalidKey(_)
        ));
    }

    #[test]
    fn mnemonic_import_is_deterministic() {
        let a = import_mnemonic(TEST_PHRASE, None, Network::Mainnet).unwrap();
        let b = import_mnemonic(TEST_PHRASE, None, Network::Mainnet).unwrap();
        assert_eq!(a.address, b.address);
        assert_eq!(a.kpub, b.kpub);
    }

    #[test]
    fn mnemonic_passphrase_changes_keys() {
        let plain = import_mnemonic(TEST_PHRASE, None, Network::Mainnet).unwrap();
        let secret = import_mnemonic(TEST_PHRASE, Some("hunter2"), Network::Mainnet).unwrap();
        assert_ne!(plain.address, secret.address);
    }

    #[test]
    fn mnemonic_metadata_populated() {
        let imported = import_mnemonic(TEST_PHRASE, None, Network::Mainnet).unwrap();
        assert!(imported.kpub.as_deref().unwrap().starts_with("kpub"));
        assert_eq!(
            imported.derivation_path.as_deref(),
            Some(MNEMONIC_DERIVATION_PATH)
        );
    }

    #[test]
    fn mnemonic_whitespace_normalized() {
        let messy = TEST_PHRASE.split_whitespace().collect::<Vec<_>>().join("   ");
        let a = import_mnemonic(&messy, None, Network::Mainnet).unwrap();
        let b = import_mnemonic(TEST_PHRASE, None, Network::Mainnet).unwrap();
        assert_eq!(a.address, b.address);
    }

    #[test]
    fn invalid_mnemonic_rejected() {
        assert!(matches!(
            import_mnemonic("abandon notaword", None, Network::Mainnet).unwrap_err(),
            WalletError::InvalidMnemonic(_)
        ));
    }

    #[test]
    fn bad_checksum_rejected() {
        let mut words = vec!["abandon"; 11];
        words.push("zoo");
        assert!(import_mnemonic(&words.join(" "), None, Network::Mainnet).is_err());
    }
}
