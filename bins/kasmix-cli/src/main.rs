//! kasmix-cli — Command-line client for the Kasmix daemon.
//!
//! Talks to a running `kasmixd` over its JSON-RPC API. Secrets (private
//! keys, mnemonics) are prompted interactively rather than passed on the
//! command line.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde_json::{json, Value};

use kasmix_core::amount::kas_to_sompi;
use kasmix_core::constants::DEFAULT_API_PORT;

/// Kasmix command-line client.
#[derive(Parser)]
#[command(name = "kasmix-cli")]
#[command(version, about = "Client for the Kasmix mixing and CoinJoin daemon")]
struct Cli {
    /// Daemon API URL.
    #[arg(long, global = true, default_value_t = format!("http://127.0.0.1:{DEFAULT_API_PORT}"))]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wallet management.
    Wallet {
        #[command(subcommand)]
        action: WalletAction,
    },
    /// Mixing sessions.
    Mix {
        #[command(subcommand)]
        action: MixAction,
    },
    /// CoinJoin sessions.
    Coinjoin {
        #[command(subcommand)]
        action: CoinjoinAction,
    },
    /// Service settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum WalletAction {
    /// Import a hex private key (prompted securely).
    ImportKey,
    /// Import a BIP-39 mnemonic (prompted securely).
    ImportMnemonic {
        /// Also prompt for a passphrase.
        #[arg(long)]
        with_passphrase: bool,
    },
    /// Show the wallet balance.
    Balance,
    /// Send KAS to an address.
    Send(SendArgs),
    /// Estimate the fee for a send.
    Estimate(SendArgs),
    /// Delete the wallet file.
    Remove,
    /// List address-book contacts.
    AddressBook,
}

#[derive(Args)]
struct SendArgs {
    /// Destination address.
    #[arg(long)]
    to: String,
    /// Amount in KAS (e.g. "1.5").
    #[arg(long)]
    amount: String,
}

#[derive(Subcommand)]
enum MixAction {
    /// Create a mix session. Destinations as address:amount_kas pairs.
    Create {
        /// Destination, repeatable: --dest kaspa:...:1.5
        #[arg(long = "dest", required = true)]
        destinations: Vec<String>,
    },
    /// Show one session.
    Get { id: String },
    /// List all mix sessions.
    List,
    /// Delete a session.
    Delete { id: String },
    /// Reconstruct a session's state from the chain.
    Recover { id: String },
    /// Export a session's deposit and intermediate keys.
    ExportKeys { id: String },
}

#[derive(Subcommand)]
enum CoinjoinAction {
    /// Create a session. UTXOs as txid:index:amount_sompi triples.
    Create {
        #[arg(long)]
        destination: String,
        /// "zero_trust" or "trusted".
        #[arg(long, default_value = "zero_trust")]
        mode: String,
        /// Committed UTXO, repeatable (zero-trust only).
        #[arg(long = "utxo")]
        utxos: Vec<String>,
    },
    /// Show one session.
    Get { id: String },
    /// Reveal committed UTXOs and destination.
    Reveal {
        id: String,
        #[arg(long)]
        destination: String,
        #[arg(long = "utxo", required = true)]
        utxos: Vec<String>,
        /// Source address, repeatable.
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Build a zero-trust transaction for a session set.
    Build {
        /// Participating session ids.
        #[arg(long = "id", required = true)]
        ids: Vec<String>,
    },
    /// Sign your inputs of a built transaction (key prompted securely).
    Sign {
        id: String,
        /// Path to the build output JSON.
        #[arg(long)]
        tx_data: String,
    },
    /// Submit a fully signed transaction.
    Submit {
        /// Path to the build output JSON.
        #[arg(long)]
        tx_data: String,
        /// Path to a JSON object of input index -> signature hex.
        #[arg(long)]
        signatures: String,
    },
    /// Show the aggregated pending signatures for a session.
    Pending { id: String },
    /// Aggregate session counters.
    Stats,
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Show current settings.
    Get,
    /// Switch node mode ("public" or "private").
    SetNodeMode { mode: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = HttpClientBuilder::default()
        .build(&cli.url)
        .with_context(|| format!("cannot reach daemon at {}", cli.url))?;

    let result = match cli.command {
        Commands::Wallet { action } => run_wallet(&client, action).await?,
        Commands::Mix { action } => run_mix(&client, action).await?,
        Commands::Coinjoin { action } => run_coinjoin(&client, action).await?,
        Commands::Settings { action } => run_settings(&client, action).await?,
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_wallet(client: &HttpClient, action: WalletAction) -> Result<Value> {
    match action {
        WalletAction::ImportKey => {
            let key = rpassword::prompt_password("private key (hex): ")?;
            call(client, "wallet.import_key", rpc_params![key.trim()]).await
        }
        WalletAction::ImportMnemonic { with_passphrase } => {
            let phrase = rpassword::prompt_password("mnemonic phrase: ")?;
            let passphrase = if with_passphrase {
                Some(rpassword::prompt_password("passphrase: ")?)
            } else {
                None
            };
            call(
                client,
                "wallet.import_mnemonic",
                rpc_params![phrase.trim(), passphrase],
            )
            .await
        }
        WalletAction::Balance => call(client, "wallet.balance", rpc_params![]).await,
        WalletAction::Send(args) => {
            call(client, "wallet.send", rpc_params![args.to, args.amount]).await
        }
        WalletAction::Estimate(args) => {
            call(client, "wallet.estimate_fee", rpc_params![args.to, args.amount]).await
        }
        WalletAction::Remove => call(client, "wallet.remove", rpc_params![]).await,
        WalletAction::AddressBook => call(client, "wallet.address_book", rpc_params![]).await,
    }
}

async fn run_mix(client: &HttpClient, action: MixAction) -> Result<Value> {
    match action {
        MixAction::Create { destinations } => {
            let mut parsed = Vec::with_capacity(destinations.len());
            let mut total: u64 = 0;
            for spec in &destinations {
                let (address, amount) = parse_destination(spec)?;
                total = total
                    .checked_add(amount)
                    .context("destination total overflow")?;
                parsed.push(json!({ "address": address, "amount": amount.to_string() }));
            }
            call(client, "mix.create", rpc_params![parsed, total.to_string()]).await
        }
        MixAction::Get { id } => call(client, "mix.get", rpc_params![id]).await,
        MixAction::List => call(client, "mix.list", rpc_params![]).await,
        MixAction::Delete { id } => call(client, "mix.delete", rpc_params![id]).await,
        MixAction::Recover { id } => call(client, "mix.recover", rpc_params![id]).await,
        MixAction::ExportKeys { id } => call(client, "mix.export_keys", rpc_params![id]).await,
    }
}

async fn run_coinjoin(client: &HttpClient, action: CoinjoinAction) -> Result<Value> {
    match action {
        CoinjoinAction::Create { destination, mode, utxos } => {
            let utxos = if utxos.is_empty() {
                None
            } else {
                Some(parse_utxos(&utxos)?)
            };
            call(client, "coinjoin.create", rpc_params![destination, mode, utxos]).await
        }
        CoinjoinAction::Get { id } => call(client, "coinjoin.get", rpc_params![id]).await,
        CoinjoinAction::Reveal { id, destination, utxos, sources } => {
            let utxos = parse_utxos(&utxos)?;
            call(
                client,
                "coinjoin.reveal",
                rpc_params![id, utxos, destination, sources],
            )
            .await
        }
        CoinjoinAction::Build { ids } => call(client, "coinjoin.build", rpc_params![ids]).await,
        CoinjoinAction::Sign { id, tx_data } => {
            let data: Value = read_json_file(&tx_data)?;
            let key = rpassword::prompt_password("private key (hex): ")?;
            call(
                client,
                "coinjoin.sign_inputs",
                rpc_params![id, data, key.trim()],
            )
            .await
        }
        CoinjoinAction::Submit { tx_data, signatures } => {
            let data: Value = read_json_file(&tx_data)?;
            let signatures: Value = read_json_file(&signatures)?;
            call(client, "coinjoin.submit", rpc_params![data, signatures]).await
        }
        CoinjoinAction::Pending { id } => call(client, "coinjoin.pending", rpc_params![id]).await,
        CoinjoinAction::Stats => call(client, "coinjoin.stats", rpc_params![]).await,
    }
}

async fn run_settings(client: &HttpClient, action: SettingsAction) -> Result<Value> {
    match action {
        SettingsAction::Get => call(client, "settings.get", rpc_params![]).await,
        SettingsAction::SetNodeMode { mode } => {
            call(client, "settings.set_node_mode", rpc_params![mode]).await
        }
    }
}

async fn call(
    client: &HttpClient,
    method: &str,
    params: jsonrpsee::core::params::ArrayParams,
) -> Result<Value> {
    client
        .request::<Value, _>(method, params)
        .await
        .with_context(|| format!("{method} failed"))
}

/// Parse `address:amount_kas` where the address itself contains a colon
/// (`kaspa:...`); the amount is everything after the LAST colon.
fn parse_destination(spec: &str) -> Result<(String, u64)> {
    let Some((address, amount)) = spec.rsplit_once(':') else {
        bail!("destination must be address:amount_kas, got {spec:?}");
    };
    let sompi = kas_to_sompi(amount)
        .map_err(|e| anyhow::anyhow!("bad amount in {spec:?}: {e}"))?;
    Ok((address.to_string(), sompi))
}

/// Parse `txid:index:amount_sompi` triples into UTXO JSON objects.
fn parse_utxos(specs: &[String]) -> Result<Vec<Value>> {
    specs
        .iter()
        .map(|spec| {
            let parts: Vec<&str> = spec.split(':').collect();
            if parts.len() != 3 {
                bail!("UTXO must be txid:index:amount, got {spec:?}");
            }
            let index: u32 = parts[1].parse().context("bad output index")?;
            let amount: u64 = parts[2].parse().context("bad sompi amount")?;
            Ok(json!({
                "transactionId": parts[0],
                "index": index,
                "amount": amount.to_string(),
            }))
        })
        .collect()
}

fn read_json_file(path: &str) -> Result<Value> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("cannot read {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("{path} is not valid JSON"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_parses_kaspa_prefix() {
        let (address, amount) = parse_destination("kaspa:qq12345:1.5").unwrap();
        assert_eq!(address, "kaspa:qq12345");
        assert_eq!(amount, 150_000_000);
    }

    #[test]
    fn destination_rejects_missing_amount() {
        assert!(parse_destination("kaspaonly").is_err());
        assert!(parse_destination("kaspa:qq:abc").is_err());
    }

    #[test]
    fn utxo_triple_parses() {
        let utxos = parse_utxos(&[format!("{}:1:5000", "ab".repeat(32))]).unwrap();
        assert_eq!(utxos[0]["index"], 1);
        assert_eq!(utxos[0]["amount"], "5000");
    }

    #[test]
    fn utxo_rejects_bad_shapes() {
        assert!(parse_utxos(&["onlytxid".into()]).is_err());
        assert!(parse_utxos(&["tx:notanumber:5".into()]).is_err());
    }
}
