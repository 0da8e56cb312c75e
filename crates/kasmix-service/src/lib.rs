//! # kasmix-service — JSON-RPC API and settings for the Kasmix daemon.
//!
//! - [`api`] — jsonrpsee server exposing the mix/wallet/coinjoin/settings
//!   operations under their dotted method names
//! - [`settings`] — durable `settings.json` store

pub mod api;
pub mod settings;

pub use api::{start_api_server, ApiServerImpl};
pub use settings::{NodeMode, Settings, SettingsStore};
