//! Configuration loading from the environment (optionally via `.env`).

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bech32::Hrp;

/// Runtime settings for the relay binary.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Port serving both the relay WebSocket and HTTP endpoints.
    pub port: u16,
    /// Local tracker port announced on seeded magnets, if any.
    pub tracker_port: Option<u16>,
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Enable swarm seeding of accepted events.
    pub enable_bt: bool,
    /// Pubkeys allowed to publish; `None` accepts everyone.
    pub allowed_pubkeys: Option<HashSet<String>>,
    /// Relay info document fields.
    pub relay_name: String,
    pub relay_description: String,
    pub relay_pubkey: Option<String>,
    pub relay_contact: Option<String>,
    /// DHT bootstrap nodes (`host:port`).
    pub dht_bootstrap: Vec<String>,
    /// Explicit DHT bind host.
    pub dht_host: Option<String>,
}

impl Settings {
    /// Load settings, reading `path` as a `.env` file when it exists.
    pub fn from_env(path: &str) -> Result<Self> {
        let _ = dotenvy::from_filename(path);
        let port = env::var("PORT")
            .unwrap_or_else(|_| "7447".into())
            .parse()
            .context("parsing PORT")?;
        let tracker_port = env::var("TRACKER_PORT").ok().and_then(|s| s.parse().ok());
        let db_path = PathBuf::from(env::var("DB_PATH").unwrap_or_else(|_| "bridgr.db".into()));
        let enable_bt = matches!(
            env::var("ENABLE_BT").unwrap_or_default().as_str(),
            "1" | "true"
        );
        let allowed_pubkeys = env::var("ALLOWED_PUBKEYS").ok().and_then(|s| {
            let keys: HashSet<String> = csv_strings(s)
                .into_iter()
                .filter_map(|entry| normalize_pubkey(&entry))
                .collect();
            if keys.is_empty() {
                None
            } else {
                Some(keys)
            }
        });
        let relay_name = env::var("RELAY_NAME").unwrap_or_else(|_| "bridgr".into());
        let relay_description = env::var("RELAY_DESCRIPTION")
            .unwrap_or_else(|_| "Nostr relay with a BitTorrent bridge".into());
        let relay_pubkey = env::var("RELAY_PUBKEY").ok().filter(|s| !s.is_empty());
        let relay_contact = env::var("RELAY_CONTACT").ok().filter(|s| !s.is_empty());
        let dht_bootstrap = csv_strings(env::var("DHT_BOOTSTRAP").unwrap_or_default());
        let dht_host = env::var("DHT_HOST").ok().filter(|s| !s.is_empty());
        Ok(Self {
            port,
            tracker_port,
            db_path,
            enable_bt,
            allowed_pubkeys,
            relay_name,
            relay_description,
            relay_pubkey,
            relay_contact,
            dht_bootstrap,
            dht_host,
        })
    }
}

/// Accept a pubkey as 64-char hex or `npub1…` bech32; normalize to hex.
pub fn normalize_pubkey(entry: &str) -> Option<String> {
    let entry = entry.trim();
    if entry.len() == 64 && entry.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Some(entry.to_lowercase());
    }
    if entry.starts_with("npub1") {
        let (hrp, data) = bech32::decode(entry).ok()?;
        if hrp != Hrp::parse("npub").ok()? || data.len() != 32 {
            return None;
        }
        return Some(hex::encode(data));
    }
    None
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
