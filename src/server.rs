//! HTTP surface: health check and the relay information document.

use axum::{http::header, Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Health {
    status: String,
}

/// Health check endpoint.
pub async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

/// Relay capability limits advertised to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayLimitation {
    /// Whether `search` filters are honored.
    pub search_config: bool,
    pub payment_required: bool,
}

impl Default for RelayLimitation {
    fn default() -> Self {
        Self {
            search_config: true,
            payment_required: false,
        }
    }
}

/// Relay information document served on plain HTTP GETs
/// (`Accept: application/nostr+json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayInfo {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub supported_nips: Vec<u16>,
    pub software: String,
    pub version: String,
    pub limitation: RelayLimitation,
}

impl Default for RelayInfo {
    fn default() -> Self {
        Self {
            name: "bridgr".into(),
            description: "Nostr relay with a BitTorrent bridge".into(),
            pubkey: None,
            contact: None,
            supported_nips: vec![1, 9, 11, 50],
            software: "https://github.com/bridgr/bridgr".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            limitation: RelayLimitation::default(),
        }
    }
}

/// Render the info document with permissive CORS, the way browser
/// clients expect it.
pub fn relay_info(info: &RelayInfo) -> impl axum::response::IntoResponse {
    (
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::CONTENT_TYPE, "application/nostr+json"),
        ],
        Json(info.clone()),
    )
}
