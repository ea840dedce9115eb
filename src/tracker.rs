//! Relay-independent feed discovery.
//!
//! Given a transport pubkey (and optionally the relay pubkey behind it),
//! find the magnet of the user's current feed index: DHT pointer first,
//! bridge discovery event on the relays as fallback. Results are cached
//! and rewritten to carry the locally configured trackers.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::json;

use crate::dht::Dht;
use crate::feed::{resolve_feed_pointer, INDEX_FILENAME};
use crate::identity::FEED_D_TAG;
use crate::magnet::Magnet;
use crate::relay_client::{RelayClient, ONE_SHOT_TIMEOUT};

/// Default discovery cache capacity.
pub const DEFAULT_CACHE_SIZE: usize = 256;

/// Two-path magnet discovery with an LRU cache.
pub struct FeedTracker {
    dht: Arc<dyn Dht>,
    relay: RelayClient,
    trackers: Vec<String>,
    cache: Mutex<LruCache<String, Magnet>>,
}

impl FeedTracker {
    pub fn new(
        dht: Arc<dyn Dht>,
        relay: RelayClient,
        trackers: Vec<String>,
        cache_size: usize,
    ) -> Self {
        let capacity =
            NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::new(DEFAULT_CACHE_SIZE).unwrap());
        Self {
            dht,
            relay,
            trackers,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Resolve the current feed-index magnet for `transport_pubkey`.
    pub async fn discover(
        &self,
        transport_pubkey: &str,
        relay_pubkey: Option<&str>,
    ) -> Option<Magnet> {
        if let Some(hit) = self.cache.lock().get(transport_pubkey) {
            return Some(hit.clone());
        }

        let mut found = self.from_dht(transport_pubkey).await;
        if found.is_none() {
            if let Some(relay_pk) = relay_pubkey {
                found = self.from_relay(relay_pk).await;
            }
        }

        let mut magnet = found?;
        for tr in &self.trackers {
            magnet.add_tracker(tr.clone());
        }
        self.cache
            .lock()
            .put(transport_pubkey.to_string(), magnet.clone());
        Some(magnet)
    }

    /// Drop a cached entry, forcing rediscovery.
    pub fn invalidate(&self, transport_pubkey: &str) {
        self.cache.lock().pop(transport_pubkey);
    }

    async fn from_dht(&self, transport_pubkey: &str) -> Option<Magnet> {
        match resolve_feed_pointer(&self.dht, transport_pubkey).await {
            Ok(Some(pointer)) => {
                let mut magnet = Magnet::new(hex::encode(pointer.info_hash)).ok()?;
                magnet.display_name = Some(INDEX_FILENAME.to_string());
                Some(magnet)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::debug!("dht discovery failed: {e}");
                None
            }
        }
    }

    async fn from_relay(&self, relay_pubkey: &str) -> Option<Magnet> {
        let filter = json!({
            "authors": [relay_pubkey],
            "kinds": [crate::identity::BRIDGE_KIND],
            "#d": [FEED_D_TAG],
            "limit": 1,
        });
        let found = self
            .relay
            .await_event(filter, ONE_SHOT_TIMEOUT, |ev| {
                ev.content.starts_with("magnet:")
            })
            .await
            .ok()??;
        Magnet::parse(&found.content).ok()
    }
}
