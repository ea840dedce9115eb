//! Top-level orchestration of the relay and swarm transports.
//!
//! The coordinator owns both clients, the optional feed manager and
//! follow graph, and the caches. All publish, discovery, and reseeding
//! flows run through here.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::json;

use crate::error::{Error, Result};
use crate::event::{self, Event};
use crate::feed::{FeedIndex, FeedManager, IndexEntry};
use crate::identity::{BRIDGE_KIND, IDENTITY_D_TAG};
use crate::magnet::Magnet;
use crate::relay_client::{RelayClient, ONE_SHOT_TIMEOUT};
use crate::swarm::Swarm;
use crate::tracker::FeedTracker;
use crate::wot::WotGraph;

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub key_cache_size: usize,
    pub magnet_cache_size: usize,
    pub profile_cache_size: usize,
    /// Profiles older than this are refetched.
    pub profile_ttl: Duration,
    /// Pause between profile batch chunks.
    pub batch_interval: Duration,
    /// Authors per profile batch chunk.
    pub max_batch_size: usize,
    /// Deadline for swarm fetches.
    pub fetch_deadline: Duration,
    /// Trackers unioned into discovered magnets.
    pub trackers: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            key_cache_size: 256,
            magnet_cache_size: 512,
            profile_cache_size: 256,
            profile_ttl: Duration::from_secs(24 * 60 * 60),
            batch_interval: Duration::from_secs(2),
            max_batch_size: 50,
            fetch_deadline: crate::swarm::FETCH_DEADLINE,
            trackers: vec![],
        }
    }
}

/// Outcome of a hybrid publish.
#[derive(Debug, Clone)]
pub struct PublishResult {
    pub magnet: Magnet,
    pub media_magnets: Vec<Magnet>,
    pub relay_status: String,
}

/// A media attachment to seed alongside an event.
#[derive(Debug, Clone)]
pub struct MediaFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

type MagnetCache = Arc<Mutex<LruCache<String, String>>>;

/// Orchestrates relays, the swarm, feeds, and the follow graph.
pub struct TransportCoordinator {
    relay: RelayClient,
    swarm: Arc<dyn Swarm>,
    feed: Option<Arc<FeedManager>>,
    wot: Option<Arc<WotGraph>>,
    tracker: FeedTracker,
    key_cache: Mutex<LruCache<String, String>>,
    magnet_cache: MagnetCache,
    profile_cache: Mutex<LruCache<String, (Event, Instant)>>,
    config: CoordinatorConfig,
}

fn cache_capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::new(1).unwrap())
}

impl TransportCoordinator {
    pub fn new(
        relay: RelayClient,
        swarm: Arc<dyn Swarm>,
        feed: Option<Arc<FeedManager>>,
        wot: Option<Arc<WotGraph>>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        let tracker = FeedTracker::new(
            swarm.dht(),
            relay.clone(),
            config.trackers.clone(),
            config.magnet_cache_size,
        );
        Arc::new(Self {
            relay,
            swarm,
            feed,
            wot,
            tracker,
            key_cache: Mutex::new(LruCache::new(cache_capacity(config.key_cache_size))),
            magnet_cache: Arc::new(Mutex::new(LruCache::new(cache_capacity(
                config.magnet_cache_size,
            )))),
            profile_cache: Mutex::new(LruCache::new(cache_capacity(config.profile_cache_size))),
            config,
        })
    }

    pub fn wot(&self) -> Option<&Arc<WotGraph>> {
        self.wot.as_ref()
    }

    pub fn feed(&self) -> Option<&Arc<FeedManager>> {
        self.feed.as_ref()
    }

    /// Hybrid publish with deferred seeding: the relays must ack the
    /// event before anything touches the swarm. Media files are seeded
    /// in parallel afterwards.
    pub async fn publish(&self, ev: &Event, media: Vec<MediaFile>) -> Result<PublishResult> {
        let relay_status = self.relay.publish(ev).await?;

        let bytes = event::encode(ev)?;
        let magnet = self.swarm.seed(bytes, &event::filename(ev)).await?;
        self.magnet_cache.lock().put(ev.id.clone(), magnet.to_uri());

        let seeds = media
            .into_iter()
            .map(|m| async move { self.swarm.seed(m.bytes, &m.name).await });
        let media_magnets = futures_util::future::join_all(seeds)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        Ok(PublishResult {
            magnet,
            media_magnets,
            relay_status,
        })
    }

    /// Seed an event and fold it into the published feed. Returns the
    /// new feed-index magnet.
    pub async fn publish_p2p(&self, ev: &Event) -> Result<Magnet> {
        let feed = self
            .feed
            .as_ref()
            .ok_or_else(|| Error::core("feed manager not configured"))?;
        let bytes = event::encode(ev)?;
        let magnet = self.swarm.seed(bytes, &event::filename(ev)).await?;
        self.magnet_cache.lock().put(ev.id.clone(), magnet.to_uri());
        let update = feed.update_feed(ev, &magnet, None).await?;
        Ok(update.magnet)
    }

    /// Discover and fetch a user's feed index, returning its entries.
    pub async fn subscribe_p2p(
        &self,
        transport_pubkey: &str,
        relay_pubkey: Option<&str>,
    ) -> Result<Vec<IndexEntry>> {
        let magnet = match self.tracker.discover(transport_pubkey, relay_pubkey).await {
            Some(magnet) => magnet,
            None => return Ok(vec![]),
        };
        let bytes = self.swarm.fetch(&magnet, self.config.fetch_deadline).await?;
        Ok(FeedIndex::from_bytes(&bytes).items)
    }

    /// Make an event retrievable from the swarm again. Returns the magnet
    /// URI, or a `queued:{id}` marker in background mode.
    pub async fn reseed_event(&self, ev: &Event, background: bool) -> Result<String> {
        if let Some(hit) = self.magnet_cache.lock().get(&ev.id) {
            return Ok(hit.clone());
        }
        if let Some(tag) = ev.tag_value("bt") {
            self.magnet_cache.lock().put(ev.id.clone(), tag.to_string());
            return Ok(tag.to_string());
        }
        if background {
            let swarm = Arc::clone(&self.swarm);
            let feed = self.feed.clone();
            let cache = Arc::clone(&self.magnet_cache);
            let ev = ev.clone();
            let id = ev.id.clone();
            let id_for_spawn = id.clone();
            tokio::spawn(async move {
                if let Err(e) = perform_reseed(swarm, feed, cache, ev).await {
                    tracing::warn!(id = %id_for_spawn, "background reseed failed: {e}");
                }
            });
            return Ok(format!("queued:{}", id));
        }
        perform_reseed(
            Arc::clone(&self.swarm),
            self.feed.clone(),
            Arc::clone(&self.magnet_cache),
            ev.clone(),
        )
        .await
    }

    /// Fetch an event's media: the `bt` magnet first, HTTP URL tags as
    /// fallback. Swarm failures are masked until the last path fails.
    pub async fn fetch_media(&self, ev: &Event) -> Result<Vec<u8>> {
        if let Some(uri) = ev.tag_value("bt") {
            match Magnet::parse(uri) {
                Ok(magnet) => {
                    match self.swarm.fetch(&magnet, self.config.fetch_deadline).await {
                        Ok(bytes) => return Ok(bytes),
                        Err(e) => tracing::debug!(id = %ev.id, "bt media fetch failed: {e}"),
                    }
                }
                Err(e) => tracing::debug!(id = %ev.id, "bad bt tag: {e}"),
            }
        }
        for tag in ["url", "image", "video"] {
            if let Some(http_url) = ev.tag_value(tag) {
                match fetch_http(http_url).await {
                    Ok(bytes) => return Ok(bytes),
                    Err(e) => tracing::debug!(id = %ev.id, url = http_url, "http fetch failed: {e}"),
                }
            }
        }
        Err(Error::core("every media path failed"))
    }

    /// Map a relay pubkey to its attested swarm pubkey via the identity
    /// bridge event.
    pub async fn resolve_transport_key(&self, relay_pubkey: &str) -> Result<Option<String>> {
        if let Some(hit) = self.key_cache.lock().get(relay_pubkey) {
            return Ok(Some(hit.clone()));
        }
        let filter = json!({
            "authors": [relay_pubkey],
            "kinds": [BRIDGE_KIND],
            "#d": [IDENTITY_D_TAG],
            "limit": 1,
        });
        let found = self
            .relay
            .await_event(filter, ONE_SHOT_TIMEOUT, |ev| ev.content.len() == 64)
            .await?;
        Ok(match found {
            Some(ev) => {
                self.key_cache
                    .lock()
                    .put(relay_pubkey.to_string(), ev.content.clone());
                Some(ev.content)
            }
            None => None,
        })
    }

    /// Seed the follow graph from a user's contact list at degree 1.
    pub async fn bootstrap_wot(
        &self,
        transport_pubkey: &str,
        relay_pubkey: Option<&str>,
    ) -> Result<()> {
        self.ingest_contact_list(transport_pubkey, relay_pubkey, 1)
            .await
    }

    /// Walk the follow graph breadth-first: for every node at degree `d`,
    /// pull its contact list and admit its follows at `d + 1`.
    pub async fn sync_wot_recursive(&self) -> Result<()> {
        let wot = self
            .wot
            .as_ref()
            .ok_or_else(|| Error::core("follow graph not configured"))?;
        for degree in 1..wot.max_degree() {
            let nodes = wot.pubkeys_at(degree);
            let syncs = nodes.iter().map(|relay_pk| async move {
                match self.resolve_transport_key(relay_pk).await {
                    Ok(Some(transport_pk)) => {
                        if let Err(e) = self
                            .ingest_contact_list(&transport_pk, Some(relay_pk), degree + 1)
                            .await
                        {
                            tracing::debug!(pubkey = %relay_pk, "wot sync failed: {e}");
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(pubkey = %relay_pk, "no transport key attested");
                    }
                    Err(e) => tracing::debug!(pubkey = %relay_pk, "key resolution failed: {e}"),
                }
            });
            futures_util::future::join_all(syncs).await;
        }
        Ok(())
    }

    /// Pull the latest feed entries for everyone in the follow graph,
    /// newest first.
    pub async fn subscribe_follows_p2p(&self) -> Result<Vec<IndexEntry>> {
        let wot = self
            .wot
            .as_ref()
            .ok_or_else(|| Error::core("follow graph not configured"))?;
        let follows = wot.pubkeys();
        let fetches = follows.iter().map(|relay_pk| async move {
            match self.resolve_transport_key(relay_pk).await {
                Ok(Some(transport_pk)) => self
                    .subscribe_p2p(&transport_pk, Some(relay_pk))
                    .await
                    .unwrap_or_default(),
                _ => vec![],
            }
        });
        let mut entries: Vec<IndexEntry> = futures_util::future::join_all(fetches)
            .await
            .into_iter()
            .flatten()
            .collect();
        entries.sort_by(|a, b| b.ts.cmp(&a.ts));
        entries.dedup_by(|a, b| a.id == b.id);
        Ok(entries)
    }

    /// Reseed events from followed authors as they arrive; everyone else
    /// is ignored.
    pub async fn handle_incoming_event(&self, ev: &Event) -> Result<()> {
        let followed = self
            .wot
            .as_ref()
            .map(|w| w.is_following(&ev.pubkey))
            .unwrap_or(false);
        if followed {
            self.reseed_event(ev, true).await?;
        }
        Ok(())
    }

    /// Profile for a pubkey, cached for [`CoordinatorConfig::profile_ttl`].
    pub async fn fetch_profile(&self, pubkey: &str) -> Result<Option<Event>> {
        if let Some((ev, at)) = self.profile_cache.lock().get(pubkey) {
            if at.elapsed() < self.config.profile_ttl {
                return Ok(Some(ev.clone()));
            }
        }
        let filter = json!({"authors": [pubkey], "kinds": [0], "limit": 1});
        let found = self
            .relay
            .await_event(filter, ONE_SHOT_TIMEOUT, |_| true)
            .await?;
        if let Some(ev) = &found {
            self.profile_cache
                .lock()
                .put(pubkey.to_string(), (ev.clone(), Instant::now()));
        }
        Ok(found)
    }

    /// Warm the profile cache for many pubkeys, chunked to keep relay
    /// filters small, pausing a flush window between chunks.
    pub async fn prefetch_profiles(&self, pubkeys: &[String]) -> Result<usize> {
        let mut fetched = 0;
        for (i, chunk) in pubkeys.chunks(self.config.max_batch_size.max(1)).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.batch_interval).await;
            }
            let filter = json!({"authors": chunk, "kinds": [0], "limit": chunk.len()});
            let events = self.relay.fetch_events(filter, ONE_SHOT_TIMEOUT).await?;
            let mut cache = self.profile_cache.lock();
            for ev in events {
                cache.put(ev.pubkey.clone(), (ev, Instant::now()));
                fetched += 1;
            }
        }
        Ok(fetched)
    }

    async fn ingest_contact_list(
        &self,
        transport_pubkey: &str,
        relay_pubkey: Option<&str>,
        degree: u8,
    ) -> Result<()> {
        let wot = self
            .wot
            .as_ref()
            .ok_or_else(|| Error::core("follow graph not configured"))?;
        let entries = self.subscribe_p2p(transport_pubkey, relay_pubkey).await?;
        let contact_entry = match entries.iter().find(|e| e.kind == 3) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let magnet = Magnet::parse(&contact_entry.magnet)?;
        let bytes = self.swarm.fetch(&magnet, self.config.fetch_deadline).await?;
        let contact_list = event::decode(&bytes)?;
        wot.parse_contact_list(&contact_list, degree);
        Ok(())
    }
}

/// The synchronous half of a reseed: seed the event bytes and fold them
/// into the feed, then record the magnet.
async fn perform_reseed(
    swarm: Arc<dyn Swarm>,
    feed: Option<Arc<FeedManager>>,
    cache: MagnetCache,
    ev: Event,
) -> Result<String> {
    let bytes = event::encode(&ev)?;
    let magnet = swarm.seed(bytes, &event::filename(&ev)).await?;
    if let Some(feed) = feed {
        feed.update_feed(&ev, &magnet, None).await?;
    }
    let uri = magnet.to_uri();
    cache.lock().put(ev.id.clone(), uri.clone());
    Ok(uri)
}

async fn fetch_http(url: &str) -> Result<Vec<u8>> {
    let resp = reqwest::get(url)
        .await
        .map_err(|e| Error::core(format!("http request failed: {e}")))?;
    if !resp.status().is_success() {
        return Err(Error::core(format!("http status {}", resp.status())));
    }
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| Error::core(format!("http body failed: {e}")))?;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{signed_event, Tag};
    use crate::feed::FeedManagerConfig;
    use crate::identity::Identity;
    use crate::swarm::{MemorySwarm, SwarmConfig};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            fetch_deadline: Duration::from_millis(50),
            batch_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    async fn accepting_relay() -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    while let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                        let val: Value = serde_json::from_str(&txt).unwrap();
                        if val[0] == "EVENT" {
                            let id = val[1]["id"].clone();
                            let ok = serde_json::json!(["OK", id, true, "stored"]);
                            ws.send(TMsg::Text(ok.to_string())).await.unwrap();
                        }
                    }
                });
            }
        });
        (format!("ws://{addr}"), handle)
    }

    async fn rejecting_relay() -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut ws = accept_async(stream).await.unwrap();
                if let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                    let val: Value = serde_json::from_str(&txt).unwrap();
                    let id = val[1]["id"].clone();
                    let nack = serde_json::json!(["OK", id, false, "blocked: policy"]);
                    ws.send(TMsg::Text(nack.to_string())).await.unwrap();
                }
            }
        });
        (format!("ws://{addr}"), handle)
    }

    #[tokio::test]
    async fn publish_seeds_after_relay_ack() {
        let (url, server) = accepting_relay().await;
        let swarm = MemorySwarm::new(SwarmConfig::default());
        let coordinator = TransportCoordinator::new(
            RelayClient::new(vec![url], None),
            Arc::clone(&swarm) as Arc<dyn Swarm>,
            None,
            None,
            fast_config(),
        );
        let ev = signed_event(1, "hi");
        let result = coordinator
            .publish(
                &ev,
                vec![MediaFile {
                    name: "pic.png".into(),
                    bytes: vec![1, 2, 3],
                }],
            )
            .await
            .unwrap();
        assert_eq!(result.relay_status, "stored");
        assert_eq!(result.media_magnets.len(), 1);
        assert_eq!(
            result.magnet.display_name.as_deref(),
            Some(format!("{}.json", ev.id).as_str())
        );
        // event + one media file
        assert_eq!(swarm.seed_count(), 2);
        server.abort();
    }

    #[tokio::test]
    async fn publish_failure_skips_seeding() {
        let (url, server) = rejecting_relay().await;
        let swarm = MemorySwarm::new(SwarmConfig::default());
        let coordinator = TransportCoordinator::new(
            RelayClient::new(vec![url], None),
            Arc::clone(&swarm) as Arc<dyn Swarm>,
            None,
            None,
            fast_config(),
        );
        let err = coordinator
            .publish(&signed_event(1, "hi"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { kind: "nostr", .. }));
        assert_eq!(swarm.seed_count(), 0);
        server.abort();
    }

    #[tokio::test]
    async fn reseed_cache_short_circuits() {
        let swarm = MemorySwarm::new(SwarmConfig::default());
        let coordinator = TransportCoordinator::new(
            RelayClient::new(vec![], None),
            Arc::clone(&swarm) as Arc<dyn Swarm>,
            None,
            None,
            fast_config(),
        );
        let ev = signed_event(1, "reseed me");
        let first = coordinator.reseed_event(&ev, false).await.unwrap();
        assert_eq!(swarm.seed_count(), 1);
        let second = coordinator.reseed_event(&ev, false).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(swarm.seed_count(), 1);
    }

    #[tokio::test]
    async fn reseed_prefers_bt_tag() {
        let swarm = MemorySwarm::new(SwarmConfig::default());
        let coordinator = TransportCoordinator::new(
            RelayClient::new(vec![], None),
            Arc::clone(&swarm) as Arc<dyn Swarm>,
            None,
            None,
            fast_config(),
        );
        let mut ev = signed_event(1, "tagged");
        let uri = format!("magnet:?xt=urn:btih:{}", "a".repeat(40));
        ev.tags.push(Tag(vec!["bt".into(), uri.clone()]));
        let out = coordinator.reseed_event(&ev, false).await.unwrap();
        assert_eq!(out, uri);
        assert_eq!(swarm.seed_count(), 0);
    }

    #[tokio::test]
    async fn reseed_background_returns_marker() {
        let swarm = MemorySwarm::new(SwarmConfig::default());
        let coordinator = TransportCoordinator::new(
            RelayClient::new(vec![], None),
            Arc::clone(&swarm) as Arc<dyn Swarm>,
            None,
            None,
            fast_config(),
        );
        let ev = signed_event(1, "later");
        let out = coordinator.reseed_event(&ev, true).await.unwrap();
        assert_eq!(out, format!("queued:{}", ev.id));
        // the spawned work lands in the cache shortly after
        tokio::time::sleep(Duration::from_millis(100)).await;
        let cached = coordinator.reseed_event(&ev, true).await.unwrap();
        assert!(cached.starts_with("magnet:"));
        assert_eq!(swarm.seed_count(), 1);
    }

    #[tokio::test]
    async fn publish_p2p_requires_feed_manager() {
        let swarm = MemorySwarm::new(SwarmConfig::default());
        let coordinator = TransportCoordinator::new(
            RelayClient::new(vec![], None),
            Arc::clone(&swarm) as Arc<dyn Swarm>,
            None,
            None,
            fast_config(),
        );
        assert!(coordinator.publish_p2p(&signed_event(1, "x")).await.is_err());
    }

    #[tokio::test]
    async fn publish_p2p_then_subscribe_p2p_round_trips() {
        let swarm = MemorySwarm::new(SwarmConfig::default());
        let identity = Arc::new(Identity::from_relay_secret([8u8; 32]));
        let transport_pk = identity.public_key_hex();
        let feed = Arc::new(FeedManager::new(
            identity,
            Arc::clone(&swarm) as Arc<dyn Swarm>,
            None,
            FeedManagerConfig::default(),
        ));
        let coordinator = TransportCoordinator::new(
            RelayClient::new(vec![], None),
            Arc::clone(&swarm) as Arc<dyn Swarm>,
            Some(feed),
            None,
            fast_config(),
        );
        let ev = signed_event(1, "p2p note");
        coordinator.publish_p2p(&ev).await.unwrap();
        let entries = coordinator.subscribe_p2p(&transport_pk, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, ev.id);
    }

    #[tokio::test]
    async fn subscribe_p2p_unknown_key_is_empty() {
        let swarm = MemorySwarm::new(SwarmConfig::default());
        let coordinator = TransportCoordinator::new(
            RelayClient::new(vec![], None),
            Arc::clone(&swarm) as Arc<dyn Swarm>,
            None,
            None,
            fast_config(),
        );
        let entries = coordinator
            .subscribe_p2p(&"0".repeat(64), None)
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn fetch_media_falls_back_to_http() {
        // HTTP server with the payload; the bt magnet points nowhere.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/v",
            axum::routing::get(|| async { axum::body::Bytes::from_static(b"video-bytes") }),
        );
        let server = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });

        let swarm = MemorySwarm::new(SwarmConfig::default());
        let coordinator = TransportCoordinator::new(
            RelayClient::new(vec![], None),
            Arc::clone(&swarm) as Arc<dyn Swarm>,
            None,
            None,
            fast_config(),
        );
        let mut ev = signed_event(1, "media");
        ev.tags.push(Tag(vec![
            "bt".into(),
            format!("magnet:?xt=urn:btih:{}", "e".repeat(40)),
        ]));
        ev.tags
            .push(Tag(vec!["url".into(), format!("http://{addr}/v")]));
        let bytes = coordinator.fetch_media(&ev).await.unwrap();
        assert_eq!(bytes, b"video-bytes");
        server.abort();
    }

    #[tokio::test]
    async fn fetch_media_errors_when_all_paths_fail() {
        let swarm = MemorySwarm::new(SwarmConfig::default());
        let coordinator = TransportCoordinator::new(
            RelayClient::new(vec![], None),
            Arc::clone(&swarm) as Arc<dyn Swarm>,
            None,
            None,
            fast_config(),
        );
        let mut ev = signed_event(1, "media");
        ev.tags.push(Tag(vec![
            "bt".into(),
            format!("magnet:?xt=urn:btih:{}", "e".repeat(40)),
        ]));
        ev.tags
            .push(Tag(vec!["url".into(), "http://127.0.0.1:1/v".into()]));
        assert!(matches!(
            coordinator.fetch_media(&ev).await,
            Err(Error::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn handle_incoming_ignores_strangers() {
        let swarm = MemorySwarm::new(SwarmConfig::default());
        let wot = Arc::new(WotGraph::default());
        let coordinator = TransportCoordinator::new(
            RelayClient::new(vec![], None),
            Arc::clone(&swarm) as Arc<dyn Swarm>,
            None,
            Some(Arc::clone(&wot)),
            fast_config(),
        );
        let ev = signed_event(1, "from a stranger");
        coordinator.handle_incoming_event(&ev).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(swarm.seed_count(), 0);

        wot.add(ev.pubkey.clone(), 1);
        coordinator.handle_incoming_event(&ev).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(swarm.seed_count(), 1);
    }

    #[tokio::test]
    async fn resolve_transport_key_caches_hits() {
        let attestation_content = "c".repeat(64);
        let relay_pk = "a".repeat(64);
        let attestation = Event {
            id: "a".repeat(64),
            pubkey: relay_pk.clone(),
            kind: BRIDGE_KIND,
            created_at: 1,
            tags: vec![Tag(vec!["d".into(), IDENTITY_D_TAG.into()])],
            content: attestation_content.clone(),
            sig: String::new(),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            // serve exactly one connection: the second resolve must hit the cache
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            if let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                let req: Value = serde_json::from_str(&txt).unwrap();
                assert_eq!(req[2]["#d"][0], IDENTITY_D_TAG);
                let sub = req[1].clone();
                ws.send(TMsg::Text(
                    serde_json::json!(["EVENT", sub, attestation]).to_string(),
                ))
                .await
                .unwrap();
                ws.send(TMsg::Text(serde_json::json!(["EOSE", sub]).to_string()))
                    .await
                    .unwrap();
            }
        });

        let swarm = MemorySwarm::new(SwarmConfig::default());
        let coordinator = TransportCoordinator::new(
            RelayClient::new(vec![format!("ws://{addr}")], None),
            Arc::clone(&swarm) as Arc<dyn Swarm>,
            None,
            None,
            fast_config(),
        );
        let key = coordinator
            .resolve_transport_key(&relay_pk)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, attestation_content);
        let cached = coordinator
            .resolve_transport_key(&relay_pk)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached, attestation_content);
        server.abort();
    }
}
