//! Feed index and its DHT pointer lifecycle.
//!
//! The feed index is a bounded, time-descending list of event descriptors
//! seeded into the swarm as `index.json`. The manager keeps the index,
//! the pointer sequence counter, and the identity together so every
//! update reseeds the index and republishes the signed pointer
//! atomically.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::dht::{signable, target, PointerRecord, PointerValue};
use crate::error::{Error, Result};
use crate::event::{Event, Tag};
use crate::identity::{Identity, BRIDGE_KIND, FEED_D_TAG};
use crate::magnet::Magnet;
use crate::now_unix;
use crate::swarm::Swarm;

/// Default cap on feed index entries.
pub const DEFAULT_INDEX_LIMIT: usize = 100;

/// Name under which the index object is seeded.
pub const INDEX_FILENAME: &str = "index.json";

/// One feed entry: enough to locate and order an event without fetching it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: String,
    pub magnet: String,
    pub ts: u64,
    pub kind: u32,
}

/// Bounded, time-descending, id-unique feed index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedIndex {
    pub updated_at: u64,
    pub items: Vec<IndexEntry>,
    #[serde(skip, default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_INDEX_LIMIT
}

impl Default for FeedIndex {
    fn default() -> Self {
        Self::with_limit(DEFAULT_INDEX_LIMIT)
    }
}

impl FeedIndex {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            updated_at: 0,
            items: vec![],
            limit,
        }
    }

    /// Record an event. Duplicate ids are ignored; otherwise the entry is
    /// inserted, the list re-sorted newest-first, and the tail trimmed.
    pub fn add(&mut self, ev: &Event, magnet: &str) {
        if self.items.iter().any(|e| e.id == ev.id) {
            return;
        }
        self.items.insert(
            0,
            IndexEntry {
                id: ev.id.clone(),
                magnet: magnet.to_string(),
                ts: ev.created_at,
                kind: ev.kind,
            },
        );
        self.items.sort_by(|a, b| b.ts.cmp(&a.ts));
        self.items.truncate(self.limit);
        self.updated_at = now_unix();
    }

    /// Serialize to the swarm object form.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse a fetched index. Garbage input yields an empty index rather
    /// than an error so a corrupt object cannot wedge the feed.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<FeedIndex>(bytes) {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!("unparseable feed index, starting empty: {e}");
                FeedIndex::default()
            }
        }
    }
}

/// Decoded feed pointer as read back from the DHT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPointer {
    pub info_hash: [u8; 20],
    pub ts: u64,
    pub seq: u64,
    pub relay_pubkey: Option<[u8; 32]>,
}

/// Feed manager options.
#[derive(Debug, Clone)]
pub struct FeedManagerConfig {
    /// Starting sequence before [`FeedManager::sync_sequence`] runs.
    pub initial_seq: u64,
    /// Feed index entry cap.
    pub index_limit: usize,
    /// Wait between DHT put attempts.
    pub put_retry_interval: Duration,
}

impl Default for FeedManagerConfig {
    fn default() -> Self {
        Self {
            initial_seq: 1,
            index_limit: DEFAULT_INDEX_LIMIT,
            put_retry_interval: Duration::from_secs(2),
        }
    }
}

/// Result of a feed update: the new index magnet, optionally with a
/// relay-signed bridge discovery event.
#[derive(Debug, Clone)]
pub struct FeedUpdate {
    pub magnet: Magnet,
    pub bridge_event: Option<Event>,
}

/// Fetch and decode the pointer record stored at `SHA1(pubkey)`.
pub async fn resolve_feed_pointer(
    dht: &Arc<dyn crate::dht::Dht>,
    pubkey_hex: &str,
) -> Result<Option<FeedPointer>> {
    let bytes = hex::decode(pubkey_hex).map_err(|e| Error::core(format!("bad pubkey hex: {e}")))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::core("pubkey is not 32 bytes"))?;
    let record = dht.get(target(&key)).await?;
    Ok(record.map(|r| FeedPointer {
        info_hash: r.value.info_hash,
        ts: r.value.ts,
        seq: r.seq,
        relay_pubkey: r.value.relay_pubkey,
    }))
}

struct FeedState {
    index: FeedIndex,
    seq: u64,
}

/// Owns the feed index, the pointer sequence, and the signing identity.
pub struct FeedManager {
    identity: Arc<Identity>,
    swarm: Arc<dyn Swarm>,
    relay_pubkey: Option<[u8; 32]>,
    retry_interval: Duration,
    state: Mutex<FeedState>,
}

impl FeedManager {
    pub fn new(
        identity: Arc<Identity>,
        swarm: Arc<dyn Swarm>,
        relay_pubkey: Option<[u8; 32]>,
        config: FeedManagerConfig,
    ) -> Self {
        Self {
            identity,
            swarm,
            relay_pubkey,
            retry_interval: config.put_retry_interval,
            state: Mutex::new(FeedState {
                index: FeedIndex::with_limit(config.index_limit),
                seq: config.initial_seq,
            }),
        }
    }

    /// Hex of the swarm pubkey this manager publishes under.
    pub fn public_key_hex(&self) -> String {
        self.identity.public_key_hex()
    }

    /// Align the local sequence with the DHT: when a remote record exists,
    /// continue from `remote.seq + 1`. Absence or errors leave the
    /// sequence untouched.
    pub async fn sync_sequence(&self) -> u64 {
        let own = self.identity.public_key_hex();
        match self.resolve_feed_pointer(&own).await {
            Ok(Some(pointer)) => {
                let mut state = self.state.lock().await;
                state.seq = pointer.seq + 1;
                state.seq
            }
            Ok(None) => self.state.lock().await.seq,
            Err(e) => {
                tracing::debug!("sequence sync failed, keeping local: {e}");
                self.state.lock().await.seq
            }
        }
    }

    /// Record an event in the index, reseed the index object, and
    /// republish the pointer. With `sign_bridge` set and trackers
    /// configured, also returns a relay-signed bridge discovery event
    /// carrying the index magnet.
    pub async fn update_feed(
        &self,
        ev: &Event,
        magnet: &Magnet,
        sign_bridge: Option<&(dyn Fn(Event) -> Event + Send + Sync)>,
    ) -> Result<FeedUpdate> {
        let mut state = self.state.lock().await;
        state.index.add(ev, &magnet.to_uri());
        let bytes = state.index.to_bytes();
        let index_magnet = self.swarm.seed(bytes, INDEX_FILENAME).await?;
        let info_hash = index_magnet.info_hash_bytes()?;
        self.put_pointer(&mut state, info_hash, 3).await?;
        drop(state);

        let bridge_event = match sign_bridge {
            Some(sign) if !index_magnet.trackers.is_empty() => {
                let draft = Event {
                    id: String::new(),
                    pubkey: self.relay_pubkey.map(hex::encode).unwrap_or_default(),
                    kind: BRIDGE_KIND,
                    created_at: now_unix(),
                    tags: vec![Tag(vec!["d".into(), FEED_D_TAG.into()])],
                    content: index_magnet.to_uri(),
                    sig: String::new(),
                };
                Some(sign(draft))
            }
            _ => None,
        };
        Ok(FeedUpdate {
            magnet: index_magnet,
            bridge_event,
        })
    }

    /// Sign and store the pointer record for `info_hash`, retrying on
    /// transport failure. Returns the publishing pubkey hex.
    pub async fn publish_feed_pointer(&self, info_hash: [u8; 20]) -> Result<String> {
        let mut state = self.state.lock().await;
        self.put_pointer(&mut state, info_hash, 3).await?;
        Ok(self.identity.public_key_hex())
    }

    /// Look up the feed pointer for any pubkey.
    pub async fn resolve_feed_pointer(&self, pubkey_hex: &str) -> Result<Option<FeedPointer>> {
        resolve_feed_pointer(&self.swarm.dht(), pubkey_hex).await
    }

    /// One pointer write per attempt; the sequence advances every attempt
    /// so a half-propagated store never stalls the writer.
    async fn put_pointer(
        &self,
        state: &mut FeedState,
        info_hash: [u8; 20],
        retries: u32,
    ) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..retries {
            let value = PointerValue {
                info_hash,
                ts: now_unix(),
                relay_pubkey: self.relay_pubkey,
            };
            let seq = state.seq;
            state.seq += 1;
            let record = PointerRecord {
                key: self.identity.public_key(),
                seq,
                sig: self.identity.sign(&signable(seq, &value)),
                value,
            };
            match self.swarm.dht().put(record).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, "pointer put failed: {e}");
                    last_err = Some(e);
                    if attempt + 1 < retries {
                        tokio::time::sleep(self.retry_interval).await;
                    }
                }
            }
        }
        Err(Error::core(format!(
            "pointer publish exhausted retries: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::signed_event;
    use crate::swarm::{MemorySwarm, SwarmConfig};

    fn entry_event(id: &str, ts: u64) -> Event {
        Event {
            id: id.into(),
            pubkey: "p".into(),
            kind: 1,
            created_at: ts,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn add_is_idempotent_per_id() {
        let mut index = FeedIndex::default();
        let ev = entry_event("a", 10);
        index.add(&ev, "magnet:?xt=urn:btih:aa");
        let snapshot = index.items.clone();
        index.add(&ev, "magnet:?xt=urn:btih:bb");
        assert_eq!(index.items, snapshot);
    }

    #[test]
    fn add_sorts_newest_first_and_trims() {
        let mut index = FeedIndex::with_limit(2);
        index.add(&entry_event("a", 10), "m-a");
        index.add(&entry_event("b", 30), "m-b");
        index.add(&entry_event("c", 20), "m-c");
        let ids: Vec<_> = index.items.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(index.updated_at > 0);
    }

    #[test]
    fn bytes_round_trip() {
        let mut index = FeedIndex::default();
        index.add(&entry_event("a", 10), "m-a");
        let back = FeedIndex::from_bytes(&index.to_bytes());
        assert_eq!(back.items, index.items);
        assert_eq!(back.updated_at, index.updated_at);
    }

    #[test]
    fn garbage_bytes_yield_empty_index() {
        let index = FeedIndex::from_bytes(b"{]");
        assert!(index.items.is_empty());
        assert_eq!(index.updated_at, 0);
    }

    fn manager(swarm: &Arc<MemorySwarm>) -> FeedManager {
        FeedManager::new(
            Arc::new(Identity::from_relay_secret([7u8; 32])),
            Arc::clone(swarm) as Arc<dyn Swarm>,
            None,
            FeedManagerConfig {
                put_retry_interval: Duration::from_millis(10),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn update_feed_seeds_index_and_publishes_pointer() {
        let swarm = MemorySwarm::new(SwarmConfig::default());
        let mgr = manager(&swarm);
        let ev = signed_event(1, "hello");
        let magnet = Magnet::new("a".repeat(40)).unwrap();
        let update = mgr.update_feed(&ev, &magnet, None).await.unwrap();
        assert!(update.bridge_event.is_none());

        // pointer resolves to the seeded index
        let pointer = mgr
            .resolve_feed_pointer(&mgr.public_key_hex())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pointer.info_hash, update.magnet.info_hash_bytes().unwrap());
        assert_eq!(pointer.seq, 1);

        // and the index object fetches back with the event in it
        let bytes = swarm
            .fetch(&update.magnet, Duration::from_secs(1))
            .await
            .unwrap();
        let index = FeedIndex::from_bytes(&bytes);
        assert_eq!(index.items[0].id, ev.id);
    }

    #[tokio::test]
    async fn sequence_is_strictly_increasing() {
        let swarm = MemorySwarm::new(SwarmConfig::default());
        let mgr = manager(&swarm);
        let magnet = Magnet::new("a".repeat(40)).unwrap();
        mgr.update_feed(&signed_event(1, "one"), &magnet, None)
            .await
            .unwrap();
        let first = mgr
            .resolve_feed_pointer(&mgr.public_key_hex())
            .await
            .unwrap()
            .unwrap();
        mgr.update_feed(&signed_event(1, "two"), &magnet, None)
            .await
            .unwrap();
        let second = mgr
            .resolve_feed_pointer(&mgr.public_key_hex())
            .await
            .unwrap()
            .unwrap();
        assert!(second.seq > first.seq);
    }

    #[tokio::test]
    async fn sync_sequence_continues_from_remote() {
        let swarm = MemorySwarm::new(SwarmConfig::default());
        let mgr = manager(&swarm);
        mgr.publish_feed_pointer([1u8; 20]).await.unwrap();
        mgr.publish_feed_pointer([2u8; 20]).await.unwrap();

        // a fresh manager with the same identity starts over at 1, then syncs
        let fresh = manager(&swarm);
        let seq = fresh.sync_sequence().await;
        assert_eq!(seq, 3);
        fresh.publish_feed_pointer([3u8; 20]).await.unwrap();
    }

    #[tokio::test]
    async fn sync_sequence_tolerates_absence() {
        let swarm = MemorySwarm::new(SwarmConfig::default());
        let mgr = manager(&swarm);
        assert_eq!(mgr.sync_sequence().await, 1);
    }

    #[tokio::test]
    async fn bridge_event_is_signed_when_trackers_configured() {
        let swarm = MemorySwarm::new(SwarmConfig {
            trackers: vec!["udp://t:6969".into()],
            ..Default::default()
        });
        let mgr = FeedManager::new(
            Arc::new(Identity::from_relay_secret([7u8; 32])),
            Arc::clone(&swarm) as Arc<dyn Swarm>,
            Some([9u8; 32]),
            FeedManagerConfig::default(),
        );
        let ev = signed_event(1, "hello");
        let magnet = Magnet::new("a".repeat(40)).unwrap();
        let update = mgr
            .update_feed(
                &ev,
                &magnet,
                Some(&|mut draft: Event| {
                    draft.sig = "f".repeat(128);
                    draft.id = "e".repeat(64);
                    draft
                }),
            )
            .await
            .unwrap();
        let bridge = update.bridge_event.unwrap();
        assert_eq!(bridge.kind, BRIDGE_KIND);
        assert_eq!(bridge.d_tag(), Some(FEED_D_TAG));
        assert_eq!(bridge.content, update.magnet.to_uri());
        assert_eq!(bridge.pubkey, hex::encode([9u8; 32]));
        assert!(!bridge.sig.is_empty());
    }

    #[tokio::test]
    async fn no_bridge_event_without_trackers() {
        let swarm = MemorySwarm::new(SwarmConfig::default());
        let mgr = manager(&swarm);
        let update = mgr
            .update_feed(
                &signed_event(1, "x"),
                &Magnet::new("a".repeat(40)).unwrap(),
                Some(&|draft| draft),
            )
            .await
            .unwrap();
        assert!(update.bridge_event.is_none());
    }
}
