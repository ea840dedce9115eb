//! Swarm seeding and fetching.
//!
//! The bridge only needs four things from a BitTorrent stack: seed bytes
//! under a name, fetch bytes for a magnet, reach the DHT, and announce
//! trackers. [`Swarm`] is that seam; [`MemorySwarm`] is an in-process
//! implementation whose handles share one content map, so several
//! handles model peers of a single swarm.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use crate::bencode::{dict, Value};
use crate::dht::{Dht, MemoryDht};
use crate::error::{Error, Result};
use crate::magnet::Magnet;

/// Default deadline for fetching a magnet.
pub const FETCH_DEADLINE: Duration = Duration::from_secs(5);

/// Default deadline for DHT bootstrap.
pub const DHT_BOOTSTRAP_DEADLINE: Duration = Duration::from_secs(10);

/// Piece size used when deriving infohashes for seeded buffers.
const PIECE_LENGTH: usize = 16 * 1024;

/// Swarm construction options.
#[derive(Debug, Clone, Default)]
pub struct SwarmConfig {
    /// Trackers announced on every seeded object.
    pub trackers: Vec<String>,
    /// DHT bootstrap nodes (`host:port`).
    pub dht_bootstrap: Vec<String>,
    /// Explicit DHT bind host.
    pub dht_host: Option<String>,
}

/// Capabilities the bridge needs from the swarm transport.
#[async_trait]
pub trait Swarm: Send + Sync {
    /// Seed `buffer` under `filename` and return its magnet. Seeding the
    /// same bytes under the same name must yield the same magnet.
    async fn seed(&self, buffer: Vec<u8>, filename: &str) -> Result<Magnet>;

    /// Join the swarm for `magnet` and download the first file.
    async fn fetch(&self, magnet: &Magnet, deadline: Duration) -> Result<Vec<u8>>;

    /// Handle to the DHT this swarm participates in.
    fn dht(&self) -> Arc<dyn Dht>;

    /// Resolve once the DHT has at least one known node.
    async fn wait_for_dht(&self, deadline: Duration) -> Result<()>;

    /// Remember `url` for subsequent seeds and attach it to current ones.
    fn announce_tracker(&self, url: &str);

    /// Trackers currently announced on seeds.
    fn trackers(&self) -> Vec<String>;
}

/// Infohash of a single-file torrent: SHA-1 over the bencoded info
/// dictionary `{length, name, piece length, pieces}`.
pub fn info_hash_for(buffer: &[u8], filename: &str) -> [u8; 20] {
    let mut pieces = Vec::new();
    let mut chunks = buffer.chunks(PIECE_LENGTH);
    if buffer.is_empty() {
        pieces.extend_from_slice(&Sha1::digest([]));
    }
    for chunk in &mut chunks {
        pieces.extend_from_slice(&Sha1::digest(chunk));
    }
    let info = dict([
        ("length", Value::Int(buffer.len() as i64)),
        ("name", Value::bytes(filename.as_bytes().to_vec())),
        ("piece length", Value::Int(PIECE_LENGTH as i64)),
        ("pieces", Value::Bytes(pieces)),
    ]);
    Sha1::digest(info.encode()).into()
}

/// In-process swarm sharing one content map across all its handles.
pub struct MemorySwarm {
    content: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    trackers: Mutex<Vec<String>>,
    dht: Arc<MemoryDht>,
    seeds: AtomicUsize,
}

impl MemorySwarm {
    pub fn new(config: SwarmConfig) -> Arc<Self> {
        Arc::new(Self {
            content: Arc::new(Mutex::new(HashMap::new())),
            trackers: Mutex::new(config.trackers),
            dht: MemoryDht::new(),
            seeds: AtomicUsize::new(0),
        })
    }

    /// A second handle on the same swarm: shared content and DHT, its own
    /// tracker list.
    pub fn peer(&self) -> Arc<Self> {
        Arc::new(Self {
            content: Arc::clone(&self.content),
            trackers: Mutex::new(vec![]),
            dht: Arc::clone(&self.dht),
            seeds: AtomicUsize::new(0),
        })
    }

    /// Number of seed calls on this handle. Test hook for the
    /// deferred-seeding guarantee.
    pub fn seed_count(&self) -> usize {
        self.seeds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Swarm for MemorySwarm {
    async fn seed(&self, buffer: Vec<u8>, filename: &str) -> Result<Magnet> {
        self.seeds.fetch_add(1, Ordering::SeqCst);
        let info_hash = hex::encode(info_hash_for(&buffer, filename));
        self.content.lock().insert(info_hash.clone(), buffer);
        let mut magnet = Magnet::new(info_hash)?;
        magnet.display_name = Some(filename.to_string());
        for tr in self.trackers.lock().iter() {
            magnet.add_tracker(tr.clone());
        }
        Ok(magnet)
    }

    async fn fetch(&self, magnet: &Magnet, deadline: Duration) -> Result<Vec<u8>> {
        let started = tokio::time::Instant::now();
        loop {
            if let Some(bytes) = self.content.lock().get(&magnet.info_hash) {
                return Ok(bytes.clone());
            }
            if started.elapsed() >= deadline {
                return Err(Error::Timeout { deadline });
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn dht(&self) -> Arc<dyn Dht> {
        Arc::clone(&self.dht) as Arc<dyn Dht>
    }

    async fn wait_for_dht(&self, _deadline: Duration) -> Result<()> {
        Ok(())
    }

    fn announce_tracker(&self, url: &str) {
        let mut trackers = self.trackers.lock();
        if !url.is_empty() && !trackers.iter().any(|t| t == url) {
            trackers.push(url.to_string());
        }
    }

    fn trackers(&self) -> Vec<String> {
        self.trackers.lock().clone()
    }
}
