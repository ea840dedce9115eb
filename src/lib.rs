//! bridgr: a Nostr relay bridged onto a BitTorrent swarm.
//!
//! Events stay small and signed on relays; heavy payloads and long-term
//! archives live in the swarm, discoverable through signed mutable DHT
//! pointers so a user's latest content is reachable from their key alone.

pub mod bencode;
pub mod config;
pub mod coordinator;
pub mod dht;
pub mod error;
pub mod event;
pub mod feed;
pub mod identity;
pub mod magnet;
pub mod queue;
pub mod relay_client;
pub mod server;
pub mod store;
pub mod swarm;
pub mod tracker;
pub mod wot;
pub mod ws;

pub use coordinator::{CoordinatorConfig, MediaFile, PublishResult, TransportCoordinator};
pub use error::{Error, Result};
pub use event::{Event, Tag};
pub use feed::{FeedIndex, FeedManager, FeedManagerConfig, IndexEntry};
pub use identity::Identity;
pub use magnet::Magnet;
pub use relay_client::RelayClient;
pub use store::{Filter, RelayStore};
pub use swarm::{MemorySwarm, Swarm, SwarmConfig};
pub use wot::WotGraph;

/// Current Unix time in seconds.
pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
