//! Signed mutable pointer records, BEP-44 style.
//!
//! A feed pointer lives in the DHT at `SHA1(pubkey)` and resolves to the
//! infohash of the owner's current feed index. Writers bump `seq` on
//! every store; readers keep the highest verified sequence they have
//! seen.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use crate::bencode::{dict, Value};
use crate::error::{Error, Result};

/// DHT storage address for a pubkey's mutable record.
pub fn target(pubkey: &[u8; 32]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(pubkey);
    hasher.finalize().into()
}

/// Payload of a pointer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerValue {
    /// Infohash of the current feed index object.
    pub info_hash: [u8; 20],
    /// Unix timestamp of the write.
    pub ts: u64,
    /// Optional relay pubkey for the relay-bridge fallback path.
    pub relay_pubkey: Option<[u8; 32]>,
}

impl PointerValue {
    /// Canonical bencoded form stored under `v`.
    pub fn to_bencode(&self) -> Vec<u8> {
        let mut entries = vec![
            ("ih", Value::bytes(self.info_hash.to_vec())),
            ("ts", Value::Int(self.ts as i64)),
        ];
        if let Some(npk) = self.relay_pubkey {
            entries.push(("npk", Value::bytes(npk.to_vec())));
        }
        dict(entries).encode()
    }
}

/// A signed mutable record as persisted in the DHT.
#[derive(Debug, Clone)]
pub struct PointerRecord {
    /// Writer's Ed25519 public key.
    pub key: [u8; 32],
    /// Monotonic sequence number.
    pub seq: u64,
    /// Record payload.
    pub value: PointerValue,
    /// Ed25519 signature over [`signable`].
    pub sig: [u8; 64],
}

/// Bytes covered by the record signature: `3:seqi{seq}e1:v{v_bencoded}`.
pub fn signable(seq: u64, value: &PointerValue) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("3:seqi{seq}e1:v").as_bytes());
    out.extend_from_slice(&value.to_bencode());
    out
}

impl PointerRecord {
    /// Check the record signature against its own key.
    pub fn verify(&self) -> Result<()> {
        let vk = VerifyingKey::from_bytes(&self.key)
            .map_err(|e| Error::core(format!("bad record key: {e}")))?;
        vk.verify(&signable(self.seq, &self.value), &Signature::from_bytes(&self.sig))
            .map_err(|e| Error::core(format!("record signature invalid: {e}")))
    }

    /// Storage address for this record.
    pub fn target(&self) -> [u8; 20] {
        target(&self.key)
    }
}

/// Mutable-record store interface the bridge needs from a DHT node.
#[async_trait]
pub trait Dht: Send + Sync {
    /// Store a signed record. Stale or unverifiable writes are rejected.
    async fn put(&self, record: PointerRecord) -> Result<()>;

    /// Fetch the record stored at `target`, if any.
    async fn get(&self, target: [u8; 20]) -> Result<Option<PointerRecord>>;
}

/// In-process DHT used by the memory swarm and by tests.
///
/// Implements the BEP-44 acceptance rule: a write is kept only when its
/// signature verifies and its `seq` strictly exceeds the stored one.
#[derive(Default)]
pub struct MemoryDht {
    records: Mutex<HashMap<[u8; 20], PointerRecord>>,
}

impl MemoryDht {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Dht for MemoryDht {
    async fn put(&self, record: PointerRecord) -> Result<()> {
        record.verify()?;
        let mut records = self.records.lock();
        let addr = record.target();
        if let Some(existing) = records.get(&addr) {
            if record.seq <= existing.seq {
                return Err(Error::core(format!(
                    "stale write: seq {} <= stored {}",
                    record.seq, existing.seq
                )));
            }
        }
        records.insert(addr, record);
        Ok(())
    }

    async fn get(&self, target: [u8; 20]) -> Result<Option<PointerRecord>> {
        Ok(self.records.lock().get(&target).cloned())
    }
}
