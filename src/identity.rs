//! Swarm-layer signing identity.
//!
//! The DHT authenticates mutable records with Ed25519. A node either
//! samples a fresh keypair or derives one from its relay secret so the
//! same seed phrase controls both network identities.

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::event::{Event, Tag};

/// Identifier events carry this d-tag to bind a relay key to a swarm key.
pub const IDENTITY_D_TAG: &str = "nostr-over-bt-identity";

/// Bridge discovery events carry this d-tag with a feed magnet as content.
pub const FEED_D_TAG: &str = "nostr-over-bt-feed";

/// Kind used for both attestation and bridge discovery records.
pub const BRIDGE_KIND: u32 = 30078;

/// Ed25519 keypair used to sign DHT pointer records.
pub struct Identity {
    signing: SigningKey,
}

impl Identity {
    /// Derive the swarm key deterministically from a 32-byte relay secret.
    ///
    /// The relay secret doubles as the Ed25519 seed, so the swarm identity
    /// is recoverable from the relay identity alone. This is deliberate
    /// cross-algorithm reuse; see DESIGN.md before deploying it anywhere
    /// adversarial.
    pub fn from_relay_secret(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Sample a fresh identity from the OS RNG.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_relay_secret(seed)
    }

    /// Hex of the 32-byte public key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    /// Raw 32-byte public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Hex of the 32-byte secret seed.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    /// Sign arbitrary bytes. Synchronous and side-effect-free: the DHT
    /// layer hands us its canonical record encoding directly.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing.sign(data).to_bytes()
    }

    /// Build the unsigned attestation event binding `relay_pubkey_hex` to
    /// this swarm key. The caller signs it with the relay key.
    pub fn attestation(&self, relay_pubkey_hex: &str) -> Event {
        Event {
            id: String::new(),
            pubkey: relay_pubkey_hex.to_string(),
            kind: BRIDGE_KIND,
            created_at: crate::now_unix(),
            tags: vec![Tag(vec!["d".into(), IDENTITY_D_TAG.into()])],
            content: self.public_key_hex(),
            sig: String::new(),
        }
    }
}
