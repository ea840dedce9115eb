//! Nostr event model, canonical hashing, and the JSON codec used for
//! swarm objects.

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name, i.e. the first field.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(|s| s.as_str())
    }

    /// Tag value, i.e. the second field.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(|s| s.as_str())
    }
}

/// Core Nostr event exchanged with relays and seeded into the swarm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `30078`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First value of the named tag, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(|t| t.value())
    }

    /// Value of the `d` tag, used as the replacement key for
    /// parameterized-replaceable kinds.
    pub fn d_tag(&self) -> Option<&str> {
        self.tag_value("d")
    }
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Verify an event's ID and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(Error::InvalidEvent(format!(
            "id mismatch: computed {calc_id}, claimed {}",
            ev.id
        )));
    }
    let sig_bytes =
        hex::decode(&ev.sig).map_err(|e| Error::InvalidEvent(format!("bad sig hex: {e}")))?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|e| Error::InvalidEvent(format!("bad signature: {e}")))?;
    let pk_bytes =
        hex::decode(&ev.pubkey).map_err(|e| Error::InvalidEvent(format!("bad pubkey hex: {e}")))?;
    let pk = XOnlyPublicKey::from_slice(&pk_bytes)
        .map_err(|e| Error::InvalidEvent(format!("bad pubkey: {e}")))?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)
        .map_err(|e| Error::InvalidEvent(format!("bad digest: {e}")))?;
    secp.verify_schnorr(&sig, &msg, &pk)
        .map_err(|e| Error::InvalidEvent(format!("signature verification failed: {e}")))?;
    Ok(())
}

/// Structural checks shared by encode and decode. Partial events (drafts
/// without a pubkey) pass; malformed tags, empty ids, and events that
/// carry both id and pubkey without a signature do not.
fn validate(ev: &Event) -> Result<()> {
    if ev.id.is_empty() {
        return Err(Error::InvalidEvent("empty id".into()));
    }
    for Tag(fields) in &ev.tags {
        if fields.is_empty() || fields[0].is_empty() {
            return Err(Error::InvalidEvent("tag without a name".into()));
        }
    }
    if !ev.pubkey.is_empty() && ev.sig.is_empty() {
        return Err(Error::InvalidEvent("missing sig".into()));
    }
    Ok(())
}

/// Validate and serialize an event to its canonical JSON bytes.
pub fn encode(ev: &Event) -> Result<Vec<u8>> {
    validate(ev)?;
    Ok(serde_json::to_vec(ev)?)
}

/// Parse an event from JSON bytes and validate its structure.
///
/// When the signable fields are all present the Schnorr signature is
/// checked, but a mismatch only logs a warning: an event whose signature
/// was verified at original ingest may be reseeded even if the archived
/// copy no longer verifies bit-for-bit.
pub fn decode(bytes: &[u8]) -> Result<Event> {
    let ev: Event = serde_json::from_slice(bytes)
        .map_err(|e| Error::InvalidEvent(format!("parse failure: {e}")))?;
    validate(&ev)?;
    if !ev.pubkey.is_empty() && !ev.sig.is_empty() && !ev.content.is_empty() && ev.id.len() == 64 {
        if let Err(e) = verify_event(&ev) {
            tracing::warn!(id = %ev.id, "decoded event failed signature check: {e}");
        }
    }
    Ok(ev)
}

/// Display name for the swarm object carrying this event.
pub fn filename(ev: &Event) -> String {
    format!("{}.json", ev.id)
}

#[cfg(test)]
pub(crate) fn signed_event_with(sk: [u8; 32], kind: u32, content: &str, tags: Vec<Tag>) -> Event {
    let secp = Secp256k1::new();
    let kp = secp256k1::Keypair::from_seckey_slice(&secp, &sk).unwrap();
    let pubkey = kp.x_only_public_key().0;
    let mut ev = Event {
        id: String::new(),
        pubkey: hex::encode(pubkey.serialize()),
        kind,
        created_at: 1,
        tags,
        content: content.into(),
        sig: String::new(),
    };
    let hash = event_hash(&ev).unwrap();
    ev.id = hex::encode(hash);
    let msg = Message::from_digest_slice(&hash).unwrap();
    let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
    ev.sig = hex::encode(sig.as_ref());
    ev
}

#[cfg(test)]
pub(crate) fn signed_event(kind: u32, content: &str) -> Event {
    signed_event_with([1u8; 32], kind, content, vec![])
}
