//! Magnet URI parsing and construction.

use crate::error::{Error, Result};

/// Parsed magnet link carrying an infohash, an optional display name, and
/// a tracker set with insertion order preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Magnet {
    /// 40-character lowercase hex SHA-1 infohash.
    pub info_hash: String,
    /// Display name (`dn` parameter).
    pub display_name: Option<String>,
    /// Tracker URLs (`tr` parameters), deduplicated.
    pub trackers: Vec<String>,
}

impl Magnet {
    /// Build a magnet for an infohash with no name or trackers.
    pub fn new(info_hash: impl Into<String>) -> Result<Self> {
        let info_hash = info_hash.into().to_lowercase();
        if info_hash.len() != 40 || !info_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::bt(format!("bad infohash: {info_hash}")));
        }
        Ok(Self {
            info_hash,
            display_name: None,
            trackers: vec![],
        })
    }

    /// Parse a `magnet:?xt=urn:btih:…` URI.
    pub fn parse(uri: &str) -> Result<Self> {
        let query = uri
            .strip_prefix("magnet:?")
            .ok_or_else(|| Error::bt(format!("not a magnet uri: {uri}")))?;
        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers: Vec<String> = vec![];
        for pair in query.split('&') {
            let (key, raw) = match pair.split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            let value = urlencoding::decode(raw)
                .map_err(|e| Error::bt(format!("bad percent-encoding: {e}")))?
                .into_owned();
            match key {
                "xt" => {
                    if let Some(ih) = value.strip_prefix("urn:btih:") {
                        info_hash = Some(ih.to_lowercase());
                    }
                }
                "dn" => display_name = Some(value),
                "tr" => {
                    if !trackers.contains(&value) {
                        trackers.push(value);
                    }
                }
                _ => {}
            }
        }
        let info_hash = info_hash.ok_or_else(|| Error::bt("magnet uri without btih"))?;
        let mut magnet = Magnet::new(info_hash)?;
        magnet.display_name = display_name;
        magnet.trackers = trackers;
        Ok(magnet)
    }

    /// Raw 20-byte infohash.
    pub fn info_hash_bytes(&self) -> Result<[u8; 20]> {
        let bytes = hex::decode(&self.info_hash).map_err(|e| Error::bt(format!("bad hex: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| Error::bt("infohash is not 20 bytes"))
    }

    /// Append a tracker, keeping the list a set.
    pub fn add_tracker(&mut self, url: impl Into<String>) {
        let url = url.into();
        if !url.is_empty() && !self.trackers.contains(&url) {
            self.trackers.push(url);
        }
    }

    /// Render the canonical URI form.
    pub fn to_uri(&self) -> String {
        let mut uri = format!("magnet:?xt=urn:btih:{}", self.info_hash);
        if let Some(dn) = &self.display_name {
            uri.push_str("&dn=");
            uri.push_str(&urlencoding::encode(dn));
        }
        for tr in &self.trackers {
            uri.push_str("&tr=");
            uri.push_str(&urlencoding::encode(tr));
        }
        uri
    }
}

impl std::fmt::Display for Magnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_uri())
    }
}
