//! Degree-annotated follow graph.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::event::Event;
use crate::now_unix;

/// Default reach of the follow graph.
pub const DEFAULT_MAX_DEGREE: u8 = 2;

/// Per-pubkey annotation: distance from the root and last sync time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowInfo {
    pub degree: u8,
    pub last_synced: u64,
}

/// Web-of-trust follow set with shortest-path degree semantics.
/// Internally synchronized; callers share it freely across tasks.
pub struct WotGraph {
    max_degree: u8,
    nodes: RwLock<HashMap<String, FollowInfo>>,
}

impl WotGraph {
    pub fn new(max_degree: u8) -> Self {
        Self {
            max_degree,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn max_degree(&self) -> u8 {
        self.max_degree
    }

    /// Insert a pubkey at `degree`, or shorten an existing path. A larger
    /// degree never overwrites a smaller one.
    pub fn add(&self, pubkey: impl Into<String>, degree: u8) {
        let pubkey = pubkey.into();
        if pubkey.is_empty() {
            return;
        }
        let mut nodes = self.nodes.write();
        match nodes.get_mut(&pubkey) {
            Some(info) if info.degree <= degree => {}
            Some(info) => {
                info.degree = degree;
                info.last_synced = now_unix();
            }
            None => {
                nodes.insert(
                    pubkey,
                    FollowInfo {
                        degree,
                        last_synced: now_unix(),
                    },
                );
            }
        }
    }

    /// Feed a kind-3 contact list into the graph at `degree`. Entries past
    /// `max_degree` are ignored.
    pub fn parse_contact_list(&self, ev: &Event, degree: u8) {
        if degree > self.max_degree {
            return;
        }
        for tag in &ev.tags {
            if tag.name() == Some("p") {
                if let Some(pk) = tag.value() {
                    self.add(pk, degree);
                }
            }
        }
    }

    /// Snapshot of the pubkeys at exactly `degree`.
    pub fn pubkeys_at(&self, degree: u8) -> Vec<String> {
        self.nodes
            .read()
            .iter()
            .filter(|(_, info)| info.degree == degree)
            .map(|(pk, _)| pk.clone())
            .collect()
    }

    /// Snapshot of every followed pubkey.
    pub fn pubkeys(&self) -> Vec<String> {
        self.nodes.read().keys().cloned().collect()
    }

    pub fn is_following(&self, pubkey: &str) -> bool {
        self.nodes.read().contains_key(pubkey)
    }

    pub fn get(&self, pubkey: &str) -> Option<FollowInfo> {
        self.nodes.read().get(pubkey).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl Default for WotGraph {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEGREE)
    }
}
