//! Which peer each MAC address lives behind.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use skein_core::ethernet::{format_mac, Mac};
use skein_core::name::PeerName;

#[derive(Debug, Clone, Copy)]
struct MacEntry {
    peer: PeerName,
    last_seen: Instant,
}

pub struct MacCache {
    entries: DashMap<Mac, MacEntry>,
    max_age: Duration,
}

impl MacCache {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_age,
        }
    }

    /// Record that `mac` was seen behind `peer`. Returns true if the MAC
    /// was new or moved to a different peer.
    pub fn enter(&self, mac: Mac, peer: PeerName) -> bool {
        let now = Instant::now();
        match self.entries.insert(mac, MacEntry { peer, last_seen: now }) {
            Some(old) => old.peer != peer,
            None => true,
        }
    }

    pub fn lookup(&self, mac: &Mac) -> Option<PeerName> {
        self.entries.get(mac).map(|e| e.peer)
    }

    /// Drop entries not seen within the max age as of `now`.
    pub fn expire(&self, now: Instant) -> Vec<(Mac, PeerName)> {
        let mut expired = Vec::new();
        self.entries.retain(|mac, entry| {
            let keep = now.saturating_duration_since(entry.last_seen) <= self.max_age;
            if !keep {
                expired.push((*mac, entry.peer));
            }
            keep
        });
        expired
    }

    /// Forget every MAC behind one of `peers`.
    pub fn delete_peers(&self, peers: &[PeerName]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !peers.contains(&entry.peer));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn status(&self) -> String {
        let mut rows: Vec<(Mac, MacEntry)> =
            self.entries.iter().map(|e| (*e.key(), *e.value())).collect();
        rows.sort_by_key(|(mac, _)| *mac);
        let mut out = String::new();
        for (mac, entry) in rows {
            let _ = writeln!(
                out,
                "{} -> {} ({:?} ago)",
                format_mac(&mac),
                entry.peer,
                entry.last_seen.elapsed()
            );
        }
        out
    }
}
