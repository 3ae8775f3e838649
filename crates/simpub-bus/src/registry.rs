//! Peer registry: tracks discovered peers and what they offer.
//!
//! Keyed on display name. Reads are lock-free (DashMap) so proxies and the
//! status endpoint can look peers up from any thread while the discovery
//! listener refreshes entries on the loop. Every mutation goes through a
//! single write gate so a rename and a discovery refresh never interleave.
//!
//! Each entry also carries the announcing process's `instance_id`. That is
//! what makes renames safe: a stale announcement still using a retired name
//! is recognised as coming from an instance we already know under its new
//! name, and dropped instead of resurrecting the old entry.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use simpub_core::Announcement;

use crate::error::{BusError, BusResult};

/// A discovered peer, as last announced.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Display name: the registry key.
    pub name: String,
    /// Address to connect the topic and service sockets to.
    pub addr: IpAddr,
    pub topic_port: u16,
    pub service_port: u16,
    pub services: BTreeSet<String>,
    pub topics: BTreeSet<String>,
    /// Identity of the announcing process; stable across renames.
    pub instance_id: u64,
    /// First time this instance was seen under any name.
    pub discovered_at: Instant,
    /// Last announcement. Used for TTL expiry.
    pub last_seen: Instant,
}

impl PeerInfo {
    /// Build from an announcement. An unspecified announced address falls
    /// back to the datagram source.
    pub fn from_announcement(ann: &Announcement, source: IpAddr) -> Self {
        let now = Instant::now();
        Self {
            name: ann.name.clone(),
            addr: if ann.addr.is_unspecified() { source } else { ann.addr },
            topic_port: ann.topic_port,
            service_port: ann.service_port,
            services: ann.services.iter().cloned().collect(),
            topics: ann.topics.iter().cloned().collect(),
            instance_id: ann.instance_id,
            discovered_at: now,
            last_seen: now,
        }
    }

    fn refresh_from(&mut self, ann: &Announcement, source: IpAddr) {
        self.addr = if ann.addr.is_unspecified() { source } else { ann.addr };
        self.topic_port = ann.topic_port;
        self.service_port = ann.service_port;
        self.services = ann.services.iter().cloned().collect();
        self.topics = ann.topics.iter().cloned().collect();
        self.last_seen = Instant::now();
    }

    /// Does this peer answer `service`?
    pub fn has_service(&self, service: &str) -> bool {
        self.services.contains(service)
    }

    pub fn publishes(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    pub fn topic_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.topic_port)
    }

    pub fn service_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.service_port)
    }
}

/// What an announcement did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    /// First time this name was seen.
    Inserted,
    /// Known instance re-announced under the same name.
    Refreshed,
    /// A different instance took over the name (typically a restart).
    Replaced { previous_instance: u64 },
    /// Known instance now announces a new name.
    Renamed { from: String },
    /// Stale announcement under a name this instance has given up.
    IgnoredRetired,
}

#[derive(Debug, Clone, Copy)]
struct Retired {
    instance_id: u64,
    until: Instant,
}

/// Shared, cloneable peer registry.
#[derive(Clone)]
pub struct PeerRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    peers: DashMap<String, PeerInfo>,
    retired: DashMap<String, Retired>,
    retire_for: Duration,
    write_gate: Mutex<()>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl PeerRegistry {
    /// `retire_for` is how long a renamed-away name keeps ignoring stale
    /// announcements. Use the peer TTL.
    pub fn new(retire_for: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                peers: DashMap::new(),
                retired: DashMap::new(),
                retire_for,
                write_gate: Mutex::new(()),
            }),
        }
    }

    /// Look a peer up by display name. `None` just means not discovered yet.
    pub fn get(&self, name: &str) -> Option<PeerInfo> {
        self.inner.peers.get(name).map(|e| e.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.peers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.peers.is_empty()
    }

    /// Sorted display names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.peers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Copy of every entry, sorted by name.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.inner.peers.iter().map(|e| e.value().clone()).collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    /// Apply a received announcement.
    pub fn upsert(&self, ann: &Announcement, source: IpAddr) -> Upsert {
        let _gate = self.lock_gate();
        let now = Instant::now();

        if let Some(retired) = self.inner.retired.get(&ann.name) {
            if retired.instance_id == ann.instance_id && now < retired.until {
                return Upsert::IgnoredRetired;
            }
        }

        if let Some(mut entry) = self.inner.peers.get_mut(&ann.name) {
            if entry.instance_id == ann.instance_id {
                entry.refresh_from(ann, source);
                return Upsert::Refreshed;
            }
            let previous_instance = entry.instance_id;
            *entry = PeerInfo::from_announcement(ann, source);
            return Upsert::Replaced { previous_instance };
        }

        // Same instance under another name: the peer renamed itself.
        let old_name = self
            .inner
            .peers
            .iter()
            .find(|e| e.value().instance_id == ann.instance_id)
            .map(|e| e.key().clone());

        if let Some(old_name) = old_name {
            if let Some((_, mut info)) = self.inner.peers.remove(&old_name) {
                info.name = ann.name.clone();
                info.refresh_from(ann, source);
                self.inner.peers.insert(ann.name.clone(), info);
                self.retire(&old_name, ann.instance_id, now);
                return Upsert::Renamed { from: old_name };
            }
        }

        self.inner
            .peers
            .insert(ann.name.clone(), PeerInfo::from_announcement(ann, source));
        Upsert::Inserted
    }

    /// Move the entry under `old` to `new`, atomically with respect to
    /// discovery refreshes. The old name is retired so in-flight
    /// announcements still carrying it are ignored.
    pub fn rename(&self, old: &str, new: &str) -> BusResult<()> {
        if old == new {
            return Ok(());
        }
        let _gate = self.lock_gate();

        if self.inner.peers.contains_key(new) {
            return Err(BusError::NameTaken(new.to_string()));
        }
        let (_, mut info) = self
            .inner
            .peers
            .remove(old)
            .ok_or_else(|| BusError::UnknownPeer(old.to_string()))?;

        let instance_id = info.instance_id;
        info.name = new.to_string();
        self.inner.peers.insert(new.to_string(), info);
        self.inner.retired.remove(new);
        self.retire(old, instance_id, Instant::now());
        Ok(())
    }

    /// Remove a peer outright.
    pub fn remove(&self, name: &str) -> Option<PeerInfo> {
        let _gate = self.lock_gate();
        self.inner.peers.remove(name).map(|(_, info)| info)
    }

    /// Evict peers not refreshed within `ttl` and forget expired retirements.
    /// Returns the number of peers evicted.
    pub fn expire(&self, ttl: Duration) -> usize {
        let _gate = self.lock_gate();
        let now = Instant::now();

        let before = self.inner.peers.len();
        self.inner
            .peers
            .retain(|_, info| now.duration_since(info.last_seen) < ttl);
        self.inner.retired.retain(|_, r| now < r.until);
        before - self.inner.peers.len()
    }

    fn retire(&self, name: &str, instance_id: u64, now: Instant) {
        self.inner.retired.insert(
            name.to_string(),
            Retired {
                instance_id,
                until: now + self.inner.retire_for,
            },
        );
    }

    fn lock_gate(&self) -> std::sync::MutexGuard<'_, ()> {
        self.inner
            .write_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
