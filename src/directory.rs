//! Relay directory snapshot service
//!
//! The engine never touches global relay lists directly. It asks a
//! [`RelayDirectory`] for candidates, and the directory keeps the guard set.
//! [`StaticDirectory`] is the in-memory implementation: one mutex for the
//! relay snapshot and one for the guard set, each held only for the
//! duration of a copy or mutation.

use crate::error::{ErrorKind, Result, TorError};
use crate::protocol::relay::{Relay, RelayDescriptor};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Relay lookup consumed by the circuit engine
pub trait RelayDirectory: Send + Sync {
    /// `count` distinct relays forming a fresh path. The first one becomes a
    /// guard: it is never a guard already in use, and it is recorded in the
    /// guard set.
    fn get_suitable_relays(&self, count: usize, exclude: &[[u8; 20]]) -> Result<Vec<Arc<Relay>>>;

    /// `count` distinct relays to append to an existing path; no guard
    /// bookkeeping.
    fn get_extra_relays(&self, count: usize, exclude: &[[u8; 20]]) -> Result<Vec<Arc<Relay>>>;

    /// Least recently used guard, marked as in use
    fn get_guard(&self) -> Result<Arc<Relay>>;

    /// A circuit using this guard has been torn down
    fn release_guard(&self, _identity: &[u8; 20]) {}
}

#[derive(Debug)]
struct GuardEntry {
    relay: Arc<Relay>,
    in_use: usize,
    last_used: u64,
}

/// Guards that have served as a first hop, with use counts
#[derive(Debug, Default)]
pub struct GuardSet {
    entries: Vec<GuardEntry>,
    clock: u64,
}

impl GuardSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a live circuit currently starts at this relay
    pub fn in_use(&self, identity: &[u8; 20]) -> bool {
        self.entries
            .iter()
            .any(|e| &e.relay.identity == identity && e.in_use > 0)
    }

    /// Record `relay` as the first hop of a new circuit
    pub fn record(&mut self, relay: &Arc<Relay>) {
        self.clock += 1;
        let now = self.clock;
        match self.entries.iter_mut().find(|e| e.relay.identity == relay.identity) {
            Some(entry) => {
                entry.in_use += 1;
                entry.last_used = now;
            }
            None => self.entries.push(GuardEntry {
                relay: Arc::clone(relay),
                in_use: 1,
                last_used: now,
            }),
        }
    }

    pub fn release(&mut self, identity: &[u8; 20]) {
        if let Some(entry) = self.entries.iter_mut().find(|e| &e.relay.identity == identity) {
            entry.in_use = entry.in_use.saturating_sub(1);
        }
    }

    /// Pick the guard used longest ago and mark it in use
    pub fn take_least_recently_used(&mut self) -> Option<Arc<Relay>> {
        self.clock += 1;
        let now = self.clock;
        let entry = self.entries.iter_mut().min_by_key(|e| e.last_used)?;
        entry.in_use += 1;
        entry.last_used = now;
        Some(Arc::clone(&entry.relay))
    }
}

/// In-memory directory over a fixed relay snapshot
pub struct StaticDirectory {
    relays: Mutex<Vec<Arc<Relay>>>,
    guards: Mutex<GuardSet>,
}

impl StaticDirectory {
    pub fn new(relays: Vec<Relay>) -> Self {
        Self {
            relays: Mutex::new(relays.into_iter().map(Arc::new).collect()),
            guards: Mutex::new(GuardSet::new()),
        }
    }

    pub fn from_descriptors(descriptors: Vec<RelayDescriptor>) -> Result<Self> {
        let relays = descriptors
            .into_iter()
            .map(Relay::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(relays))
    }

    /// Load a JSON array of [`RelayDescriptor`]s
    pub fn from_json(json: &str) -> Result<Self> {
        let descriptors: Vec<RelayDescriptor> = serde_json::from_str(json)
            .map_err(|e| TorError::ParseError(format!("relay list: {}", e)))?;
        Self::from_descriptors(descriptors)
    }

    /// Replace the snapshot; the guard set is kept
    pub fn update(&self, relays: Vec<Relay>) -> Result<()> {
        let fresh: Vec<Arc<Relay>> = relays.into_iter().map(Arc::new).collect();
        log::info!("📋 Directory snapshot replaced ({} relays)", fresh.len());
        *self.relays.lock()? = fresh;
        Ok(())
    }

    pub fn relay_count(&self) -> Result<usize> {
        Ok(self.relays.lock()?.len())
    }

    pub fn guard_count(&self) -> Result<usize> {
        Ok(self.guards.lock()?.len())
    }

    /// Shuffled suitable relays outside `exclude`
    fn candidates(&self, count: usize, exclude: &[[u8; 20]]) -> Result<Vec<Arc<Relay>>> {
        let excluded: HashSet<&[u8; 20]> = exclude.iter().collect();
        let mut candidates: Vec<Arc<Relay>> = self
            .relays
            .lock()?
            .iter()
            .filter(|r| r.is_suitable() && !excluded.contains(&r.identity))
            .cloned()
            .collect();

        if candidates.len() < count {
            return Err(TorError::NoRelaysAvailable(format!(
                "need {} relays, directory has {} candidates",
                count,
                candidates.len()
            )));
        }
        candidates.shuffle(&mut rand::thread_rng());
        Ok(candidates)
    }
}

impl RelayDirectory for StaticDirectory {
    fn get_suitable_relays(&self, count: usize, exclude: &[[u8; 20]]) -> Result<Vec<Arc<Relay>>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut candidates = self.candidates(count, exclude)?;

        let mut guards = self.guards.lock()?;
        let first = candidates
            .iter()
            .position(|r| !guards.in_use(&r.identity))
            .ok_or_else(|| {
                TorError::NoRelaysAvailable("every candidate is already a guard in use".into())
            })?;
        let guard = candidates.swap_remove(first);
        guards.record(&guard);
        drop(guards);

        let mut path = Vec::with_capacity(count);
        path.push(guard);
        path.extend(candidates.into_iter().take(count - 1));
        Ok(path)
    }

    fn get_extra_relays(&self, count: usize, exclude: &[[u8; 20]]) -> Result<Vec<Arc<Relay>>> {
        let mut candidates = self.candidates(count, exclude)?;
        candidates.truncate(count);
        Ok(candidates)
    }

    fn get_guard(&self) -> Result<Arc<Relay>> {
        self.guards
            .lock()?
            .take_least_recently_used()
            .ok_or_else(|| TorError::NoRelaysAvailable("no guards recorded yet".into()))
    }

    fn release_guard(&self, identity: &[u8; 20]) {
        match self.guards.lock() {
            Ok(mut guards) => guards.release(identity),
            Err(e) => log::warn!("⚠️ Guard set unavailable: {}", e),
        }
    }
}

/// Run a directory-facing lookup, retrying transport failures up to
/// `attempts` times in total.
pub fn with_directory_retry<T>(attempts: u32, mut lookup: impl FnMut() -> Result<T>) -> Result<T> {
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match lookup() {
            Ok(v) => return Ok(v),
            Err(e) if e.kind() == ErrorKind::Transport => {
                log::warn!("⚠️ Directory lookup failed (attempt {}/{}): {}", attempt, attempts, e);
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| TorError::Internal("directory retry without attempts".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::relay::RelayFlags;
    use std::net::Ipv4Addr;

    fn relay(n: u8) -> Relay {
        Relay {
            nickname: format!("relay{}", n),
            identity: [n; 20],
            ntor_onion_key: [n; 32],
            address: Ipv4Addr::new(10, 0, 0, n),
            or_port: 9001,
            dir_port: 0,
            flags: RelayFlags {
                running: true,
                valid: true,
                fast: true,
                ..Default::default()
            },
            ed25519_identity: None,
        }
    }

    fn directory(n: u8) -> StaticDirectory {
        StaticDirectory::new((1..=n).map(relay).collect())
    }

    #[test]
    fn test_distinct_relays() {
        let dir = directory(10);
        let path = dir.get_suitable_relays(3, &[]).unwrap();
        let ids: HashSet<_> = path.iter().map(|r| r.identity).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(dir.guard_count().unwrap(), 1);
    }

    #[test]
    fn test_exclude_honored() {
        let dir = directory(4);
        for _ in 0..20 {
            let path = dir.get_extra_relays(3, &[[2; 20]]).unwrap();
            assert!(path.iter().all(|r| r.identity != [2; 20]));
        }
    }

    #[test]
    fn test_insufficient_relays() {
        let dir = directory(3);
        let err = dir.get_suitable_relays(5, &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(dir.guard_count().unwrap(), 0);
    }

    #[test]
    fn test_guard_in_use_not_reused_as_first_hop() {
        let dir = directory(2);
        let first = dir.get_suitable_relays(1, &[]).unwrap();
        let second = dir.get_suitable_relays(1, &[]).unwrap();
        assert_ne!(first[0].identity, second[0].identity);

        // both relays are now guards in use
        assert!(dir.get_suitable_relays(1, &[]).is_err());

        dir.release_guard(&first[0].identity);
        let third = dir.get_suitable_relays(1, &[]).unwrap();
        assert_eq!(third[0].identity, first[0].identity);
    }

    #[test]
    fn test_get_guard_is_least_recently_used() {
        let dir = directory(5);
        assert!(dir.get_guard().is_err());

        let a = dir.get_suitable_relays(1, &[]).unwrap()[0].identity;
        let b = dir.get_suitable_relays(1, &[]).unwrap()[0].identity;
        assert_eq!(dir.get_guard().unwrap().identity, a);
        assert_eq!(dir.get_guard().unwrap().identity, b);
        assert_eq!(dir.get_guard().unwrap().identity, a);
    }

    #[test]
    fn test_retry_only_transport_errors() {
        let mut calls = 0;
        let result: Result<()> = with_directory_retry(3, || {
            calls += 1;
            Err(TorError::Timeout("fetch".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);

        let mut calls = 0;
        let result: Result<()> = with_directory_retry(3, || {
            calls += 1;
            Err(TorError::NoRelaysAvailable("none".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);

        let mut calls = 0;
        let ok = with_directory_retry(3, || {
            calls += 1;
            if calls < 2 {
                Err(TorError::Network("reset".into()))
            } else {
                Ok(7)
            }
        })
        .unwrap();
        assert_eq!(ok, 7);
    }

    #[test]
    fn test_from_json() {
        let json = r#"[{
            "nickname": "a",
            "fingerprint": "0101010101010101010101010101010101010101",
            "ntor_onion_key": "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE",
            "address": "10.0.0.1",
            "or_port": 9001,
            "flags": "Running Valid"
        }]"#;
        let dir = StaticDirectory::from_json(json).unwrap();
        assert_eq!(dir.relay_count().unwrap(), 1);
    }
}
