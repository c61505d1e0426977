//! Player Registry
//!
//! Concurrent map of every known peer plus the recently-disconnected set.
//!
//! All mutation goes through atomic per-key operations on a sharded map, so a
//! session loop and the timeout sweep can touch the same entry concurrently
//! without a registry-wide lock. [`PlayerRegistry::apply`] is the single
//! place where the newer-timestamp-wins rule is enforced.
//!
//! Tie-break: an update whose `last_update_timestamp` equals the stored one
//! is rejected as stale, so for equal timestamps the first applied record is
//! kept.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::player::{PlayerId, PlayerMetadata};

/// Result of applying an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// No record existed; the update was inserted.
    Inserted,
    /// The update was newer and replaced the stored record.
    Updated,
    /// The update was not newer than the stored record and was dropped.
    Stale,
}

impl ApplyOutcome {
    /// True unless the update was dropped.
    pub fn accepted(self) -> bool {
        !matches!(self, Self::Stale)
    }
}

/// Where an endpoint claim came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointSource {
    /// Observed source address of the packet carrying the record.
    Observed(SocketAddr),
    /// Address the record claims for itself (possibly relayed).
    Declared,
}

/// A recently-disconnected identity.
#[derive(Clone, Copy, Debug)]
pub struct Disconnection {
    /// Local monotonic time of the disconnect.
    pub at: Instant,
    /// Wall-clock time of the disconnect, for display.
    pub at_utc: DateTime<Utc>,
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Live peers plus recently-disconnected identities.
#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: DashMap<PlayerId, PlayerMetadata>,
    disconnected: DashMap<PlayerId, Disconnection>,
}

impl PlayerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert-or-update with newer-timestamp-wins.
    ///
    /// Insert path stores `update` as-is (endpoint resolved from `source`).
    /// Update path replaces the whole record only if the incoming timestamp
    /// is strictly greater than the stored one. `last_update_local` is set to
    /// `now` whenever the record is accepted.
    pub fn apply(&self, mut update: PlayerMetadata, source: EndpointSource, now: Instant) -> ApplyOutcome {
        match self.players.entry(update.id) {
            Entry::Vacant(slot) => {
                update.endpoint = resolve_endpoint(None, update.endpoint, source);
                update.last_update_local = now;
                slot.insert(update);
                ApplyOutcome::Inserted
            }
            Entry::Occupied(mut slot) => {
                let stored = slot.get_mut();
                if update.last_update_timestamp <= stored.last_update_timestamp {
                    // Ground truth about where the peer is still applies.
                    if let EndpointSource::Observed(addr) = source {
                        stored.endpoint = Some(addr);
                    }
                    return ApplyOutcome::Stale;
                }
                update.endpoint = resolve_endpoint(stored.endpoint, update.endpoint, source);
                update.last_update_local = now;
                *stored = update;
                ApplyOutcome::Updated
            }
        }
    }

    /// Copy of one record.
    pub fn get(&self, id: &PlayerId) -> Option<PlayerMetadata> {
        self.players.get(id).map(|r| r.value().clone())
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: &PlayerId) -> bool {
        self.players.contains_key(id)
    }

    /// Remove a live record.
    pub fn remove(&self, id: &PlayerId) -> Option<PlayerMetadata> {
        self.players.remove(id).map(|(_, v)| v)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.players.len()
    }

    /// True if there are no live records.
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Point-in-time copy of all live records.
    ///
    /// Safe to call while other tasks insert or remove; an entry removed
    /// mid-iteration is either included or not, and at most one tick stale.
    pub fn snapshot(&self) -> Vec<PlayerMetadata> {
        self.players.iter().map(|r| r.value().clone()).collect()
    }

    /// Live records received within `max_age` of `now`.
    pub fn fresh_snapshot(&self, now: Instant, max_age: Duration) -> Vec<PlayerMetadata> {
        self.players
            .iter()
            .filter(|r| now.saturating_duration_since(r.last_update_local) < max_age)
            .map(|r| r.value().clone())
            .collect()
    }

    /// Ids of every live record.
    pub fn ids(&self) -> Vec<PlayerId> {
        self.players.iter().map(|r| *r.key()).collect()
    }

    /// Evict live records older than `max_age`. Each removal re-checks the
    /// age atomically, so an entry refreshed between the scan and the removal
    /// survives.
    pub fn evict_older_than(&self, now: Instant, max_age: Duration) -> Vec<PlayerId> {
        let candidates: Vec<PlayerId> = self
            .players
            .iter()
            .filter(|r| now.saturating_duration_since(r.last_update_local) > max_age)
            .map(|r| *r.key())
            .collect();

        candidates
            .into_iter()
            .filter(|id| {
                self.players
                    .remove_if(id, |_, v| now.saturating_duration_since(v.last_update_local) > max_age)
                    .is_some()
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Disconnect bookkeeping
    // -------------------------------------------------------------------------

    /// Record that `id` disconnected at `now`.
    pub fn mark_disconnected(&self, id: PlayerId, now: Instant) {
        self.disconnected.insert(id, Disconnection { at: now, at_utc: Utc::now() });
    }

    /// Forget a disconnect record (e.g. the peer came back).
    pub fn clear_disconnected(&self, id: &PlayerId) -> bool {
        self.disconnected.remove(id).is_some()
    }

    /// Whether `id` disconnected recently.
    pub fn is_disconnected(&self, id: &PlayerId) -> bool {
        self.disconnected.contains_key(id)
    }

    /// Recently-disconnected ids with their disconnect times.
    pub fn disconnected(&self) -> Vec<(PlayerId, Disconnection)> {
        self.disconnected.iter().map(|r| (*r.key(), *r.value())).collect()
    }

    /// Recently-disconnected ids.
    pub fn disconnected_ids(&self) -> Vec<PlayerId> {
        self.disconnected.iter().map(|r| *r.key()).collect()
    }

    /// Drop disconnect records older than `max_age`.
    pub fn forget_disconnected_older_than(&self, now: Instant, max_age: Duration) -> Vec<PlayerId> {
        let candidates: Vec<PlayerId> = self
            .disconnected
            .iter()
            .filter(|r| now.saturating_duration_since(r.at) > max_age)
            .map(|r| *r.key())
            .collect();

        candidates
            .into_iter()
            .filter(|id| {
                self.disconnected
                    .remove_if(id, |_, d| now.saturating_duration_since(d.at) > max_age)
                    .is_some()
            })
            .collect()
    }
}

// =============================================================================
// ENDPOINT CORRECTION
// =============================================================================

/// Pick the endpoint to store for a record.
///
/// An observed source address always wins. A declared loopback address never
/// overwrites a known endpoint, since loopback only means something to its
/// origin. Best-effort NAT/self-report correction; identity is protected by
/// server-side id assignment, not by this rule.
pub fn resolve_endpoint(
    stored: Option<SocketAddr>,
    declared: Option<SocketAddr>,
    source: EndpointSource,
) -> Option<SocketAddr> {
    match source {
        EndpointSource::Observed(addr) => Some(addr),
        EndpointSource::Declared => match declared {
            Some(addr) if addr.ip().is_loopback() && stored.is_some() => stored,
            Some(addr) => Some(addr),
            None => stored,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn record(id: PlayerId, ts: i64, x: f32) -> PlayerMetadata {
        let mut m = PlayerMetadata::new(id, "p");
        m.last_update_timestamp = ts;
        m.position = [x, 0.0, 0.0];
        m
    }

    #[test]
    fn test_insert_then_newer_update() {
        let reg = PlayerRegistry::new();
        let id = PlayerId::new_v4();
        let now = Instant::now();

        assert_eq!(reg.apply(record(id, 1, 1.0), EndpointSource::Declared, now), ApplyOutcome::Inserted);
        assert_eq!(reg.apply(record(id, 2, 2.0), EndpointSource::Declared, now), ApplyOutcome::Updated);
        assert_eq!(reg.apply(record(id, 1, 9.0), EndpointSource::Declared, now), ApplyOutcome::Stale);
        assert_eq!(reg.get(&id).unwrap().position[0], 2.0);
    }

    #[test]
    fn test_equal_timestamp_keeps_first() {
        let reg = PlayerRegistry::new();
        let id = PlayerId::new_v4();
        let now = Instant::now();

        reg.apply(record(id, 5, 1.0), EndpointSource::Declared, now);
        assert_eq!(reg.apply(record(id, 5, 2.0), EndpointSource::Declared, now), ApplyOutcome::Stale);
        assert_eq!(reg.get(&id).unwrap().position[0], 1.0);
    }

    #[test]
    fn test_shared_endpoint_equal_timestamp_both_orders() {
        let ep: SocketAddr = "1.2.3.4:7777".parse().unwrap();
        let a = PlayerId::from_bytes([1; 16]);
        let b = PlayerId::from_bytes([2; 16]);
        let mut ra = record(a, 10, 1.0);
        let mut rb = record(b, 10, 2.0);
        ra.endpoint = Some(ep);
        rb.endpoint = Some(ep);
        let now = Instant::now();

        let first = PlayerRegistry::new();
        first.apply(ra.clone(), EndpointSource::Declared, now);
        first.apply(rb.clone(), EndpointSource::Declared, now);

        let second = PlayerRegistry::new();
        second.apply(rb, EndpointSource::Declared, now);
        second.apply(ra, EndpointSource::Declared, now);

        // Records are keyed by identity, so both survive regardless of order.
        for reg in [&first, &second] {
            assert_eq!(reg.len(), 2);
            assert_eq!(reg.get(&a).unwrap().position[0], 1.0);
            assert_eq!(reg.get(&b).unwrap().position[0], 2.0);
            assert_eq!(reg.get(&a).unwrap().endpoint, Some(ep));
            assert_eq!(reg.get(&b).unwrap().endpoint, Some(ep));
        }
    }

    #[test]
    fn test_loopback_does_not_overwrite_known_endpoint() {
        let real: SocketAddr = "203.0.113.9:7777".parse().unwrap();
        let lo: SocketAddr = "127.0.0.1:7777".parse().unwrap();
        assert_eq!(resolve_endpoint(Some(real), Some(lo), EndpointSource::Declared), Some(real));
        assert_eq!(resolve_endpoint(None, Some(lo), EndpointSource::Declared), Some(lo));

        let other: SocketAddr = "198.51.100.1:7777".parse().unwrap();
        assert_eq!(resolve_endpoint(Some(real), Some(other), EndpointSource::Declared), Some(other));
        assert_eq!(resolve_endpoint(Some(real), Some(lo), EndpointSource::Observed(other)), Some(other));
    }

    #[test]
    fn test_stale_update_still_takes_observed_endpoint() {
        let reg = PlayerRegistry::new();
        let id = PlayerId::new_v4();
        let now = Instant::now();
        let seen: SocketAddr = "198.51.100.7:5000".parse().unwrap();

        reg.apply(record(id, 5, 0.0), EndpointSource::Declared, now);
        assert_eq!(reg.apply(record(id, 5, 0.0), EndpointSource::Observed(seen), now), ApplyOutcome::Stale);
        assert_eq!(reg.get(&id).unwrap().endpoint, Some(seen));
    }

    #[test]
    fn test_evict_idle_keeps_fresh() {
        let reg = PlayerRegistry::new();
        let start = Instant::now();
        let later = start + Duration::from_secs(10);
        let idle: Vec<PlayerId> = (0..5).map(|_| PlayerId::new_v4()).collect();
        let fresh: Vec<PlayerId> = (0..3).map(|_| PlayerId::new_v4()).collect();

        for id in &idle {
            reg.apply(record(*id, 1, 0.0), EndpointSource::Declared, start);
        }
        for id in &fresh {
            reg.apply(record(*id, 1, 0.0), EndpointSource::Declared, later);
        }

        let mut evicted = reg.evict_older_than(later + Duration::from_secs(1), Duration::from_secs(5));
        evicted.sort();
        let mut expected = idle.clone();
        expected.sort();
        assert_eq!(evicted, expected);
        assert_eq!(reg.len(), 3);
        for id in &fresh {
            assert!(reg.contains(id));
        }
    }

    #[test]
    fn test_disconnect_bookkeeping() {
        let reg = PlayerRegistry::new();
        let id = PlayerId::new_v4();
        let start = Instant::now();

        reg.mark_disconnected(id, start);
        assert!(reg.is_disconnected(&id));
        assert!(reg.forget_disconnected_older_than(start + Duration::from_secs(1), Duration::from_secs(5)).is_empty());
        assert_eq!(reg.forget_disconnected_older_than(start + Duration::from_secs(6), Duration::from_secs(5)), vec![id]);
        assert!(!reg.is_disconnected(&id));
    }

    #[test]
    fn test_iteration_tolerates_concurrent_removal() {
        let reg = Arc::new(PlayerRegistry::new());
        let now = Instant::now();
        let ids: Vec<PlayerId> = (0..500).map(|_| PlayerId::new_v4()).collect();
        for id in &ids {
            reg.apply(record(*id, 1, 0.0), EndpointSource::Declared, now);
        }

        let remover = {
            let reg = reg.clone();
            let ids = ids.clone();
            std::thread::spawn(move || {
                for id in ids {
                    reg.remove(&id);
                }
            })
        };

        for _ in 0..50 {
            let snap = reg.snapshot();
            assert!(snap.len() <= 500);
        }
        remover.join().unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn test_sweep_races_with_reader() {
        let reg = Arc::new(PlayerRegistry::new());
        let start = Instant::now();
        let later = start + Duration::from_secs(30);
        for _ in 0..200 {
            reg.apply(record(PlayerId::new_v4(), 1, 0.0), EndpointSource::Declared, start);
        }
        for _ in 0..100 {
            reg.apply(record(PlayerId::new_v4(), 1, 0.0), EndpointSource::Declared, later);
        }

        let reader = {
            let reg = reg.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    let _ = reg.snapshot();
                }
            })
        };
        let evicted = reg.evict_older_than(later, Duration::from_secs(10));
        reader.join().unwrap();

        assert_eq!(evicted.len(), 200);
        assert_eq!(reg.len(), 100);
    }

    proptest! {
        #[test]
        fn prop_last_write_wins_commutes(t1 in 0i64..1_000_000, dt in 1i64..1_000, x1 in -1e6f32..1e6, x2 in -1e6f32..1e6) {
            let id = PlayerId::from_bytes([7; 16]);
            let now = Instant::now();
            let older = record(id, t1, x1);
            let newer = record(id, t1 + dt, x2);

            let a = PlayerRegistry::new();
            a.apply(older.clone(), EndpointSource::Declared, now);
            a.apply(newer.clone(), EndpointSource::Declared, now);

            let b = PlayerRegistry::new();
            b.apply(newer.clone(), EndpointSource::Declared, now);
            b.apply(older, EndpointSource::Declared, now);

            prop_assert!(a.get(&id).unwrap().same_presence(&newer));
            prop_assert!(b.get(&id).unwrap().same_presence(&newer));
        }
    }
}
