//! Appearance Cache
//!
//! Identity to cosmetic appearance, redistributed lazily on top of the
//! normal tick traffic.
//!
//! The server sends each receiver only the appearances it asked for plus the
//! ones that arrived within a short recency window, which keeps the payload
//! bounded no matter how many peers are connected. Receivers track which ids
//! they still lack with [`AppearanceRequests`] and ask again if the recency
//! window did not deliver them.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::player::{PlayerAppearance, PlayerId};

/// Ticks an unknown id waits for the recency window before being requested.
pub const REQUEST_GRACE_TICKS: u32 = 5;

/// Ticks between repeated requests for an id that is still unknown.
pub const REQUEST_RETRY_TICKS: u32 = 50;

/// Upper bound on ids requested in one tick.
pub const MAX_REQUESTS_PER_TICK: usize = 16;

#[derive(Clone, Debug)]
struct CachedAppearance {
    appearance: PlayerAppearance,
    received_at: Instant,
}

// =============================================================================
// CACHE
// =============================================================================

/// Shared identity to appearance map.
#[derive(Debug, Default)]
pub struct AppearanceCache {
    entries: DashMap<PlayerId, CachedAppearance>,
}

impl AppearanceCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or wholesale replace) an appearance. Returns true if it changed.
    pub fn store(&self, appearance: PlayerAppearance, now: Instant) -> bool {
        let id = appearance.id;
        let changed = self
            .entries
            .get(&id)
            .map_or(true, |e| e.appearance != appearance);
        if changed {
            self.entries.insert(id, CachedAppearance { appearance, received_at: now });
        }
        changed
    }

    /// Copy of one appearance.
    pub fn get(&self, id: &PlayerId) -> Option<PlayerAppearance> {
        self.entries.get(id).map(|e| e.appearance.clone())
    }

    /// Whether the appearance for `id` is known.
    pub fn contains(&self, id: &PlayerId) -> bool {
        self.entries.contains_key(id)
    }

    /// Drop the appearance for `id`.
    pub fn remove(&self, id: &PlayerId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Number of cached appearances.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All cached appearances.
    pub fn snapshot(&self) -> Vec<PlayerAppearance> {
        self.entries.iter().map(|e| e.appearance.clone()).collect()
    }

    /// Per-receiver view: every explicitly requested id that is known, plus
    /// every appearance received within `recency` of `now`.
    pub fn view_for(&self, requested: &[PlayerId], now: Instant, recency: Duration) -> Vec<PlayerAppearance> {
        let requested: BTreeSet<&PlayerId> = requested.iter().collect();
        self.entries
            .iter()
            .filter(|e| {
                requested.contains(e.key())
                    || now.saturating_duration_since(e.received_at) <= recency
            })
            .map(|e| e.appearance.clone())
            .collect()
    }

    /// Drop entries whose id is not in `live` (and is not `keep`).
    pub fn retain_live(&self, live: &[PlayerId], keep: Option<PlayerId>) {
        let live: BTreeSet<&PlayerId> = live.iter().collect();
        self.entries
            .retain(|id, _| live.contains(id) || Some(*id) == keep);
    }
}

// =============================================================================
// RECEIVER-SIDE REQUEST TRACKING
// =============================================================================

/// Tracks ids whose appearance a receiver still lacks and decides when to
/// ask for them. Owned by a single connection loop.
#[derive(Debug, Default)]
pub struct AppearanceRequests {
    missing: HashMap<PlayerId, u32>,
}

impl AppearanceRequests {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance one tick and return the ids to request this tick.
    ///
    /// `live` is the set of peers currently known; ids already in `cache`
    /// are resolved and forgotten.
    pub fn next_requests(&mut self, live: &[PlayerId], cache: &AppearanceCache) -> Vec<PlayerId> {
        self.missing.retain(|id, _| live.contains(id) && !cache.contains(id));

        let mut out = Vec::new();
        for id in live {
            if cache.contains(id) {
                continue;
            }
            let ticks = self.missing.entry(*id).or_insert(0);
            *ticks += 1;
            let due = *ticks == REQUEST_GRACE_TICKS
                || (*ticks > REQUEST_GRACE_TICKS
                    && (*ticks - REQUEST_GRACE_TICKS) % REQUEST_RETRY_TICKS == 0);
            if due && out.len() < MAX_REQUESTS_PER_TICK {
                out.push(*id);
            }
        }
        out
    }

    /// Number of unresolved ids.
    pub fn pending(&self) -> usize {
        self.missing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(id: PlayerId, d: &str) -> PlayerAppearance {
        PlayerAppearance::new(id, "n", d)
    }

    #[test]
    fn test_store_replace_remove() {
        let cache = AppearanceCache::new();
        let id = PlayerId::new_v4();
        let now = Instant::now();

        assert!(cache.store(app(id, "red"), now));
        assert!(!cache.store(app(id, "red"), now));
        assert!(cache.store(app(id, "blue"), now));
        assert_eq!(cache.get(&id).unwrap().descriptor, "blue");
        assert!(cache.remove(&id));
        assert!(!cache.contains(&id));
    }

    #[test]
    fn test_view_requested_or_recent() {
        let cache = AppearanceCache::new();
        let start = Instant::now();
        let later = start + Duration::from_secs(60);
        let old_a = PlayerId::new_v4();
        let old_b = PlayerId::new_v4();
        let recent = PlayerId::new_v4();

        cache.store(app(old_a, "a"), start);
        cache.store(app(old_b, "b"), start);
        cache.store(app(recent, "c"), later);

        let view = cache.view_for(&[old_a], later, Duration::from_secs(5));
        let mut ids: Vec<PlayerId> = view.iter().map(|a| a.id).collect();
        ids.sort();
        let mut expected = vec![old_a, recent];
        expected.sort();
        assert_eq!(ids, expected);

        let none = cache.view_for(&[], later + Duration::from_secs(10), Duration::from_secs(5));
        assert!(none.is_empty());
    }

    #[test]
    fn test_requests_after_grace_then_retry() {
        let cache = AppearanceCache::new();
        let mut reqs = AppearanceRequests::new();
        let id = PlayerId::new_v4();
        let live = vec![id];

        let mut asked_on = Vec::new();
        for tick in 1..=(REQUEST_GRACE_TICKS + 2 * REQUEST_RETRY_TICKS) {
            if !reqs.next_requests(&live, &cache).is_empty() {
                asked_on.push(tick);
            }
        }
        assert_eq!(
            asked_on,
            vec![
                REQUEST_GRACE_TICKS,
                REQUEST_GRACE_TICKS + REQUEST_RETRY_TICKS,
                REQUEST_GRACE_TICKS + 2 * REQUEST_RETRY_TICKS,
            ]
        );

        cache.store(app(id, "x"), Instant::now());
        assert!(reqs.next_requests(&live, &cache).is_empty());
        assert_eq!(reqs.pending(), 0);
    }

    #[test]
    fn test_requests_bounded_per_tick() {
        let cache = AppearanceCache::new();
        let mut reqs = AppearanceRequests::new();
        let live: Vec<PlayerId> = (0..40).map(|_| PlayerId::new_v4()).collect();

        let mut last = Vec::new();
        for _ in 0..REQUEST_GRACE_TICKS {
            last = reqs.next_requests(&live, &cache);
        }
        assert_eq!(last.len(), MAX_REQUESTS_PER_TICK);
    }

    #[test]
    fn test_retain_live() {
        let cache = AppearanceCache::new();
        let now = Instant::now();
        let me = PlayerId::new_v4();
        let live = PlayerId::new_v4();
        let gone = PlayerId::new_v4();
        for id in [me, live, gone] {
            cache.store(app(id, "x"), now);
        }
        cache.retain_live(&[live], Some(me));
        assert!(cache.contains(&me));
        assert!(cache.contains(&live));
        assert!(!cache.contains(&gone));
    }
}
