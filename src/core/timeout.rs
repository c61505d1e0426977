//! Presence Timeout Service
//!
//! Periodic sweep that evicts peers whose last update is older than the
//! overdue timeout and forgets stale disconnect records.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::appearance::AppearanceCache;
use super::player::PlayerId;
use super::registry::PlayerRegistry;

/// Timeout configuration.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Age after which a live peer is evicted.
    pub overdue: Duration,
    /// Age after which a disconnect record is forgotten.
    pub disconnect_retention: Duration,
    /// How far before `overdue` a peer stops being retransmitted to others.
    pub pre_timeout_offset: Duration,
    /// Sweep cadence.
    pub sweep_interval: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            overdue: Duration::from_secs(5),
            disconnect_retention: Duration::from_secs(10),
            pre_timeout_offset: Duration::from_millis(500),
            sweep_interval: Duration::from_millis(250),
        }
    }
}

impl TimeoutConfig {
    /// Maximum age at which a peer is still relayed to others.
    pub fn relay_cutoff(&self) -> Duration {
        self.overdue.saturating_sub(self.pre_timeout_offset)
    }
}

/// What one sweep removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Live peers evicted for being overdue.
    pub evicted: Vec<PlayerId>,
    /// Disconnect records forgotten.
    pub forgotten: Vec<PlayerId>,
}

/// Sweeps a registry on a fixed cadence.
pub struct PresenceTimeoutService {
    registry: Arc<PlayerRegistry>,
    appearances: Option<Arc<AppearanceCache>>,
    config: TimeoutConfig,
    /// Record evicted peers as disconnected (serverless gossip uses this to
    /// suppress resurrection by late relays).
    mark_evicted: bool,
}

impl PresenceTimeoutService {
    /// Create a sweeper over `registry`.
    pub fn new(registry: Arc<PlayerRegistry>, config: TimeoutConfig) -> Self {
        Self {
            registry,
            appearances: None,
            config,
            mark_evicted: false,
        }
    }

    /// Also drop evicted peers' appearances.
    pub fn with_appearances(mut self, appearances: Arc<AppearanceCache>) -> Self {
        self.appearances = Some(appearances);
        self
    }

    /// Record evicted peers in the disconnect map.
    pub fn mark_evicted_as_disconnected(mut self, mark: bool) -> Self {
        self.mark_evicted = mark;
        self
    }

    /// Run one sweep at `now`.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let evicted = self.registry.evict_older_than(now, self.config.overdue);
        for id in &evicted {
            if let Some(appearances) = &self.appearances {
                appearances.remove(id);
            }
            if self.mark_evicted {
                self.registry.mark_disconnected(*id, now);
            }
            info!("Peer {} timed out", id.short());
        }

        let forgotten = self
            .registry
            .forget_disconnected_older_than(now, self.config.disconnect_retention);
        if !forgotten.is_empty() {
            debug!("Forgot {} disconnect records", forgotten.len());
        }

        SweepReport { evicted, forgotten }
    }

    /// Spawn the periodic sweep until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep(Instant::now());
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("Timeout sweep stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::player::{PlayerAppearance, PlayerMetadata};
    use crate::core::registry::EndpointSource;

    fn insert(reg: &PlayerRegistry, at: Instant) -> PlayerId {
        let id = PlayerId::new_v4();
        let mut m = PlayerMetadata::new(id, "p");
        m.last_update_timestamp = 1;
        reg.apply(m, EndpointSource::Declared, at);
        id
    }

    #[test]
    fn test_sweep_evicts_only_idle() {
        let reg = Arc::new(PlayerRegistry::new());
        let apps = Arc::new(AppearanceCache::new());
        let start = Instant::now();
        let config = TimeoutConfig::default();
        let later = start + config.overdue * 2;

        let idle: Vec<PlayerId> = (0..4).map(|_| insert(&reg, start)).collect();
        let fresh: Vec<PlayerId> = (0..2).map(|_| insert(&reg, later)).collect();
        for id in &idle {
            apps.store(PlayerAppearance::new(*id, "p", "x"), start);
        }

        let service = PresenceTimeoutService::new(reg.clone(), config).with_appearances(apps.clone());
        let report = service.sweep(later);

        assert_eq!(report.evicted.len(), 4);
        assert_eq!(reg.len(), 2);
        assert!(apps.is_empty());
        for id in fresh {
            assert!(reg.contains(&id));
        }
    }

    #[test]
    fn test_sweep_forgets_disconnects() {
        let reg = Arc::new(PlayerRegistry::new());
        let start = Instant::now();
        let config = TimeoutConfig::default();
        let id = PlayerId::new_v4();
        reg.mark_disconnected(id, start);

        let service = PresenceTimeoutService::new(reg.clone(), config.clone());
        assert!(service.sweep(start + Duration::from_secs(1)).forgotten.is_empty());
        let report = service.sweep(start + config.disconnect_retention + Duration::from_secs(1));
        assert_eq!(report.forgotten, vec![id]);
    }

    #[test]
    fn test_mark_evicted_as_disconnected() {
        let reg = Arc::new(PlayerRegistry::new());
        let start = Instant::now();
        let id = insert(&reg, start);
        let config = TimeoutConfig::default();
        let service = PresenceTimeoutService::new(reg.clone(), config.clone()).mark_evicted_as_disconnected(true);

        service.sweep(start + config.overdue + Duration::from_millis(1));
        assert!(!reg.contains(&id));
        assert!(reg.is_disconnected(&id));
    }

    #[test]
    fn test_relay_cutoff() {
        let config = TimeoutConfig {
            overdue: Duration::from_secs(5),
            pre_timeout_offset: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(config.relay_cutoff(), Duration::from_millis(4500));
    }

    #[tokio::test]
    async fn test_spawned_sweep_stops_on_cancel() {
        let reg = Arc::new(PlayerRegistry::new());
        let config = TimeoutConfig {
            overdue: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let id = insert(&reg, Instant::now());
        let cancel = CancellationToken::new();
        let handle = PresenceTimeoutService::new(reg.clone(), config).spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!reg.contains(&id));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
