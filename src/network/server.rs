//! Presence Server
//!
//! Authoritative dedicated-server mode. Accepts TCP connections, applies the
//! allow/block filters, runs one session task per connection and owns the
//! registry every session reads and writes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::core::appearance::AppearanceCache;
use crate::core::ip_filter::{IpAddressRange, IpFilter};
use crate::core::player::{PlayerAppearance, PlayerId, PlayerMetadata, WorldPayload};
use crate::core::registry::{Disconnection, PlayerRegistry};
use crate::core::timeout::{PresenceTimeoutService, TimeoutConfig};
use crate::network::discovery::{Advertisement, DiscoveryAdvertiser, DiscoveryConfig};
use crate::network::monitor::MonitorBridge;
use crate::network::session::{self, SessionHandle};
use crate::network::supervisor::{spawn_supervised, FatalSlot};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address. `::` binds dual-stack where the platform allows it.
    pub bind_addr: IpAddr,
    /// Listen port (0 picks a free port).
    pub port: u16,
    /// Extra bind attempts after the first failure.
    pub bind_retry_count: u32,
    /// Delay between bind attempts.
    pub bind_retry_delay: Duration,
    /// Minimum time between ticks on one session.
    pub tick_interval: Duration,
    /// Eviction and read timeouts.
    pub timeouts: TimeoutConfig,
    /// How long a fresh appearance is pushed to every receiver.
    pub appearance_recency: Duration,
    /// Only admit addresses on the allow list.
    pub allow_list_enabled: bool,
    /// Allow list specification.
    pub allow_list: String,
    /// Block list specification.
    pub block_list: String,
    /// Relay world-state payloads between clients.
    pub world_sync: bool,
    /// Initial world time scale.
    pub time_scale: f32,
    /// Advertise on the LAN.
    pub lan_advertise: bool,
    /// Name shown in LAN discovery.
    pub server_name: String,
    /// Monitoring bridge port, if enabled.
    pub monitor_port: Option<u16>,
    /// How long background tasks get to stop on their own during shutdown.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            port: 7777,
            bind_retry_count: 3,
            bind_retry_delay: Duration::from_secs(1),
            tick_interval: Duration::from_millis(10),
            timeouts: TimeoutConfig::default(),
            appearance_recency: Duration::from_secs(5),
            allow_list_enabled: false,
            allow_list: String::new(),
            block_list: String::new(),
            world_sync: false,
            time_scale: 1.0,
            lan_advertise: false,
            server_name: String::new(),
            monitor_port: None,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind.
    #[error("failed to bind: {0}")]
    BindFailed(#[source] std::io::Error),

    /// Server already started.
    #[error("server already running")]
    AlreadyRunning,

    /// No session with that id.
    #[error("no connected player {0}")]
    UnknownPlayer(PlayerId),

    /// A background task failed.
    #[error("fatal: {0}")]
    Fatal(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// Allow/block filters, swapped at runtime by operator commands.
#[derive(Debug, Clone, Default)]
pub struct AccessFilters {
    /// Whether the allow list is enforced.
    pub allow_enabled: bool,
    /// Addresses admitted when `allow_enabled`.
    pub allow: IpFilter,
    /// Addresses always rejected.
    pub block: IpFilter,
}

impl AccessFilters {
    /// Whether a connection from `ip` may proceed.
    pub fn admits(&self, ip: &IpAddr) -> bool {
        if self.block.contains(ip) {
            return false;
        }
        !self.allow_enabled || self.allow.contains(ip)
    }
}

/// Latest world-state payload with a revision counter.
#[derive(Debug, Default)]
pub struct WorldState {
    inner: Mutex<(u64, WorldPayload)>,
}

impl WorldState {
    /// Merge an incoming payload; present parts replace stored parts.
    pub fn publish(&self, payload: WorldPayload) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (revision, stored) = &mut *guard;
        if payload.level_state.is_some() {
            stored.level_state = payload.level_state;
        }
        if payload.save_update.is_some() {
            stored.save_update = payload.save_update;
        }
        *revision += 1;
    }

    /// The stored payload if it changed since `seen`, updating `seen`.
    pub fn since(&self, seen: &mut u64) -> WorldPayload {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (revision, stored) = &*guard;
        if *revision == *seen {
            return WorldPayload::default();
        }
        *seen = *revision;
        stored.clone()
    }
}

/// State shared by the accept loop, every session and the operator surface.
pub(crate) struct ServerShared {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Arc<PlayerRegistry>,
    pub(crate) appearances: Arc<AppearanceCache>,
    pub(crate) world: WorldState,
    pub(crate) sessions: DashMap<PlayerId, SessionHandle>,
    pub(crate) filters: RwLock<AccessFilters>,
    time_scale_bits: AtomicU32,
}

/// Stop signals and task set for one run. Replaced by every `start`.
#[derive(Clone, Default)]
pub(crate) struct RunControl {
    /// Cooperative stop: loops exit between iterations.
    pub(crate) disposing: CancellationToken,
    /// Forcible stop: aborts blocked transport operations.
    pub(crate) force_close: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

impl ServerShared {
    pub(crate) fn time_scale(&self) -> f32 {
        f32::from_bits(self.time_scale_bits.load(Ordering::Relaxed))
    }

    fn admits(&self, ip: &IpAddr) -> bool {
        self.filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .admits(ip)
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// The presence server.
pub struct PresenceServer {
    shared: Arc<ServerShared>,
    run: Mutex<RunControl>,
    fatal: Arc<FatalSlot>,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl PresenceServer {
    /// Create a server. Nothing is bound until [`start`](Self::start).
    pub fn new(config: ServerConfig) -> Self {
        let filters = AccessFilters {
            allow_enabled: config.allow_list_enabled,
            allow: IpFilter::parse(&config.allow_list),
            block: IpFilter::parse(&config.block_list),
        };
        let time_scale_bits = AtomicU32::new(config.time_scale.to_bits());

        Self {
            shared: Arc::new(ServerShared {
                config,
                registry: Arc::new(PlayerRegistry::new()),
                appearances: Arc::new(AppearanceCache::new()),
                world: WorldState::default(),
                sessions: DashMap::new(),
                filters: RwLock::new(filters),
                time_scale_bits,
            }),
            run: Mutex::new(RunControl::default()),
            fatal: Arc::new(FatalSlot::new()),
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        }
    }

    /// Bind and spawn the accept loop, timeout sweep, and (if configured)
    /// the LAN advertiser and monitoring bridge. Returns the bound address.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }
        let config = &self.shared.config;

        let listener = match bind_listener(config).await {
            Ok(l) => l,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let monitor = match config.monitor_port {
            Some(port) => match TcpListener::bind(SocketAddr::new(config.bind_addr, port)).await {
                Ok(l) => Some(l),
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(ServerError::BindFailed(e));
                }
            },
            None => None,
        };
        let local = listener.local_addr()?;
        if let Some(l) = &monitor {
            info!("Monitoring bridge on {}", l.local_addr()?);
        }
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local);
        info!("Presence server listening on {}", local);

        // Fresh signals so a restart after shutdown is not born cancelled.
        let run = RunControl::default();
        *self.run.lock().unwrap_or_else(PoisonError::into_inner) = run.clone();
        let tracker = &run.tracker;

        spawn_supervised(
            tracker,
            "accept",
            self.fatal.clone(),
            accept_loop(self.shared.clone(), listener, run.clone()),
        );

        let sweeper = PresenceTimeoutService::new(self.shared.registry.clone(), config.timeouts.clone())
            .with_appearances(self.shared.appearances.clone())
            .mark_evicted_as_disconnected(true);
        let cancel = run.disposing.clone();
        spawn_supervised(tracker, "timeout-sweep", self.fatal.clone(), async move {
            sweeper.spawn(cancel).await.map_err(|e| e.to_string())
        });

        if config.lan_advertise {
            let advertiser = DiscoveryAdvertiser::new(
                DiscoveryConfig::default(),
                Advertisement::current(local.port(), config.server_name.clone()),
            );
            let cancel = run.disposing.clone();
            spawn_supervised(tracker, "lan-advertise", self.fatal.clone(), async move {
                advertiser.run(cancel).await
            });
        }

        if let Some(listener) = monitor {
            let bridge = MonitorBridge::new(self.shared.registry.clone(), self.shared.appearances.clone());
            let cancel = run.disposing.clone();
            spawn_supervised(tracker, "monitor", self.fatal.clone(), async move {
                bridge.serve(listener, cancel).await
            });
        }

        Ok(local)
    }

    /// Stop everything: signal, wait for loops to exit on their own, then
    /// force-close any transport still open.
    pub async fn shutdown(&self) {
        info!("Presence server shutting down");
        let run = self.run.lock().unwrap_or_else(PoisonError::into_inner).clone();
        run.disposing.cancel();
        run.tracker.close();

        let grace = self.shared.config.shutdown_grace;
        if timeout(grace, run.tracker.wait()).await.is_err() {
            warn!("Tasks still running after {:?}, force-closing transports", grace);
            run.force_close.cancel();
            if timeout(grace, run.tracker.wait()).await.is_err() {
                warn!("Some tasks did not stop");
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Re-raise the first background failure, if any.
    pub fn poll(&self) -> Result<(), ServerError> {
        match self.fatal.take() {
            Some(message) => Err(ServerError::Fatal(message)),
            None => Ok(()),
        }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `start` succeeded and `shutdown` has not run.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Read surface
    // -------------------------------------------------------------------------

    /// Shared registry.
    pub fn registry(&self) -> &Arc<PlayerRegistry> {
        &self.shared.registry
    }

    /// Shared appearance cache.
    pub fn appearances(&self) -> &Arc<AppearanceCache> {
        &self.shared.appearances
    }

    /// Live players.
    pub fn players(&self) -> Vec<PlayerMetadata> {
        self.shared.registry.snapshot()
    }

    /// Recently-disconnected players.
    pub fn disconnected(&self) -> Vec<(PlayerId, Disconnection)> {
        self.shared.registry.disconnected()
    }

    /// Cached appearances.
    pub fn appearance_list(&self) -> Vec<PlayerAppearance> {
        self.shared.appearances.snapshot()
    }

    /// Live sessions.
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.shared.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Number of live sessions.
    pub fn connection_count(&self) -> usize {
        self.shared.sessions.len()
    }

    // -------------------------------------------------------------------------
    // Operator surface
    // -------------------------------------------------------------------------

    /// Force-close one session from outside its loop.
    pub fn kick(&self, id: &PlayerId) -> Result<SocketAddr, ServerError> {
        let handle = self
            .shared
            .sessions
            .get(id)
            .map(|s| s.value().clone())
            .ok_or(ServerError::UnknownPlayer(*id))?;
        info!("Kicking {} ({})", id.short(), handle.addr);
        handle.kill();
        Ok(handle.addr)
    }

    /// Block `ip` and kick every session from it. Returns sessions kicked.
    pub fn ban_address(&self, ip: IpAddr) -> usize {
        {
            let mut filters = self.shared.filters.write().unwrap_or_else(PoisonError::into_inner);
            filters.block.push(IpAddressRange::single(ip));
        }
        let victims: Vec<SessionHandle> = self
            .shared
            .sessions
            .iter()
            .filter(|s| same_host(&s.addr.ip(), &ip))
            .map(|s| s.value().clone())
            .collect();
        for handle in &victims {
            handle.kill();
        }
        info!("Banned {} ({} sessions closed)", ip, victims.len());
        victims.len()
    }

    /// Ban the address a connected player is using.
    pub fn ban_player(&self, id: &PlayerId) -> Result<IpAddr, ServerError> {
        let ip = self
            .shared
            .sessions
            .get(id)
            .map(|s| s.addr.ip())
            .ok_or(ServerError::UnknownPlayer(*id))?;
        self.ban_address(ip);
        Ok(ip)
    }

    /// Replace the allow list.
    pub fn set_allow_list(&self, spec: &str) {
        self.shared.filters.write().unwrap_or_else(PoisonError::into_inner).allow = IpFilter::parse(spec);
    }

    /// Replace the block list.
    pub fn set_block_list(&self, spec: &str) {
        self.shared.filters.write().unwrap_or_else(PoisonError::into_inner).block = IpFilter::parse(spec);
    }

    /// Enforce or relax the allow list.
    pub fn set_allow_list_enabled(&self, enabled: bool) {
        self.shared.filters.write().unwrap_or_else(PoisonError::into_inner).allow_enabled = enabled;
    }

    /// Current filters.
    pub fn filters(&self) -> AccessFilters {
        self.shared.filters.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Current world time scale.
    pub fn time_scale(&self) -> f32 {
        self.shared.time_scale()
    }

    /// Change the world time scale sent with every tick.
    pub fn set_time_scale(&self, scale: f32) {
        self.shared.time_scale_bits.store(scale.to_bits(), Ordering::Relaxed);
    }
}

// =============================================================================
// LISTENER
// =============================================================================

async fn bind_listener(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let mut candidates = vec![SocketAddr::new(config.bind_addr, config.port)];
    if config.bind_addr == IpAddr::V6(Ipv6Addr::UNSPECIFIED) {
        candidates.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port));
    }

    let mut attempt = 0;
    loop {
        let mut last_err = None;
        for addr in &candidates {
            match TcpListener::bind(addr).await {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    debug!("Bind {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        let err = last_err.unwrap_or_else(|| std::io::Error::other("no bind candidates"));
        if attempt >= config.bind_retry_count {
            return Err(ServerError::BindFailed(err));
        }
        attempt += 1;
        warn!("Bind failed ({}), retry {}/{}", err, attempt, config.bind_retry_count);
        sleep(config.bind_retry_delay).await;
    }
}

async fn accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    run: RunControl,
) -> Result<(), ServerError> {
    loop {
        tokio::select! {
            _ = run.disposing.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    if !shared.admits(&addr.ip()) {
                        info!("Rejected connection from {}", addr);
                        drop(stream);
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay failed for {}: {}", addr, e);
                    }
                    debug!("Accepted connection from {}", addr);
                    run.tracker.spawn(session::serve(shared.clone(), &run, stream, addr));
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                    sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    debug!("Accept loop stopped");
    Ok(())
}

/// Compare addresses, treating IPv4-mapped IPv6 as IPv4.
fn same_host(a: &IpAddr, b: &IpAddr) -> bool {
    a.to_canonical() == b.to_canonical()
}
