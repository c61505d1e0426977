//! Serverless Gossip Peer
//!
//! Relay-less mode: every peer periodically sends its own record plus the
//! peers it knows about to every endpoint it knows, over UDP. There is no
//! authority; each peer's registry converges by newer-timestamp-wins.
//!
//! Datagrams that do not carry our signature and version are treated as
//! noise from some other application and dropped without complaint.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::core::player::{PlayerId, PlayerMetadata, SenderClock};
use crate::core::registry::{ApplyOutcome, EndpointSource, PlayerRegistry};
use crate::core::timeout::{PresenceTimeoutService, TimeoutConfig};
use crate::network::protocol::{decode, encode, Notice, Packet, PlayerInfo, MAX_DATAGRAM_BYTES};
use crate::network::supervisor::{spawn_supervised, FatalSlot};

/// Most peers relayed in one datagram.
pub const MAX_RELAYED: usize = 64;

/// Serverless peer configuration.
#[derive(Debug, Clone)]
pub struct ServerlessConfig {
    /// Bind address.
    pub bind_addr: IpAddr,
    /// Bind port (0 picks a free port).
    pub port: u16,
    /// Endpoints to gossip with before any peer is known.
    pub bootstrap: Vec<SocketAddr>,
    /// Gossip cadence.
    pub tick_interval: Duration,
    /// Eviction timeouts and the relay cutoff.
    pub timeouts: TimeoutConfig,
    /// How long `shutdown` waits for tasks.
    pub shutdown_grace: Duration,
}

impl Default for ServerlessConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            port: 7778,
            bootstrap: Vec::new(),
            tick_interval: Duration::from_millis(50),
            timeouts: TimeoutConfig::default(),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Serverless errors.
#[derive(Debug, Error)]
pub enum ServerlessError {
    /// Peer already started.
    #[error("peer already running")]
    AlreadyRunning,

    /// Failed to bind.
    #[error("failed to bind: {0}")]
    BindFailed(#[source] std::io::Error),

    /// A background task failed.
    #[error("fatal: {0}")]
    Fatal(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

struct PeerShared {
    config: ServerlessConfig,
    id: PlayerId,
    registry: Arc<PlayerRegistry>,
    clock: SenderClock,
    local: Mutex<PlayerMetadata>,
}

impl PeerShared {
    /// Apply one received datagram.
    fn handle(&self, packet: Packet, src: SocketAddr, now: Instant) {
        match packet {
            Packet::PlayerInfo(info) => self.handle_info(info, src, now),
            Packet::Notice(Notice::Disconnect { id, endpoint }) => self.handle_leave(id, &endpoint, src, now),
            Packet::Notice(Notice::Message(text)) => debug!("Message from {}: {}", src, text),
            other => trace!("Ignoring {:?} datagram from {}", other.kind(), src),
        }
    }

    fn handle_info(&self, info: PlayerInfo, src: SocketAddr, now: Instant) {
        let PlayerInfo { sender, relayed } = info;
        if sender.id == self.id {
            return;
        }

        // A direct packet means the sender is alive, whatever others said.
        if self.registry.clear_disconnected(&sender.id) {
            debug!("Peer {} is back", sender.id.short());
        }
        let sender_id = sender.id;
        if self.registry.apply(sender, EndpointSource::Observed(src), now) == ApplyOutcome::Inserted {
            info!("Peer {} joined from {}", sender_id.short(), src);
        }

        for record in relayed {
            if record.id == self.id || record.id == sender_id || self.registry.is_disconnected(&record.id) {
                continue;
            }
            self.registry.apply(record, EndpointSource::Declared, now);
        }
    }

    fn handle_leave(&self, id: Option<PlayerId>, endpoint: &str, src: SocketAddr, now: Instant) {
        let id = id.or_else(|| {
            let declared: Option<SocketAddr> = endpoint.parse().ok();
            self.registry
                .snapshot()
                .into_iter()
                .find(|p| p.endpoint == Some(src) || (declared.is_some() && p.endpoint == declared))
                .map(|p| p.id)
        });
        let Some(id) = id else {
            debug!("Leave notice from unknown peer {}", src);
            return;
        };
        if id == self.id {
            return;
        }
        self.registry.remove(&id);
        self.registry.mark_disconnected(id, now);
        info!("Peer {} left", id.short());
    }

    /// Our datagram for this tick.
    fn build_info(&self, now: Instant) -> PlayerInfo {
        let mut sender = self.local.lock().unwrap_or_else(PoisonError::into_inner).clone();
        sender.id = self.id;
        sender.endpoint = None;
        sender.last_update_timestamp = self.clock.now();

        let mut relayed = self
            .registry
            .fresh_snapshot(now, self.config.timeouts.relay_cutoff());
        relayed.truncate(MAX_RELAYED);

        PlayerInfo { sender, relayed }
    }

    /// Every endpoint to gossip with.
    fn targets(&self, own: SocketAddr) -> Vec<SocketAddr> {
        let mut seen = HashSet::new();
        self.config
            .bootstrap
            .iter()
            .copied()
            .chain(self.registry.snapshot().into_iter().filter_map(|p| p.endpoint))
            .filter(|addr| *addr != own && seen.insert(*addr))
            .collect()
    }
}

/// A serverless gossip peer.
pub struct ServerlessPeer {
    shared: Arc<PeerShared>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    run: Mutex<(CancellationToken, TaskTracker)>,
    fatal: Arc<FatalSlot>,
    running: AtomicBool,
}

impl ServerlessPeer {
    /// Create a peer with a fresh self-assigned id.
    pub fn new(config: ServerlessConfig, name: impl Into<String>) -> Self {
        let id = PlayerId::new_v4();
        Self {
            shared: Arc::new(PeerShared {
                config,
                id,
                registry: Arc::new(PlayerRegistry::new()),
                clock: SenderClock::new(),
                local: Mutex::new(PlayerMetadata::new(id, name)),
            }),
            socket: Mutex::new(None),
            run: Mutex::new((CancellationToken::new(), TaskTracker::new())),
            fatal: Arc::new(FatalSlot::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Our id.
    pub fn id(&self) -> PlayerId {
        self.shared.id
    }

    /// Known peers.
    pub fn registry(&self) -> &Arc<PlayerRegistry> {
        &self.shared.registry
    }

    /// Modify the local record. The id is kept.
    pub fn update_local(&self, f: impl FnOnce(&mut PlayerMetadata)) {
        let mut local = self.shared.local.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut local);
        local.id = self.shared.id;
    }

    /// Bound socket address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    /// Bind and start gossiping.
    pub async fn start(&self) -> Result<SocketAddr, ServerlessError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerlessError::AlreadyRunning);
        }
        let config = &self.shared.config;
        let socket = match UdpSocket::bind(SocketAddr::new(config.bind_addr, config.port)).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(ServerlessError::BindFailed(e));
            }
        };
        let local = socket.local_addr()?;
        *self.socket.lock().unwrap_or_else(PoisonError::into_inner) = Some(socket.clone());
        info!("Serverless peer {} on {}", self.shared.id.short(), local);

        let (cancel, tracker) = (CancellationToken::new(), TaskTracker::new());
        *self.run.lock().unwrap_or_else(PoisonError::into_inner) = (cancel.clone(), tracker.clone());

        spawn_supervised(
            &tracker,
            "gossip-recv",
            self.fatal.clone(),
            receive_loop(self.shared.clone(), socket.clone(), cancel.clone()),
        );
        spawn_supervised(
            &tracker,
            "gossip-send",
            self.fatal.clone(),
            send_loop(self.shared.clone(), socket, local, cancel.clone()),
        );

        let sweeper = PresenceTimeoutService::new(self.shared.registry.clone(), config.timeouts.clone())
            .mark_evicted_as_disconnected(true);
        spawn_supervised(&tracker, "gossip-sweep", self.fatal.clone(), async move {
            sweeper.spawn(cancel).await.map_err(|e| e.to_string())
        });

        Ok(local)
    }

    /// Stop gossiping, then tell every known peer we left.
    pub async fn shutdown(&self) {
        let (cancel, tracker) = self.run.lock().unwrap_or_else(PoisonError::into_inner).clone();
        cancel.cancel();
        tracker.close();
        if timeout(self.shared.config.shutdown_grace, tracker.wait()).await.is_err() {
            warn!("Gossip tasks did not stop in time");
        }

        // Sent after the loops stop so no later gossip revives us.
        let socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(socket) = socket {
            if let Ok(own) = socket.local_addr() {
                let bye = encode(&Packet::Notice(Notice::Disconnect {
                    id: Some(self.shared.id),
                    endpoint: own.to_string(),
                }));
                for target in self.shared.targets(own) {
                    if let Err(e) = socket.send_to(&bye, target).await {
                        debug!("Leave notice to {} failed: {}", target, e);
                    }
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Serverless peer {} stopped", self.shared.id.short());
    }

    /// Re-raise the first background failure, if any.
    pub fn poll(&self) -> Result<(), ServerlessError> {
        match self.fatal.take() {
            Some(message) => Err(ServerlessError::Fatal(message)),
            None => Ok(()),
        }
    }
}

async fn receive_loop(
    shared: Arc<PeerShared>,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
) -> Result<(), ServerlessError> {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        let (len, src) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    // ICMP unreachable from a departed peer surfaces here.
                    debug!("Receive error: {}", e);
                    continue;
                }
            },
        };

        match decode(&buf[..len]) {
            Ok(packet) => shared.handle(packet, src, Instant::now()),
            Err(e) if e.is_incompatible() => trace!("Dropped foreign datagram from {}", src),
            Err(e) => {
                debug!("Malformed datagram from {}: {}", src, e);
                #[cfg(feature = "debug-tracing")]
                trace!("Datagram bytes: {}", hex::encode(&buf[..len.min(64)]));
            }
        }
    }
    debug!("Gossip receive loop stopped");
    Ok(())
}

async fn send_loop(
    shared: Arc<PeerShared>,
    socket: Arc<UdpSocket>,
    own: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), ServerlessError> {
    let mut ticker = interval(shared.config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let info = shared.build_info(Instant::now());
        let mut bytes = encode(&Packet::PlayerInfo(info));
        if bytes.len() > MAX_DATAGRAM_BYTES {
            let mut info = shared.build_info(Instant::now());
            info.relayed.clear();
            bytes = encode(&Packet::PlayerInfo(info));
        }

        for target in shared.targets(own) {
            if let Err(e) = socket.send_to(&bytes, target).await {
                trace!("Send to {} failed: {}", target, e);
            }
        }
    }
    debug!("Gossip send loop stopped");
    Ok(())
}
