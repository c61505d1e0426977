//! Connection Engine
//!
//! Client side of dedicated-server mode. One background task owns the
//! connection: it waits for the local snapshot, performs the handshake,
//! then answers every server tick with the local player's current tick.
//!
//! Transport failures after a successful handshake are retried silently for
//! a bounded window; failure of the very first handshake is fatal at once.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::core::appearance::{AppearanceCache, AppearanceRequests};
use crate::core::player::{
    ActiveLevelState, PlayerAppearance, PlayerId, PlayerMetadata, SaveDataUpdate, SenderClock, WorldPayload,
};
use crate::core::registry::{EndpointSource, PlayerRegistry};
use crate::network::protocol::{read_frame, write_frame, ClientTick, Packet, ProtocolError, ServerTick};
use crate::network::supervisor::{spawn_supervised, FatalSlot};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Limit on opening the TCP connection.
    pub connect_timeout: Duration,
    /// Read/write limit; a silent server is detected by this.
    pub overdue_timeout: Duration,
    /// How long reconnection is retried after a working connection drops.
    pub reconnect_timeout: Duration,
    /// Delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// How long `disconnect` waits before aborting the task.
    pub disconnect_grace: Duration,
    /// Send and accept world-state payloads.
    pub world_sync: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            overdue_timeout: Duration::from_secs(5),
            reconnect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_millis(250),
            disconnect_grace: Duration::from_secs(1),
            world_sync: false,
        }
    }
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A connection is already being attempted or is live.
    #[error("already connected or connecting")]
    AlreadyConnected,

    /// The server speaks a different protocol version.
    #[error("incompatible server: {0}")]
    IncompatibleVersion(String),

    /// The first handshake never succeeded.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// Reconnection did not succeed within the window.
    #[error("reconnect gave up after {waited:?}: {last_error}")]
    ReconnectTimeout {
        /// Time spent reconnecting.
        waited: Duration,
        /// Last transport error.
        last_error: String,
    },

    /// A transport operation exceeded its limit.
    #[error("timed out")]
    TimedOut,

    /// The connection task failed unexpectedly.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Protocol or transport failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    fn is_incompatible(&self) -> bool {
        matches!(self, Self::Protocol(p) if p.is_incompatible())
    }
}

/// Derived connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection task.
    Disconnected,
    /// Task alive, handshake not complete.
    Connecting,
    /// Handshake complete and the connection is live.
    Connected,
}

/// Notifications for the embedding application.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// Handshake completed; the server assigned `id`.
    Connected {
        /// Server-assigned id.
        id: PlayerId,
    },
    /// Connection dropped; retrying.
    Reconnecting {
        /// Error that caused the drop.
        error: String,
    },
    /// Disconnected on request.
    Disconnected,
    /// Gave up; the caller must reconnect manually.
    Fatal {
        /// Failure text.
        error: String,
    },
}

/// Human-readable status.
#[derive(Clone, Debug, Default, PartialEq)]
enum Status {
    #[default]
    Idle,
    Connecting(SocketAddr),
    Connected(PlayerId),
    Reconnecting(String),
    Failed(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "disconnected"),
            Self::Connecting(addr) => write!(f, "connecting to {}...", addr),
            Self::Connected(id) => write!(f, "connected as {}", id.short()),
            Self::Reconnecting(err) => write!(f, "reconnecting: {}", err),
            Self::Failed(err) => write!(f, "failed: {}", err),
        }
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

struct ClientShared {
    config: ClientConfig,
    registry: Arc<PlayerRegistry>,
    appearances: Arc<AppearanceCache>,
    clock: SenderClock,
    local: watch::Sender<Option<PlayerMetadata>>,
    appearance: watch::Sender<Option<PlayerAppearance>>,
    outgoing_world: Mutex<WorldPayload>,
    incoming_world: Mutex<WorldPayload>,
    assigned_id: Mutex<Option<PlayerId>>,
    time_scale_bits: AtomicU32,
    status: Mutex<Status>,
    failure: Mutex<Option<ClientError>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ClientShared {
    fn set_status(&self, status: Status) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn connected_id(&self) -> Option<PlayerId> {
        *self.assigned_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_connected_id(&self, id: Option<PlayerId>) {
        *self.assigned_id.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }

    fn forget_remote(&self) {
        for id in self.registry.ids() {
            self.registry.remove(&id);
        }
        self.appearances.retain_live(&[], None);
    }
}

struct Attempt {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Client connection engine.
pub struct ConnectionEngine {
    shared: Arc<ClientShared>,
    tracker: TaskTracker,
    fatal: Arc<FatalSlot>,
    attempt: Mutex<Option<Attempt>>,
}

impl ConnectionEngine {
    /// Create an engine. Nothing connects until [`connect`](Self::connect).
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            shared: Arc::new(ClientShared {
                config,
                registry: Arc::new(PlayerRegistry::new()),
                appearances: Arc::new(AppearanceCache::new()),
                clock: SenderClock::new(),
                local: watch::Sender::new(None),
                appearance: watch::Sender::new(None),
                outgoing_world: Mutex::new(WorldPayload::default()),
                incoming_world: Mutex::new(WorldPayload::default()),
                assigned_id: Mutex::new(None),
                time_scale_bits: AtomicU32::new(1.0f32.to_bits()),
                status: Mutex::new(Status::Idle),
                failure: Mutex::new(None),
                events,
            }),
            tracker: TaskTracker::new(),
            fatal: Arc::new(FatalSlot::new()),
            attempt: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Local player input
    // -------------------------------------------------------------------------

    /// Replace the local player's snapshot. The first tick waits for this.
    pub fn set_local(&self, metadata: PlayerMetadata) {
        self.shared.local.send_replace(Some(metadata));
    }

    /// Modify the local snapshot in place, if one exists.
    pub fn update_local(&self, f: impl FnOnce(&mut PlayerMetadata)) {
        self.shared.local.send_if_modified(|slot| match slot {
            Some(metadata) => {
                f(metadata);
                true
            }
            None => false,
        });
    }

    /// Set the local appearance. Sent on the next tick only if it changed.
    pub fn set_appearance(&self, appearance: PlayerAppearance) {
        self.shared.appearance.send_if_modified(|slot| {
            if slot.as_ref() == Some(&appearance) {
                return false;
            }
            *slot = Some(appearance);
            true
        });
    }

    /// Queue a level-state snapshot for the next tick.
    pub fn set_level_state(&self, state: ActiveLevelState) {
        self.shared
            .outgoing_world
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .level_state = Some(state);
    }

    /// Queue a save-data update for the next tick.
    pub fn queue_save_update(&self, update: SaveDataUpdate) {
        self.shared
            .outgoing_world
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .save_update = Some(update);
    }

    /// Take the latest world-state payload received from the server.
    pub fn take_world_update(&self) -> WorldPayload {
        std::mem::take(&mut *self.shared.incoming_world.lock().unwrap_or_else(PoisonError::into_inner))
    }

    // -------------------------------------------------------------------------
    // Read surface
    // -------------------------------------------------------------------------

    /// Remote players, excluding ourselves.
    pub fn registry(&self) -> &Arc<PlayerRegistry> {
        &self.shared.registry
    }

    /// Remote appearances.
    pub fn appearances(&self) -> &Arc<AppearanceCache> {
        &self.shared.appearances
    }

    /// Id the server assigned on the current connection.
    pub fn assigned_id(&self) -> Option<PlayerId> {
        self.shared.connected_id()
    }

    /// World time scale from the last server tick.
    pub fn time_scale(&self) -> f32 {
        f32::from_bits(self.shared.time_scale_bits.load(Ordering::Relaxed))
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Status line for display.
    pub fn status(&self) -> String {
        self.shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .to_string()
    }

    /// Derived connection state.
    pub fn state(&self) -> ConnectionState {
        let alive = self
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|a| !a.handle.is_finished());
        match (alive, self.shared.connected_id()) {
            (false, _) => ConnectionState::Disconnected,
            (true, None) => ConnectionState::Connecting,
            (true, Some(_)) => ConnectionState::Connected,
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start connecting to `endpoint` in the background.
    ///
    /// Must be called from within a Tokio runtime. Refuses while a previous
    /// attempt is still alive.
    pub fn connect(&self, endpoint: SocketAddr) -> Result<(), ClientError> {
        let mut slot = self.attempt.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|a| !a.handle.is_finished()) {
            return Err(ClientError::AlreadyConnected);
        }

        *self.shared.failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.shared.set_connected_id(None);
        self.shared.set_status(Status::Connecting(endpoint));
        info!("Connecting to {}", endpoint);

        let cancel = CancellationToken::new();
        let shared = self.shared.clone();
        let token = cancel.clone();
        let handle = spawn_supervised(&self.tracker, "client", self.fatal.clone(), async move {
            if let Err(e) = run(&shared, endpoint, &token).await {
                warn!("Connection to {} failed: {}", endpoint, e);
                shared.set_status(Status::Failed(e.to_string()));
                shared.emit(ClientEvent::Fatal { error: e.to_string() });
                *shared.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
            }
            shared.set_connected_id(None);
            Ok::<(), ClientError>(())
        });

        *slot = Some(Attempt { cancel, handle });
        Ok(())
    }

    /// Leave gracefully: signal the task, give it the grace period to send
    /// its disconnecting tick, then abort it.
    pub async fn disconnect(&self) {
        let attempt = self.attempt.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut attempt) = attempt else {
            return;
        };

        attempt.cancel.cancel();
        if timeout(self.shared.config.disconnect_grace, &mut attempt.handle).await.is_err() {
            warn!("Connection task did not stop in time, aborting");
            attempt.handle.abort();
        }

        self.shared.set_connected_id(None);
        self.shared.forget_remote();
        self.shared.set_status(Status::Idle);
        self.shared.emit(ClientEvent::Disconnected);
        info!("Disconnected");
    }

    /// Re-raise a failure of the connection task, once.
    pub fn poll(&self) -> Result<(), ClientError> {
        if let Some(e) = self.shared.failure.lock().unwrap_or_else(PoisonError::into_inner).take() {
            return Err(e);
        }
        match self.fatal.take() {
            Some(message) => Err(ClientError::Fatal(message)),
            None => Ok(()),
        }
    }
}

// =============================================================================
// CONNECTION TASK
// =============================================================================

#[derive(Default)]
struct Retry {
    handshaken_once: bool,
    failing_since: Option<Instant>,
}

async fn run(shared: &ClientShared, endpoint: SocketAddr, cancel: &CancellationToken) -> Result<(), ClientError> {
    let mut retry = Retry::default();
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let err = match connection(shared, endpoint, cancel, &mut retry).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        shared.set_connected_id(None);

        if err.is_incompatible() {
            return Err(ClientError::IncompatibleVersion(err.to_string()));
        }
        if !retry.handshaken_once {
            return Err(ClientError::ConnectFailed(err.to_string()));
        }

        let since = *retry.failing_since.get_or_insert_with(Instant::now);
        let waited = since.elapsed();
        if waited >= shared.config.reconnect_timeout {
            return Err(ClientError::ReconnectTimeout {
                waited,
                last_error: err.to_string(),
            });
        }

        debug!("Reconnecting to {} after: {}", endpoint, err);
        shared.set_status(Status::Reconnecting(err.to_string()));
        shared.emit(ClientEvent::Reconnecting { error: err.to_string() });

        tokio::select! {
            _ = sleep(shared.config.reconnect_delay) => {}
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

/// One connection from open to close. `Ok` means cancelled on request.
async fn connection(
    shared: &ClientShared,
    endpoint: SocketAddr,
    cancel: &CancellationToken,
    retry: &mut Retry,
) -> Result<(), ClientError> {
    let config = &shared.config;
    let open = async { TcpStream::connect(endpoint).await.map_err(ProtocolError::from) };
    let stream = match guarded(cancel, config.connect_timeout, open).await? {
        Some(stream) => stream,
        None => return Ok(()),
    };
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // The collaborator must have provided a snapshot before the first tick.
    let mut local_rx = shared.local.subscribe();
    let ready = async { local_rx.wait_for(Option::is_some).await.is_ok() };
    tokio::select! {
        ok = ready => {
            if !ok {
                return Ok(());
            }
        }
        _ = cancel.cancelled() => return Ok(()),
    }

    let mut link = Link {
        shared,
        appearance_rx: shared.appearance.subscribe(),
        requests: AppearanceRequests::new(),
        pending_requests: Vec::new(),
        own_id: None,
    };

    // Handshake: our first tick, always carrying the appearance.
    let hello = link.build_tick(true, false);
    guarded(cancel, config.overdue_timeout, write_frame(&mut writer, &Packet::ClientTick(hello))).await?;

    let mut first = true;
    loop {
        let packet = match guarded(cancel, config.overdue_timeout, read_frame(&mut reader)).await? {
            Some(packet) => packet,
            None => {
                link.leave(&mut writer).await;
                return Ok(());
            }
        };
        let tick = match packet {
            Packet::ServerTick(tick) => tick,
            Packet::Notice(notice) => {
                debug!("Server notice: {:?}", notice);
                continue;
            }
            _ => return Err(ProtocolError::Unexpected { expected: "server tick" }.into()),
        };

        if first {
            first = false;
            retry.handshaken_once = true;
            retry.failing_since = None;
            shared.set_connected_id(Some(tick.your_id));
            shared.set_status(Status::Connected(tick.your_id));
            shared.emit(ClientEvent::Connected { id: tick.your_id });
            info!("Connected to {} as {}", endpoint, tick.your_id.short());
        }

        let resend = tick.resend_appearance;
        link.apply(tick);

        let out = link.build_tick(resend, false);
        guarded(cancel, config.overdue_timeout, write_frame(&mut writer, &Packet::ClientTick(out))).await?;
    }
}

/// Per-connection client state.
struct Link<'a> {
    shared: &'a ClientShared,
    appearance_rx: watch::Receiver<Option<PlayerAppearance>>,
    requests: AppearanceRequests,
    pending_requests: Vec<PlayerId>,
    own_id: Option<PlayerId>,
}

impl Link<'_> {
    fn build_tick(&mut self, force_appearance: bool, disconnecting: bool) -> ClientTick {
        let mut player = self
            .shared
            .local
            .borrow()
            .clone()
            .unwrap_or_else(|| PlayerMetadata::new(PlayerId::default(), ""));
        if let Some(id) = self.own_id {
            player.id = id;
        }
        player.last_update_timestamp = self.shared.clock.now();

        let changed = self.appearance_rx.has_changed().unwrap_or(false);
        let appearance = if force_appearance || changed {
            self.appearance_rx.borrow_and_update().clone().map(|mut a| {
                a.id = player.id;
                a
            })
        } else {
            None
        };

        let world = if self.shared.config.world_sync {
            std::mem::take(&mut *self.shared.outgoing_world.lock().unwrap_or_else(PoisonError::into_inner))
        } else {
            WorldPayload::default()
        };

        ClientTick {
            player,
            appearance,
            requested_appearances: std::mem::take(&mut self.pending_requests),
            world,
            disconnecting,
        }
    }

    fn apply(&mut self, tick: ServerTick) {
        let shared = self.shared;
        let now = Instant::now();
        self.own_id = Some(tick.your_id);

        let gone: HashSet<PlayerId> = tick.disconnected.iter().copied().collect();
        for id in &gone {
            shared.registry.remove(id);
        }

        let mut live = Vec::with_capacity(tick.players.len());
        for player in tick.players {
            if player.id == tick.your_id || gone.contains(&player.id) {
                continue;
            }
            live.push(player.id);
            shared.registry.apply(player, EndpointSource::Declared, now);
        }

        // The server snapshot is complete; anything missing from it is gone.
        let present: HashSet<PlayerId> = live.iter().copied().collect();
        for id in shared.registry.ids() {
            if !present.contains(&id) {
                shared.registry.remove(&id);
            }
        }

        for appearance in tick.appearances {
            if appearance.id != tick.your_id && present.contains(&appearance.id) {
                shared.appearances.store(appearance, now);
            }
        }
        shared.appearances.retain_live(&live, None);

        shared.time_scale_bits.store(tick.time_scale.to_bits(), Ordering::Relaxed);
        if shared.config.world_sync && !tick.world.is_empty() {
            let mut incoming = shared.incoming_world.lock().unwrap_or_else(PoisonError::into_inner);
            if tick.world.level_state.is_some() {
                incoming.level_state = tick.world.level_state;
            }
            if tick.world.save_update.is_some() {
                incoming.save_update = tick.world.save_update;
            }
        }

        self.pending_requests = self.requests.next_requests(&live, &shared.appearances);
    }

    /// Best-effort graceful leave.
    async fn leave<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) {
        let bye = self.build_tick(false, true);
        let limit = Duration::from_millis(250);
        match timeout(limit, write_frame(writer, &Packet::ClientTick(bye))).await {
            Ok(Ok(())) => debug!("Sent disconnecting tick"),
            Ok(Err(e)) => debug!("Disconnecting tick failed: {}", e),
            Err(_) => debug!("Disconnecting tick timed out"),
        }
        let _ = writer.shutdown().await;
    }
}

/// Run a transport operation bounded by `limit`. `None` means cancelled.
async fn guarded<T, F>(cancel: &CancellationToken, limit: Duration, op: F) -> Result<Option<T>, ClientError>
where
    F: std::future::Future<Output = Result<T, ProtocolError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Ok(None),
        result = timeout(limit, op) => match result {
            Ok(inner) => Ok(Some(inner?)),
            Err(_) => Err(ClientError::TimedOut),
        },
    }
}
