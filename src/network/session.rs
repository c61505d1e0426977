//! Per-Connection Session Loop
//!
//! One task per accepted connection. Reads the handshake, assigns the peer a
//! server-generated id, then alternates server tick / client tick until the
//! peer leaves, the connection drops, or the session is killed from outside.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::player::{PlayerId, PlayerMetadata};
use crate::core::registry::{ApplyOutcome, EndpointSource};
use crate::network::protocol::{read_frame, write_frame, ClientTick, Packet, ProtocolError, ServerTick};
use crate::network::server::{RunControl, ServerShared};

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Protocol or transport failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Peer sent nothing within the overdue timeout.
    #[error("peer timed out")]
    TimedOut,

    /// Session was force-closed (kick, ban or teardown).
    #[error("session closed")]
    Closed,
}

/// Why a session ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer sent a disconnecting tick.
    Left,
    /// Server is shutting down.
    ServerStopping,
}

/// Externally visible handle on a live session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    /// Server-assigned id.
    pub id: PlayerId,
    /// Remote address.
    pub addr: SocketAddr,
    /// When the handshake completed.
    pub connected_at: DateTime<Utc>,
    kill: CancellationToken,
}

impl SessionHandle {
    /// Force-close this session's transport from outside its loop.
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

// =============================================================================
// SESSION
// =============================================================================

struct Session {
    id: PlayerId,
    addr: SocketAddr,
    shared: Arc<ServerShared>,
    disposing: CancellationToken,
    kill: CancellationToken,
    requested: Vec<PlayerId>,
    world_revision: u64,
}

/// Serve one accepted connection to completion, then clean up after it.
pub(crate) fn serve(
    shared: Arc<ServerShared>,
    run: &RunControl,
    stream: TcpStream,
    addr: SocketAddr,
) -> impl Future<Output = ()> + Send + 'static {
    let disposing = run.disposing.clone();
    let kill = run.force_close.child_token();
    serve_connection(shared, disposing, kill, stream, addr)
}

async fn serve_connection(
    shared: Arc<ServerShared>,
    disposing: CancellationToken,
    kill: CancellationToken,
    stream: TcpStream,
    addr: SocketAddr,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let read_timeout = shared.config.timeouts.overdue;

    // Handshake: nothing is registered until a valid first tick arrives.
    let handshake = guarded(&kill, read_timeout, read_frame(&mut reader)).await;
    let first = match handshake {
        Ok(Packet::ClientTick(tick)) => tick,
        Ok(_) => {
            warn!("Handshake from {} was not a client tick", addr);
            return;
        }
        Err(SessionError::Protocol(e)) if e.is_incompatible() => {
            warn!("Incompatible client at {}: {}", addr, e);
            return;
        }
        Err(e) => {
            debug!("Handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let id = PlayerId::new_v4();
    if first.player.id != id {
        debug!("Client {} claimed id {}, assigned {}", addr, first.player.id.short(), id.short());
    }
    shared.sessions.insert(
        id,
        SessionHandle {
            id,
            addr,
            connected_at: Utc::now(),
            kill: kill.clone(),
        },
    );
    info!("Player {} connected from {}", id.short(), addr);

    let mut session = Session {
        id,
        addr,
        shared: shared.clone(),
        disposing,
        kill,
        requested: Vec::new(),
        world_revision: 0,
    };

    let result = session.run(first, &mut reader, &mut writer).await;
    match &result {
        Ok(SessionEnd::Left) => info!("Player {} left", id.short()),
        Ok(SessionEnd::ServerStopping) => debug!("Session {} stopped for shutdown", id.short()),
        Err(SessionError::Closed) => info!("Session {} force-closed", id.short()),
        Err(SessionError::Protocol(e)) if e.is_incompatible() => {
            warn!("Player {} sent incompatible data: {}", id.short(), e)
        }
        Err(e) => info!("Player {} dropped: {}", id.short(), e),
    }

    let now = Instant::now();
    shared.registry.mark_disconnected(id, now);
    shared.registry.remove(&id);
    shared.appearances.remove(&id);
    shared.sessions.remove(&id);
    let _ = writer.shutdown().await;
}

impl Session {
    async fn run<R, W>(&mut self, first: ClientTick, reader: &mut R, writer: &mut W) -> Result<SessionEnd, SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let read_timeout = self.shared.config.timeouts.overdue;
        let tick_interval = self.shared.config.tick_interval;

        if self.apply(first) {
            return Ok(SessionEnd::Left);
        }

        loop {
            if self.disposing.is_cancelled() {
                return Ok(SessionEnd::ServerStopping);
            }

            let tick = self.build_tick(Instant::now());
            guarded(&self.kill, read_timeout, write_frame(writer, &Packet::ServerTick(tick))).await?;

            match guarded(&self.kill, read_timeout, read_frame(reader)).await? {
                Packet::ClientTick(tick) => {
                    if self.apply(tick) {
                        return Ok(SessionEnd::Left);
                    }
                }
                Packet::Notice(_) => return Ok(SessionEnd::Left),
                _ => return Err(ProtocolError::Unexpected { expected: "client tick" }.into()),
            }

            tokio::select! {
                _ = sleep(tick_interval) => {}
                _ = self.kill.cancelled() => return Err(SessionError::Closed),
            }
        }
    }

    /// Apply one client tick. Returns true if the client is leaving.
    fn apply(&mut self, tick: ClientTick) -> bool {
        let now = Instant::now();
        let ClientTick {
            player,
            appearance,
            requested_appearances,
            world,
            disconnecting,
        } = tick;

        // The claimed id is never used; the assigned one is authoritative.
        let mut record: PlayerMetadata = player;
        record.id = self.id;
        let outcome = self
            .shared
            .registry
            .apply(record, EndpointSource::Observed(self.addr), now);
        if outcome == ApplyOutcome::Stale {
            debug!("Stale tick from {}", self.id.short());
        } else if !disconnecting && self.shared.registry.clear_disconnected(&self.id) {
            // A sweep evicted this session while it was still live.
            debug!("Player {} is back after eviction", self.id.short());
        }

        if let Some(mut appearance) = appearance {
            appearance.id = self.id;
            if self.shared.appearances.store(appearance, now) {
                debug!("Appearance for {} updated", self.id.short());
            }
        }

        self.requested = requested_appearances;

        if self.shared.config.world_sync && !world.is_empty() {
            self.shared.world.publish(world);
        }

        disconnecting
    }

    fn build_tick(&mut self, now: Instant) -> ServerTick {
        let shared = &self.shared;
        let world = if shared.config.world_sync {
            shared.world.since(&mut self.world_revision)
        } else {
            Default::default()
        };
        ServerTick {
            your_id: self.id,
            players: shared.registry.snapshot(),
            appearances: shared
                .appearances
                .view_for(&self.requested, now, shared.config.appearance_recency),
            disconnected: shared.registry.disconnected_ids(),
            resend_appearance: !shared.appearances.contains(&self.id),
            time_scale: shared.time_scale(),
            world,
        }
    }
}

/// Run a transport operation, bounded by `limit` and abortable by `kill`.
async fn guarded<T, F>(kill: &CancellationToken, limit: Duration, op: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, ProtocolError>>,
{
    tokio::select! {
        _ = kill.cancelled() => Err(SessionError::Closed),
        result = timeout(limit, op) => match result {
            Ok(inner) => inner.map_err(SessionError::from),
            Err(_) => Err(SessionError::TimedOut),
        },
    }
}
