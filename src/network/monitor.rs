//! Monitoring Bridge
//!
//! Read-only diagnostics embedded in the server. Plain `GET` on `/players`,
//! `/disconnected` or `/appearances` returns a text table. A WebSocket
//! upgrade on `/players` takes dump names as text messages and pushes the
//! named dump as JSON, again whenever it changes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::appearance::AppearanceCache;
use crate::core::player::{PlayerAppearance, PlayerId, PlayerMetadata};
use crate::core::registry::{Disconnection, PlayerRegistry};

/// A named text dump.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dump {
    /// Live player table.
    Players,
    /// Recently-disconnected list.
    Disconnected,
    /// Cached appearances.
    Appearances,
}

impl Dump {
    /// Parse a dump name (`players`, `disconnected`, `appearances`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().trim_start_matches('/').to_ascii_lowercase().as_str() {
            "players" => Some(Self::Players),
            "disconnected" => Some(Self::Disconnected),
            "appearances" => Some(Self::Appearances),
            _ => None,
        }
    }

    /// Canonical name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Players => "players",
            Self::Disconnected => "disconnected",
            Self::Appearances => "appearances",
        }
    }
}

// =============================================================================
// TABLES
// =============================================================================

/// Player table, one line per player after a header.
pub fn render_players(players: &[PlayerMetadata]) -> Vec<String> {
    let mut sorted: Vec<&PlayerMetadata> = players.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

    let mut lines = vec![format!(
        "{:<8}  {:<16}  {:<16}  {:>26}  {:<8}  {}",
        "id", "name", "level", "position", "action", "endpoint"
    )];
    for p in sorted {
        lines.push(format!(
            "{:<8}  {:<16}  {:<16}  {:>26}  {:<8}  {}",
            p.id.short(),
            p.name,
            p.level.as_deref().unwrap_or("-"),
            format!("{:.1}, {:.1}, {:.1}", p.position[0], p.position[1], p.position[2]),
            format!("{:?}", p.action),
            p.endpoint.map(|e| e.to_string()).unwrap_or_else(|| "-".into()),
        ));
    }
    lines
}

/// Disconnect list with how long ago each peer left.
pub fn render_disconnected(entries: &[(PlayerId, Disconnection)], now: Instant) -> Vec<String> {
    let mut sorted: Vec<&(PlayerId, Disconnection)> = entries.iter().collect();
    sorted.sort_by_key(|(_, d)| d.at);

    let mut lines = vec![format!("{:<8}  {:<25}  {}", "id", "at", "ago")];
    for (id, d) in sorted {
        lines.push(format!(
            "{:<8}  {:<25}  {:.1}s",
            id.short(),
            d.at_utc.format("%Y-%m-%dT%H:%M:%SZ"),
            now.saturating_duration_since(d.at).as_secs_f32()
        ));
    }
    lines
}

/// Appearance list.
pub fn render_appearances(appearances: &[PlayerAppearance]) -> Vec<String> {
    let mut sorted: Vec<&PlayerAppearance> = appearances.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

    let mut lines = vec![format!("{:<8}  {:<16}  {}", "id", "name", "descriptor")];
    for a in sorted {
        lines.push(format!("{:<8}  {:<16}  {}", a.id.short(), a.name, a.descriptor));
    }
    lines
}

// =============================================================================
// BRIDGE
// =============================================================================

#[derive(Serialize)]
struct DumpMessage<'a> {
    request: &'a str,
    lines: &'a [String],
}

/// HTTP/WebSocket responder over the server's read surface.
#[derive(Clone)]
pub struct MonitorBridge {
    registry: Arc<PlayerRegistry>,
    appearances: Arc<AppearanceCache>,
    push_interval: Duration,
}

#[derive(Clone)]
struct BridgeState {
    bridge: MonitorBridge,
    cancel: CancellationToken,
}

impl MonitorBridge {
    /// Create a bridge over the given registry and cache.
    pub fn new(registry: Arc<PlayerRegistry>, appearances: Arc<AppearanceCache>) -> Self {
        Self {
            registry,
            appearances,
            push_interval: Duration::from_secs(1),
        }
    }

    /// Current lines of `dump`.
    pub fn render(&self, dump: Dump) -> Vec<String> {
        match dump {
            Dump::Players => render_players(&self.registry.snapshot()),
            Dump::Disconnected => render_disconnected(&self.registry.disconnected(), Instant::now()),
            Dump::Appearances => render_appearances(&self.appearances.snapshot()),
        }
    }

    /// Routes. WebSocket sessions end when `cancel` fires.
    pub fn router(self, cancel: CancellationToken) -> Router {
        Router::new()
            .route("/players", get(players))
            .route("/disconnected", get(disconnected))
            .route("/appearances", get(appearances))
            .fallback(not_found)
            .with_state(BridgeState { bridge: self, cancel })
    }

    /// Serve on `listener` until `cancel` fires, then drain open requests.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> std::io::Result<()> {
        let app = self.router(cancel.clone());
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;
        debug!("Monitor stopped");
        Ok(())
    }

    fn text(&self, dump: Dump) -> String {
        let mut body = self.render(dump).join("\n");
        body.push('\n');
        body
    }

    async fn websocket(self, socket: WebSocket, cancel: CancellationToken) {
        info!("Monitor WebSocket opened");
        let (mut sink, mut source) = socket.split();

        let mut subscription: Option<(Dump, Vec<String>)> = None;
        let mut ticker = interval(self.push_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let outgoing = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = source.next() => match msg {
                    Some(Ok(Message::Text(name))) => match Dump::from_name(name.as_str()) {
                        Some(dump) => {
                            let lines = self.render(dump);
                            let text = dump_json(dump.name(), &lines);
                            subscription = Some((dump, lines));
                            Some(text)
                        }
                        None => Some(dump_json(name.as_str().trim(), &["unknown request".to_string()])),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => None,
                    Some(Err(e)) => {
                        debug!("Monitor WebSocket error: {}", e);
                        break;
                    }
                },
                _ = ticker.tick() => match subscription.as_mut() {
                    Some((dump, last)) => {
                        let lines = self.render(*dump);
                        if lines != *last {
                            let text = dump_json(dump.name(), &lines);
                            *last = lines;
                            Some(text)
                        } else {
                            None
                        }
                    }
                    None => None,
                },
            };

            if let Some(text) = outgoing {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
        let _ = sink.close().await;
        debug!("Monitor WebSocket closed");
    }
}

async fn players(
    State(state): State<BridgeState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(ws) => {
            let BridgeState { bridge, cancel } = state;
            ws.on_upgrade(move |socket| bridge.websocket(socket, cancel))
        }
        Err(_) => state.bridge.text(Dump::Players).into_response(),
    }
}

async fn disconnected(State(state): State<BridgeState>) -> String {
    state.bridge.text(Dump::Disconnected)
}

async fn appearances(State(state): State<BridgeState>) -> String {
    state.bridge.text(Dump::Appearances)
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found\n")
}

fn dump_json(request: &str, lines: &[String]) -> String {
    serde_json::to_string(&DumpMessage { request, lines }).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::EndpointSource;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn bridge_with_player() -> (MonitorBridge, PlayerId) {
        let registry = Arc::new(PlayerRegistry::new());
        let appearances = Arc::new(AppearanceCache::new());
        let id = PlayerId::new_v4();
        let mut p = PlayerMetadata::new(id, "Theo");
        p.last_update_timestamp = 1;
        p.level = Some("resort".into());
        registry.apply(p, EndpointSource::Observed("10.1.2.3:5000".parse().unwrap()), Instant::now());
        appearances.store(PlayerAppearance::new(id, "Theo", "beanie"), Instant::now());
        (MonitorBridge::new(registry, appearances), id)
    }

    #[test]
    fn test_dump_names() {
        assert_eq!(Dump::from_name("/players"), Some(Dump::Players));
        assert_eq!(Dump::from_name("Appearances"), Some(Dump::Appearances));
        assert_eq!(Dump::from_name("/favicon.ico"), None);
    }

    #[test]
    fn test_render_tables() {
        let (bridge, id) = bridge_with_player();
        let players = bridge.render(Dump::Players);
        assert_eq!(players.len(), 2);
        assert!(players[1].contains(&id.short()));
        assert!(players[1].contains("resort"));
        assert!(players[1].contains("10.1.2.3:5000"));

        let apps = bridge.render(Dump::Appearances);
        assert!(apps[1].contains("beanie"));

        bridge.registry.mark_disconnected(id, Instant::now());
        let gone = bridge.render(Dump::Disconnected);
        assert_eq!(gone.len(), 2);
        assert!(gone[1].starts_with(&id.short()));
    }

    async fn spawn_bridge(bridge: MonitorBridge) -> (SocketAddr, CancellationToken, JoinHandle<std::io::Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(bridge.serve(listener, cancel.clone()));
        (addr, cancel, task)
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_http_dumps() {
        let (bridge, _) = bridge_with_player();
        let (addr, cancel, task) = spawn_bridge(bridge).await;

        let players = http_get(addr, "/players").await;
        assert!(players.starts_with("HTTP/1.1 200 OK"));
        assert!(players.contains("text/plain"));
        assert!(players.contains("Theo"));

        let appearances = http_get(addr, "/appearances").await;
        assert!(appearances.contains("beanie"));

        let missing = http_get(addr, "/nope").await;
        assert!(missing.starts_with("HTTP/1.1 404"));

        cancel.cancel();
        let stopped = tokio::time::timeout(Duration::from_secs(2), task).await;
        assert!(matches!(stopped, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_websocket_push() {
        let (bridge, _) = bridge_with_player();
        let registry = bridge.registry.clone();
        let bridge = MonitorBridge {
            push_interval: Duration::from_millis(20),
            ..bridge
        };
        let (addr, cancel, task) = spawn_bridge(bridge).await;

        let url = format!("ws://{}/players", addr);
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws.send(WsMessage::Text("players".into())).await.unwrap();

        let first = match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(t) => t,
            other => panic!("unexpected {:?}", other),
        };
        let value: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(value["request"], "players");
        assert_eq!(value["lines"].as_array().unwrap().len(), 2);

        let mut newcomer = PlayerMetadata::new(PlayerId::new_v4(), "Granny");
        newcomer.last_update_timestamp = 1;
        registry.apply(newcomer, EndpointSource::Declared, Instant::now());

        let pushed = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(pushed.to_text().unwrap()).unwrap();
        assert_eq!(value["lines"].as_array().unwrap().len(), 3);

        // Cancelling ends the push session as well as the listener.
        cancel.cancel();
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        assert!(tokio::time::timeout(Duration::from_secs(2), task).await.is_ok());
    }
}
