//! Integration tests for the dedicated server and connection engine
//!
//! Real loopback sockets, short tick intervals.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};

use presence_sync::{
    ClientConfig, ClientError, ConnectionEngine, ConnectionState, PlayerAppearance, PlayerId, PlayerMetadata,
    PresenceServer, ServerConfig,
};

fn server_config() -> ServerConfig {
    ServerConfig {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        bind_retry_count: 0,
        tick_interval: Duration::from_millis(10),
        shutdown_grace: Duration::from_millis(300),
        ..Default::default()
    }
}

fn client_config() -> ClientConfig {
    ClientConfig {
        connect_timeout: Duration::from_secs(1),
        reconnect_delay: Duration::from_millis(50),
        disconnect_grace: Duration::from_millis(500),
        ..Default::default()
    }
}

async fn start_server(config: ServerConfig) -> (PresenceServer, SocketAddr) {
    let server = PresenceServer::new(config);
    let addr = server.start().await.expect("server starts");
    (server, addr)
}

fn client(name: &str, descriptor: &str) -> (ConnectionEngine, PlayerId) {
    let engine = ConnectionEngine::new(client_config());
    let claimed = PlayerId::new_v4();
    engine.set_local(PlayerMetadata::new(claimed, name));
    engine.set_appearance(PlayerAppearance::new(claimed, name, descriptor));
    (engine, claimed)
}

/// Poll `check` until it holds or five seconds pass.
async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// HANDSHAKE AND IDENTITY
mod handshake_tests {
    use super::*;

    /// The server ignores the claimed id and keys the registry by its own
    #[tokio::test]
    async fn test_server_assigns_identity() {
        let (server, addr) = start_server(server_config()).await;
        let (engine, claimed) = client("alice", "red-cloak");
        engine.connect(addr).unwrap();

        wait_until("connected", || async { engine.state() == ConnectionState::Connected }).await;
        let assigned = engine.assigned_id().unwrap();
        assert_ne!(assigned, claimed);

        wait_until("registered", || async { server.registry().contains(&assigned) }).await;
        assert!(!server.registry().contains(&claimed));
        let record = server.registry().get(&assigned).unwrap();
        assert_eq!(record.name, "alice");
        assert_eq!(record.endpoint.map(|e| e.ip()), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));

        wait_until("appearance stored", || async { server.appearances().contains(&assigned) }).await;
        assert_eq!(server.connection_count(), 1);

        engine.disconnect().await;
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert!(engine.poll().is_ok());
        server.shutdown().await;
    }

    /// A server can be started again after shutdown and accepts clients
    #[tokio::test]
    async fn test_restart_after_shutdown() {
        let (server, first_addr) = start_server(server_config()).await;
        server.shutdown().await;
        assert!(!server.is_running());
        assert!(TcpStream::connect(first_addr).await.is_err());

        let addr = server.start().await.expect("server restarts");
        assert!(server.is_running());
        let (engine, _) = client("alice", "red-cloak");
        engine.connect(addr).unwrap();

        wait_until("connected", || async { engine.state() == ConnectionState::Connected }).await;
        let assigned = engine.assigned_id().unwrap();
        wait_until("registered", || async { server.registry().contains(&assigned) }).await;
        assert_eq!(server.connection_count(), 1);
        assert!(engine.poll().is_ok());

        engine.disconnect().await;
        server.shutdown().await;
        assert_eq!(server.connection_count(), 0);
    }

    /// A connection that never sends a valid first tick is never registered
    #[tokio::test]
    async fn test_no_registration_without_handshake() {
        let (server, addr) = start_server(server_config()).await;

        let _silent = TcpStream::connect(addr).await.unwrap();
        let mut garbage = TcpStream::connect(addr).await.unwrap();
        garbage.write_all(&[5, 0, 0, 0, b'H', b'E', b'L', b'L', b'O']).await.unwrap();
        garbage.flush().await.unwrap();

        sleep(Duration::from_millis(300)).await;
        assert!(server.registry().is_empty());
        assert_eq!(server.connection_count(), 0);
        assert!(server.disconnected().is_empty());

        server.shutdown().await;
    }

    /// Connecting to nothing fails without retrying
    #[tokio::test]
    async fn test_refused_connection_is_fatal() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let (engine, _) = client("alice", "red-cloak");
        engine.connect(addr).unwrap();

        wait_until("task finished", || async { engine.state() == ConnectionState::Disconnected }).await;
        assert!(matches!(engine.poll(), Err(ClientError::ConnectFailed(_))));
        assert!(engine.poll().is_ok());
    }
}

/// PRESENCE EXCHANGE
mod exchange_tests {
    use super::*;

    /// Two clients see each other's metadata and appearance
    #[tokio::test]
    async fn test_two_clients_see_each_other() {
        let (server, addr) = start_server(server_config()).await;
        let (alice, _) = client("alice", "red-cloak");
        let (bob, _) = client("bob", "blue-hat");
        alice.connect(addr).unwrap();
        bob.connect(addr).unwrap();

        wait_until("both connected", || async {
            alice.assigned_id().is_some() && bob.assigned_id().is_some()
        })
        .await;
        let alice_id = alice.assigned_id().unwrap();
        let bob_id = bob.assigned_id().unwrap();

        wait_until("bob sees alice", || async { bob.registry().contains(&alice_id) }).await;
        wait_until("alice sees bob", || async { alice.registry().contains(&bob_id) }).await;
        assert_eq!(bob.registry().get(&alice_id).unwrap().name, "alice");
        assert!(!alice.registry().contains(&alice_id));

        wait_until("bob has alice's appearance", || async { bob.appearances().contains(&alice_id) }).await;
        assert_eq!(bob.appearances().get(&alice_id).unwrap().descriptor, "red-cloak");
        wait_until("alice has bob's appearance", || async { alice.appearances().contains(&bob_id) }).await;
        assert_eq!(alice.appearances().get(&bob_id).unwrap().descriptor, "blue-hat");

        alice.update_local(|m| m.position = [1.0, 2.0, 3.0]);
        wait_until("position propagates", || async {
            bob.registry().get(&alice_id).is_some_and(|m| m.position == [1.0, 2.0, 3.0])
        })
        .await;

        // A graceful leave removes alice from bob's view promptly.
        alice.disconnect().await;
        wait_until("alice gone", || async { !bob.registry().contains(&alice_id) }).await;
        assert!(server.disconnected().iter().any(|(id, _)| *id == alice_id));

        bob.disconnect().await;
        server.shutdown().await;
    }

    /// Time scale changes reach connected clients
    #[tokio::test]
    async fn test_time_scale_broadcast() {
        let (server, addr) = start_server(server_config()).await;
        let (engine, _) = client("alice", "red-cloak");
        engine.connect(addr).unwrap();
        wait_until("connected", || async { engine.state() == ConnectionState::Connected }).await;

        server.set_time_scale(0.25);
        wait_until("scale applied", || async { engine.time_scale() == 0.25 }).await;

        engine.disconnect().await;
        server.shutdown().await;
    }

    /// A live session evicted by the sweep comes back on its next tick
    #[tokio::test]
    async fn test_evicted_live_session_is_restored() {
        let (server, addr) = start_server(server_config()).await;
        let (alice, _) = client("alice", "red-cloak");
        let (bob, _) = client("bob", "blue-hat");
        alice.connect(addr).unwrap();
        bob.connect(addr).unwrap();

        wait_until("alice assigned", || async { alice.assigned_id().is_some() }).await;
        let alice_id = alice.assigned_id().unwrap();
        wait_until("bob sees alice", || async { bob.registry().contains(&alice_id) }).await;

        // Same effect as a sweep that caught alice between ticks.
        server.registry().remove(&alice_id);
        server.registry().mark_disconnected(alice_id, std::time::Instant::now());

        wait_until("server restores alice", || async {
            server.registry().contains(&alice_id) && !server.registry().is_disconnected(&alice_id)
        })
        .await;
        sleep(Duration::from_millis(200)).await;
        assert!(!server.registry().is_disconnected(&alice_id));
        assert!(bob.registry().contains(&alice_id));

        alice.disconnect().await;
        bob.disconnect().await;
        server.shutdown().await;
    }
}

/// OPERATOR CONTROLS
mod admin_tests {
    use super::*;

    /// A blocked address is turned away before the handshake
    #[tokio::test]
    async fn test_block_list_rejects_before_handshake() {
        let (server, addr) = start_server(ServerConfig {
            block_list: "127.0.0.1".into(),
            ..server_config()
        })
        .await;
        let (engine, _) = client("mallory", "black-mask");
        engine.connect(addr).unwrap();

        wait_until("task finished", || async { engine.state() == ConnectionState::Disconnected }).await;
        assert!(matches!(engine.poll(), Err(ClientError::ConnectFailed(_))));
        assert!(server.registry().is_empty());
        assert_eq!(server.connection_count(), 0);

        server.shutdown().await;
    }

    /// Kicking closes the session and records the disconnect
    #[tokio::test]
    async fn test_kick_moves_player_to_disconnected() {
        let (server, addr) = start_server(server_config()).await;
        let (engine, _) = client("alice", "red-cloak");
        engine.connect(addr).unwrap();

        wait_until("registered", || async { server.connection_count() == 1 }).await;
        let first_id = server.sessions()[0].id;

        let kicked = server.kick(&first_id).unwrap();
        assert_eq!(kicked.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        wait_until("recorded as disconnected", || async {
            server.disconnected().iter().any(|(id, _)| *id == first_id)
        })
        .await;
        assert!(!server.registry().contains(&first_id));

        // The client was live before, so it reconnects under a fresh id.
        wait_until("reconnected", || async {
            engine.assigned_id().is_some_and(|id| id != first_id)
        })
        .await;

        engine.disconnect().await;
        server.shutdown().await;
    }

    /// Banning an address closes its sessions and keeps it out
    #[tokio::test]
    async fn test_ban_address_closes_and_blocks() {
        let (server, addr) = start_server(server_config()).await;
        let (engine, _) = client("alice", "red-cloak");
        engine.connect(addr).unwrap();
        wait_until("registered", || async { server.connection_count() == 1 }).await;

        assert_eq!(server.ban_address(IpAddr::V4(Ipv4Addr::LOCALHOST)), 1);
        wait_until("session closed", || async { server.connection_count() == 0 }).await;
        assert!(!server.filters().admits(&IpAddr::V4(Ipv4Addr::LOCALHOST)));

        sleep(Duration::from_millis(200)).await;
        assert_eq!(server.connection_count(), 0);
        assert!(server.registry().is_empty());

        engine.disconnect().await;
        server.shutdown().await;
    }
}
