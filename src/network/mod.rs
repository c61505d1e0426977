//! Network Layer
//!
//! Wire codec, dedicated server and client, serverless gossip, LAN discovery
//! and the monitoring bridge.

pub mod client;
pub mod discovery;
pub mod monitor;
pub mod protocol;
pub mod server;
pub mod serverless;
pub mod session;
pub mod supervisor;

pub use client::{ClientConfig, ClientError, ClientEvent, ConnectionEngine, ConnectionState};
pub use discovery::{Advertisement, DiscoveryConfig, DiscoveryError, DiscoveryListener};
pub use monitor::MonitorBridge;
pub use protocol::{ClientTick, Notice, Packet, PlayerInfo, ProtocolError, ServerTick};
pub use server::{PresenceServer, ServerConfig, ServerError};
pub use serverless::{ServerlessConfig, ServerlessError, ServerlessPeer};
pub use session::{SessionError, SessionHandle};
