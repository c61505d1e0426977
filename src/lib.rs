//! # Presence Sync
//!
//! Real-time presence and state synchronization for small groups of
//! cooperating peers. Each peer reports its identity, location and
//! animation state; every peer receives the merged state of all others.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      PRESENCE SYNC                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/             - Transport-free building blocks          │
//! │  ├── player.rs     - Identity, metadata, appearance          │
//! │  ├── registry.rs   - Newer-timestamp-wins player registry    │
//! │  ├── appearance.rs - Appearance cache and re-requests        │
//! │  ├── timeout.rs    - Overdue eviction sweep                  │
//! │  └── ip_filter.rs  - Allow/block address ranges              │
//! │                                                              │
//! │  network/          - Everything that touches a socket        │
//! │  ├── protocol.rs   - Versioned byte-exact codec              │
//! │  ├── server.rs     - Dedicated server, accept loop, admin    │
//! │  ├── session.rs    - Per-connection tick loop                │
//! │  ├── client.rs     - Connection engine with reconnect        │
//! │  ├── serverless.rs - UDP gossip peer                         │
//! │  ├── discovery.rs  - LAN multicast advertise/listen          │
//! │  ├── monitor.rs    - HTTP/WebSocket diagnostics              │
//! │  └── supervisor.rs - Background task failure capture         │
//! │                                                              │
//! │  config.rs         - TOML settings file                      │
//! │  console.rs        - Operator commands                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency
//!
//! Every update for one identity is applied only if its sender timestamp is
//! strictly greater than the stored one. Equal timestamps keep the record
//! that arrived first. Peer clocks are never compared with each other, so
//! convergence is per identity and no global order exists.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod console;
pub mod core;
pub mod network;

// Re-export commonly used types
pub use crate::config::{ConfigError, Settings};
pub use crate::core::player::{PlayerAppearance, PlayerId, PlayerMetadata};
pub use crate::core::registry::PlayerRegistry;
pub use crate::network::client::{ClientConfig, ClientError, ClientEvent, ConnectionEngine, ConnectionState};
pub use crate::network::server::{PresenceServer, ServerConfig, ServerError};
pub use crate::network::serverless::{ServerlessConfig, ServerlessPeer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
