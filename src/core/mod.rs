//! Core building blocks.
//!
//! Nothing in this module opens a socket. The registry, appearance cache and
//! filters are shared by the server, the client engine and the gossip peer.

pub mod appearance;
pub mod ip_filter;
pub mod player;
pub mod registry;
pub mod timeout;

// Re-export core types
pub use appearance::{AppearanceCache, AppearanceRequests};
pub use ip_filter::{IpAddressRange, IpFilter};
pub use player::{Action, Facing, PlayerAppearance, PlayerId, PlayerMetadata, SenderClock, Viewpoint, WorldPayload};
pub use registry::{ApplyOutcome, EndpointSource, PlayerRegistry};
pub use timeout::{PresenceTimeoutService, TimeoutConfig};
