//! Player Data Model
//!
//! Per-peer presence records, appearance records and the opaque world-state
//! payloads that ride along with ticks.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Maximum display name length in characters.
pub const MAX_NAME_CHARS: usize = 32;

/// Maximum appearance descriptor length in bytes.
pub const MAX_APPEARANCE_BYTES: usize = 1024;

// =============================================================================
// PLAYER ID
// =============================================================================

/// Unique peer identifier (UUID).
///
/// Implements Ord so tables and dumps can be listed in a stable order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct PlayerId(pub uuid::Uuid);

impl PlayerId {
    /// Generate a fresh random identifier.
    pub fn new_v4() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Create from raw RFC 4122 bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    /// Parse from the hyphenated or simple UUID form.
    pub fn parse(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s.trim()).ok().map(Self)
    }

    /// Raw RFC 4122 bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// First eight hex digits, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.as_bytes()[..4])
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// =============================================================================
// PRESENCE ENUMS
// =============================================================================

/// What the avatar is currently doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum Action {
    /// Standing still.
    #[default]
    Idle = 0,
    /// Walking.
    Walk = 1,
    /// Running.
    Run = 2,
    /// Jumping (rising).
    Jump = 3,
    /// Falling.
    Fall = 4,
    /// Climbing a wall or ladder.
    Climb = 5,
    /// Swimming.
    Swim = 6,
    /// Dashing.
    Dash = 7,
    /// Sitting or resting.
    Sit = 8,
    /// Taking damage.
    Hurt = 9,
}

impl Action {
    /// Decode from a wire byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Idle,
            1 => Self::Walk,
            2 => Self::Run,
            3 => Self::Jump,
            4 => Self::Fall,
            5 => Self::Climb,
            6 => Self::Swim,
            7 => Self::Dash,
            8 => Self::Sit,
            9 => Self::Hurt,
            _ => return None,
        })
    }
}

/// Horizontal facing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum Facing {
    /// No horizontal facing (e.g. looking at the camera).
    #[default]
    None = 0,
    /// Facing left.
    Left = 1,
    /// Facing right.
    Right = 2,
}

impl Facing {
    /// Decode from a wire byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::None,
            1 => Self::Left,
            2 => Self::Right,
            _ => return None,
        })
    }
}

/// Camera viewpoint the peer is rendering from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum Viewpoint {
    /// Orthographic, looking along the depth axis.
    #[default]
    Front = 0,
    /// Orthographic, rotated a quarter turn right.
    Right = 1,
    /// Orthographic, rotated a half turn.
    Back = 2,
    /// Orthographic, rotated a quarter turn left.
    Left = 3,
    /// Perspective camera.
    Perspective = 4,
}

impl Viewpoint {
    /// Decode from a wire byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Front,
            1 => Self::Right,
            2 => Self::Back,
            3 => Self::Left,
            4 => Self::Perspective,
            _ => return None,
        })
    }
}

// =============================================================================
// SENDER CLOCK
// =============================================================================

/// Monotonic millisecond clock for `last_update_timestamp`.
///
/// Wall-clock based, but never returns the same value twice, so two ticks
/// produced within one millisecond still compare strictly.
#[derive(Debug, Default)]
pub struct SenderClock {
    last: AtomicI64,
}

impl SenderClock {
    /// Create a new clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp, strictly greater than every previous one.
    pub fn now(&self) -> i64 {
        let wall = chrono::Utc::now().timestamp_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

// =============================================================================
// PLAYER METADATA
// =============================================================================

/// One known peer's presence record.
#[derive(Clone, Debug, PartialEq)]
pub struct PlayerMetadata {
    /// Peer identity.
    pub id: PlayerId,
    /// Display name (at most `MAX_NAME_CHARS`).
    pub name: String,
    /// Current level/map name, `None` until first reported.
    pub level: Option<String>,
    /// World position.
    pub position: [f32; 3],
    /// Current action.
    pub action: Action,
    /// Animation frame index.
    pub frame: u16,
    /// Horizontal facing.
    pub facing: Facing,
    /// Camera viewpoint.
    pub viewpoint: Viewpoint,
    /// Sender's own clock at the time of the update. Only compared against
    /// earlier updates from the same sender.
    pub last_update_timestamp: i64,
    /// Receiver's clock when this record was applied. Used only for eviction.
    pub last_update_local: Instant,
    /// Best-known return address.
    pub endpoint: Option<SocketAddr>,
}

impl PlayerMetadata {
    /// Create an empty record for `id`.
    pub fn new(id: PlayerId, name: impl Into<String>) -> Self {
        let mut meta = Self {
            id,
            name: String::new(),
            level: None,
            position: [0.0; 3],
            action: Action::Idle,
            frame: 0,
            facing: Facing::None,
            viewpoint: Viewpoint::Front,
            last_update_timestamp: 0,
            last_update_local: Instant::now(),
            endpoint: None,
        };
        meta.set_name(name);
        meta
    }

    /// Set the display name, truncated to `MAX_NAME_CHARS`.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = truncate_chars(name.into(), MAX_NAME_CHARS);
    }

    /// Field-for-field equality ignoring the receiver-local timestamp.
    pub fn same_presence(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.level == other.level
            && self.position == other.position
            && self.action == other.action
            && self.frame == other.frame
            && self.facing == other.facing
            && self.viewpoint == other.viewpoint
            && self.last_update_timestamp == other.last_update_timestamp
            && self.endpoint == other.endpoint
    }
}

/// Truncate a string to at most `max` characters.
pub fn truncate_chars(mut s: String, max: usize) -> String {
    let keep = prefix_chars(&s, max).len();
    s.truncate(keep);
    s
}

/// Longest prefix of `s` with at most `max` characters.
pub fn prefix_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Longest prefix of `s` within `max` bytes that ends on a character boundary.
pub fn prefix_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

// =============================================================================
// APPEARANCE
// =============================================================================

/// A peer's cosmetic appearance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerAppearance {
    /// Owning identity.
    pub id: PlayerId,
    /// Display name at the time the appearance was sent.
    pub name: String,
    /// Opaque cosmetic descriptor.
    pub descriptor: String,
}

impl PlayerAppearance {
    /// Create an appearance record, truncating oversize fields.
    pub fn new(id: PlayerId, name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        let mut descriptor: String = descriptor.into();
        let keep = prefix_bytes(&descriptor, MAX_APPEARANCE_BYTES).len();
        descriptor.truncate(keep);
        Self {
            id,
            name: truncate_chars(name.into(), MAX_NAME_CHARS),
            descriptor,
        }
    }
}

// =============================================================================
// WORLD STATE PAYLOADS
// =============================================================================

/// Opaque active-level state. Contents belong to the save-data subsystem.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ActiveLevelState(pub Vec<u8>);

/// Opaque save-data mutation. Contents belong to the save-data subsystem.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SaveDataUpdate(pub Vec<u8>);

/// World-state payloads carried atomically alongside a tick.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct WorldPayload {
    /// Active level state, if any.
    pub level_state: Option<ActiveLevelState>,
    /// Save-data mutation, if any.
    pub save_update: Option<SaveDataUpdate>,
}

impl WorldPayload {
    /// True when neither payload is present.
    pub fn is_empty(&self) -> bool {
        self.level_state.is_none() && self.save_update.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_truncated() {
        let mut meta = PlayerMetadata::new(PlayerId::new_v4(), "x".repeat(100));
        assert_eq!(meta.name.chars().count(), MAX_NAME_CHARS);

        meta.set_name("ünïcödé-ñame-that-is-way-too-long-for-display");
        assert_eq!(meta.name.chars().count(), MAX_NAME_CHARS);
    }

    #[test]
    fn test_sender_clock_strictly_increasing() {
        let clock = SenderClock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_enum_bytes() {
        for v in 0..=9u8 {
            assert_eq!(Action::from_u8(v).unwrap() as u8, v);
        }
        assert!(Action::from_u8(10).is_none());
        assert_eq!(Facing::from_u8(2), Some(Facing::Right));
        assert!(Facing::from_u8(3).is_none());
        assert_eq!(Viewpoint::from_u8(4), Some(Viewpoint::Perspective));
        assert!(Viewpoint::from_u8(5).is_none());
    }

    #[test]
    fn test_appearance_truncated_on_char_boundary() {
        let descriptor = "é".repeat(MAX_APPEARANCE_BYTES);
        let app = PlayerAppearance::new(PlayerId::new_v4(), "n", descriptor);
        assert!(app.descriptor.len() <= MAX_APPEARANCE_BYTES);
        assert!(app.descriptor.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_player_id_parse() {
        let id = PlayerId::new_v4();
        assert_eq!(PlayerId::parse(&id.to_string()), Some(id));
        assert_eq!(PlayerId::parse("not-a-uuid"), None);
        assert_eq!(id.short().len(), 8);
    }
}
