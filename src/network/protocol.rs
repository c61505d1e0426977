//! Protocol Messages
//!
//! Byte-exact wire format shared by every build that speaks this protocol.
//!
//! ## Layout
//!
//! ```text
//! message  := signature:str version:str kind:u8 body
//! str      := len:LEB128 utf8[len]
//! uuid     := 16 bytes, RFC 4122 order
//! blob     := len:u32 bytes[len]
//! ```
//!
//! All fixed-width integers and floats are little-endian. Fields are read in
//! exactly the order they are written; nothing is self-describing.
//!
//! On connection-oriented transports every message is wrapped in a 4-byte
//! little-endian length frame (see [`write_frame`]/[`read_frame`]). Datagrams
//! carry one bare message.
//!
//! Any change to the layout must bump [`PROTOCOL_VERSION`]. There is no
//! capability negotiation: mismatched versions never talk.

use std::net::SocketAddr;
use std::time::Instant;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::player::{
    prefix_bytes, prefix_chars, Action, ActiveLevelState, Facing, PlayerAppearance, PlayerId, PlayerMetadata,
    SaveDataUpdate, Viewpoint, WorldPayload, MAX_APPEARANCE_BYTES, MAX_NAME_CHARS,
};

/// Protocol signature. Anything else is some other application's traffic.
pub const PROTOCOL_SIGNATURE: &str = "PSYNC";

/// Protocol version. Opaque; compared for exact equality.
pub const PROTOCOL_VERSION: &str = "1.4.0-r2";

/// Largest framed message accepted on a stream.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// Largest datagram we send or accept.
pub const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

/// Largest string accepted.
pub const MAX_STRING_BYTES: usize = 64 * 1024;

/// Largest list accepted.
pub const MAX_LIST_LEN: usize = 4096;

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Signature missing or wrong.
    #[error("bad protocol signature")]
    BadSignature,

    /// Signature matched but the version did not.
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch {
        /// Our version.
        ours: &'static str,
        /// Peer's version.
        theirs: String,
    },

    /// Ran out of bytes mid-field.
    #[error("message truncated")]
    Truncated,

    /// Unknown message kind tag.
    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    /// Enum byte out of range.
    #[error("invalid {field} value {value}")]
    InvalidEnum {
        /// Field name.
        field: &'static str,
        /// Offending byte.
        value: u8,
    },

    /// String was not UTF-8.
    #[error("invalid utf-8 string")]
    InvalidUtf8,

    /// Length prefix above the accepted limit.
    #[error("length {0} exceeds limit")]
    TooLong(usize),

    /// Bytes left over after the message.
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),

    /// Stream frame above [`MAX_FRAME_BYTES`].
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    /// Well-formed message of the wrong kind for this point in the exchange.
    #[error("unexpected message, expected {expected}")]
    Unexpected {
        /// Kind that was expected.
        expected: &'static str,
    },

    /// Transport error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Signature or version mismatch: the other end is not speaking our
    /// protocol. Dropped silently on datagrams, fatal on streams.
    pub fn is_incompatible(&self) -> bool {
        matches!(self, Self::BadSignature | Self::VersionMismatch { .. })
    }
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Message kind tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Serverless gossip datagram.
    PlayerInfo = 1,
    /// Client to server tick.
    ClientTick = 2,
    /// Server to client tick.
    ServerTick = 3,
    /// Out-of-band notice.
    Notice = 4,
}

/// Serverless gossip: the sender's own record plus relayed peers.
#[derive(Clone, Debug, PartialEq)]
pub struct PlayerInfo {
    /// The sender's own record.
    pub sender: PlayerMetadata,
    /// Other peers the sender knows about.
    pub relayed: Vec<PlayerMetadata>,
}

/// Client to server tick. The first one is the handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientTick {
    /// The client's own record. Its `id` is a claim the server ignores.
    pub player: PlayerMetadata,
    /// The client's appearance, sent only when requested or changed.
    pub appearance: Option<PlayerAppearance>,
    /// Ids whose appearance the client still lacks.
    pub requested_appearances: Vec<PlayerId>,
    /// Optional world-state payload.
    pub world: WorldPayload,
    /// Graceful leave; the server ends the session after this tick.
    pub disconnecting: bool,
}

/// Server to client tick.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerTick {
    /// Id the server assigned to the receiving client.
    pub your_id: PlayerId,
    /// Every known peer.
    pub players: Vec<PlayerMetadata>,
    /// Appearances filtered for this receiver.
    pub appearances: Vec<PlayerAppearance>,
    /// Recently disconnected ids.
    pub disconnected: Vec<PlayerId>,
    /// The server lacks the receiver's appearance.
    pub resend_appearance: bool,
    /// World time scale.
    pub time_scale: f32,
    /// Optional world-state payload.
    pub world: WorldPayload,
}

/// Out-of-band events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// Graceful leave.
    Disconnect {
        /// Leaving peer's id, if known.
        id: Option<PlayerId>,
        /// Leaving peer's last-known endpoint, as text.
        endpoint: String,
    },
    /// Reserved free-form message.
    Message(String),
}

/// Any protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    /// Serverless gossip.
    PlayerInfo(PlayerInfo),
    /// Client to server tick.
    ClientTick(ClientTick),
    /// Server to client tick.
    ServerTick(ServerTick),
    /// Out-of-band notice.
    Notice(Notice),
}

impl Packet {
    /// Kind tag of this packet.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::PlayerInfo(_) => MessageKind::PlayerInfo,
            Self::ClientTick(_) => MessageKind::ClientTick,
            Self::ServerTick(_) => MessageKind::ServerTick,
            Self::Notice(_) => MessageKind::Notice,
        }
    }
}

// =============================================================================
// WRITER
// =============================================================================

/// Append-only field writer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Finished bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Write a byte.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Write a bool as one byte.
    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    /// Write a u16.
    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a u32.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write an i64.
    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write an f32.
    pub fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a LEB128 length.
    pub fn put_len(&mut self, mut v: usize) {
        loop {
            let byte = (v & 0x7F) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(byte);
                break;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, s: &str) {
        self.put_len(s.len());
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// Write a UUID.
    pub fn put_id(&mut self, id: &PlayerId) {
        self.buf.extend_from_slice(id.as_bytes());
    }

    /// Write a u32-length blob.
    pub fn put_blob(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }
}

// =============================================================================
// READER
// =============================================================================

/// Cursor over a received message.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Start reading `buf` from the beginning.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read a byte.
    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    /// Read a bool byte (any non-zero is true).
    pub fn get_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.get_u8()? != 0)
    }

    /// Read a u16.
    pub fn get_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    /// Read a u32.
    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// Read an i64.
    pub fn get_i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    /// Read an f32.
    pub fn get_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    /// Read a LEB128 length.
    pub fn get_len(&mut self) -> Result<usize, ProtocolError> {
        let mut value: usize = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.get_u8()?;
            value |= ((byte & 0x7F) as usize) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::TooLong(value))
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn get_str(&mut self) -> Result<String, ProtocolError> {
        let len = self.get_len()?;
        if len > MAX_STRING_BYTES {
            return Err(ProtocolError::TooLong(len));
        }
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Read a UUID.
    pub fn get_id(&mut self) -> Result<PlayerId, ProtocolError> {
        Ok(PlayerId::from_bytes(self.array()?))
    }

    /// Read a u32-length blob.
    pub fn get_blob(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.get_u32()? as usize;
        if len > MAX_FRAME_BYTES {
            return Err(ProtocolError::TooLong(len));
        }
        Ok(self.take(len)?.to_vec())
    }

    /// Read a list length.
    pub fn get_count(&mut self) -> Result<usize, ProtocolError> {
        let n = self.get_len()?;
        if n > MAX_LIST_LEN {
            return Err(ProtocolError::TooLong(n));
        }
        Ok(n)
    }
}

// =============================================================================
// FIELD GROUPS
// =============================================================================

fn put_player(w: &mut WireWriter, p: &PlayerMetadata) {
    w.put_id(&p.id);
    // Clipped the same way the decoder clips, so both ends hold one name.
    w.put_str(prefix_chars(&p.name, MAX_NAME_CHARS));
    match &p.level {
        Some(level) => {
            w.put_bool(true);
            w.put_str(level);
        }
        None => w.put_bool(false),
    }
    for v in p.position {
        w.put_f32(v);
    }
    w.put_u8(p.action as u8);
    w.put_u16(p.frame);
    w.put_u8(p.facing as u8);
    w.put_u8(p.viewpoint as u8);
    w.put_i64(p.last_update_timestamp);
    w.put_str(&p.endpoint.map(|e| e.to_string()).unwrap_or_default());
}

fn get_player(r: &mut WireReader<'_>) -> Result<PlayerMetadata, ProtocolError> {
    let id = r.get_id()?;
    let name = r.get_str()?;
    let level = if r.get_bool()? { Some(r.get_str()?) } else { None };
    let position = [r.get_f32()?, r.get_f32()?, r.get_f32()?];
    let action = r.get_u8()?;
    let action = Action::from_u8(action).ok_or(ProtocolError::InvalidEnum { field: "action", value: action })?;
    let frame = r.get_u16()?;
    let facing = r.get_u8()?;
    let facing = Facing::from_u8(facing).ok_or(ProtocolError::InvalidEnum { field: "facing", value: facing })?;
    let viewpoint = r.get_u8()?;
    let viewpoint =
        Viewpoint::from_u8(viewpoint).ok_or(ProtocolError::InvalidEnum { field: "viewpoint", value: viewpoint })?;
    let last_update_timestamp = r.get_i64()?;
    // Unparseable address degrades to "unknown" instead of failing the message.
    let endpoint = r.get_str()?.parse::<SocketAddr>().ok();

    let mut meta = PlayerMetadata::new(id, name);
    meta.level = level;
    meta.position = position;
    meta.action = action;
    meta.frame = frame;
    meta.facing = facing;
    meta.viewpoint = viewpoint;
    meta.last_update_timestamp = last_update_timestamp;
    meta.last_update_local = Instant::now();
    meta.endpoint = endpoint;
    Ok(meta)
}

fn put_players(w: &mut WireWriter, players: &[PlayerMetadata]) {
    w.put_len(players.len());
    for p in players {
        put_player(w, p);
    }
}

fn get_players(r: &mut WireReader<'_>) -> Result<Vec<PlayerMetadata>, ProtocolError> {
    let n = r.get_count()?;
    (0..n).map(|_| get_player(r)).collect()
}

fn put_appearance(w: &mut WireWriter, a: &PlayerAppearance) {
    w.put_id(&a.id);
    w.put_str(prefix_chars(&a.name, MAX_NAME_CHARS));
    w.put_str(prefix_bytes(&a.descriptor, MAX_APPEARANCE_BYTES));
}

fn get_appearance(r: &mut WireReader<'_>) -> Result<PlayerAppearance, ProtocolError> {
    let id = r.get_id()?;
    let name = r.get_str()?;
    let descriptor = r.get_str()?;
    Ok(PlayerAppearance::new(id, name, descriptor))
}

fn put_ids(w: &mut WireWriter, ids: &[PlayerId]) {
    w.put_len(ids.len());
    for id in ids {
        w.put_id(id);
    }
}

fn get_ids(r: &mut WireReader<'_>) -> Result<Vec<PlayerId>, ProtocolError> {
    let n = r.get_count()?;
    (0..n).map(|_| r.get_id()).collect()
}

const WORLD_LEVEL: u8 = 0x01;
const WORLD_SAVE: u8 = 0x02;

fn put_world(w: &mut WireWriter, world: &WorldPayload) {
    let mut flags = 0u8;
    if world.level_state.is_some() {
        flags |= WORLD_LEVEL;
    }
    if world.save_update.is_some() {
        flags |= WORLD_SAVE;
    }
    w.put_u8(flags);
    if let Some(level) = &world.level_state {
        w.put_blob(&level.0);
    }
    if let Some(save) = &world.save_update {
        w.put_blob(&save.0);
    }
}

fn get_world(r: &mut WireReader<'_>) -> Result<WorldPayload, ProtocolError> {
    let flags = r.get_u8()?;
    let level_state = if flags & WORLD_LEVEL != 0 {
        Some(ActiveLevelState(r.get_blob()?))
    } else {
        None
    };
    let save_update = if flags & WORLD_SAVE != 0 {
        Some(SaveDataUpdate(r.get_blob()?))
    } else {
        None
    };
    Ok(WorldPayload { level_state, save_update })
}

// =============================================================================
// ENCODE / DECODE
// =============================================================================

/// Encode a packet (preamble included).
pub fn encode(packet: &Packet) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_str(PROTOCOL_SIGNATURE);
    w.put_str(PROTOCOL_VERSION);
    w.put_u8(packet.kind() as u8);

    match packet {
        Packet::PlayerInfo(info) => {
            put_player(&mut w, &info.sender);
            put_players(&mut w, &info.relayed);
        }
        Packet::ClientTick(tick) => {
            put_player(&mut w, &tick.player);
            match &tick.appearance {
                Some(a) => {
                    w.put_bool(true);
                    put_appearance(&mut w, a);
                }
                None => w.put_bool(false),
            }
            put_ids(&mut w, &tick.requested_appearances);
            put_world(&mut w, &tick.world);
            w.put_bool(tick.disconnecting);
        }
        Packet::ServerTick(tick) => {
            w.put_id(&tick.your_id);
            put_players(&mut w, &tick.players);
            w.put_len(tick.appearances.len());
            for a in &tick.appearances {
                put_appearance(&mut w, a);
            }
            put_ids(&mut w, &tick.disconnected);
            w.put_bool(tick.resend_appearance);
            w.put_f32(tick.time_scale);
            put_world(&mut w, &tick.world);
        }
        Packet::Notice(notice) => match notice {
            Notice::Disconnect { id, endpoint } => {
                w.put_u8(0);
                match id {
                    Some(id) => {
                        w.put_bool(true);
                        w.put_id(id);
                    }
                    None => w.put_bool(false),
                }
                w.put_str(endpoint);
            }
            Notice::Message(text) => {
                w.put_u8(1);
                w.put_str(text);
            }
        },
    }

    w.into_bytes()
}

/// Check signature and version.
fn read_preamble(r: &mut WireReader<'_>) -> Result<(), ProtocolError> {
    let signature = r.get_str().map_err(|_| ProtocolError::BadSignature)?;
    if signature != PROTOCOL_SIGNATURE {
        return Err(ProtocolError::BadSignature);
    }
    let version = r.get_str().map_err(|_| ProtocolError::VersionMismatch {
        ours: PROTOCOL_VERSION,
        theirs: String::from("<unreadable>"),
    })?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs: version,
        });
    }
    Ok(())
}

/// Decode one complete message.
pub fn decode(bytes: &[u8]) -> Result<Packet, ProtocolError> {
    let mut r = WireReader::new(bytes);
    read_preamble(&mut r)?;

    let kind = r.get_u8()?;
    let packet = match kind {
        k if k == MessageKind::PlayerInfo as u8 => {
            let sender = get_player(&mut r)?;
            let relayed = get_players(&mut r)?;
            Packet::PlayerInfo(PlayerInfo { sender, relayed })
        }
        k if k == MessageKind::ClientTick as u8 => {
            let player = get_player(&mut r)?;
            let appearance = if r.get_bool()? { Some(get_appearance(&mut r)?) } else { None };
            let requested_appearances = get_ids(&mut r)?;
            let world = get_world(&mut r)?;
            let disconnecting = r.get_bool()?;
            Packet::ClientTick(ClientTick {
                player,
                appearance,
                requested_appearances,
                world,
                disconnecting,
            })
        }
        k if k == MessageKind::ServerTick as u8 => {
            let your_id = r.get_id()?;
            let players = get_players(&mut r)?;
            let n = r.get_count()?;
            let appearances = (0..n)
                .map(|_| get_appearance(&mut r))
                .collect::<Result<Vec<_>, _>>()?;
            let disconnected = get_ids(&mut r)?;
            let resend_appearance = r.get_bool()?;
            let time_scale = r.get_f32()?;
            let world = get_world(&mut r)?;
            Packet::ServerTick(ServerTick {
                your_id,
                players,
                appearances,
                disconnected,
                resend_appearance,
                time_scale,
                world,
            })
        }
        k if k == MessageKind::Notice as u8 => {
            let notice = match r.get_u8()? {
                0 => {
                    let id = if r.get_bool()? { Some(r.get_id()?) } else { None };
                    let endpoint = r.get_str()?;
                    Notice::Disconnect { id, endpoint }
                }
                1 => Notice::Message(r.get_str()?),
                other => return Err(ProtocolError::InvalidEnum { field: "notice", value: other }),
            };
            Packet::Notice(notice)
        }
        other => return Err(ProtocolError::UnknownKind(other)),
    };

    if r.remaining() != 0 {
        return Err(ProtocolError::TrailingBytes(r.remaining()));
    }
    Ok(packet)
}

// =============================================================================
// STREAM FRAMING
// =============================================================================

/// Write one length-framed message.
pub async fn write_frame<W>(w: &mut W, packet: &Packet) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let body = encode(packet);
    if body.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Read one length-framed message.
pub async fn read_frame<R>(r: &mut R) -> Result<Packet, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_u32_le().await? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    decode(&body)
}
