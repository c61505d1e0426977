//! LAN Discovery
//!
//! Servers advertise themselves on a fixed multicast group; clients listen
//! on the same group and keep a table of recently seen servers. Entries
//! expire if not refreshed.
//!
//! The payload is INI-style text:
//!
//! ```text
//! [presence-sync]
//! signature=PSYNC
//! version=1.4.0-r2
//! port=7777
//! name=Basement
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::network::protocol::{PROTOCOL_SIGNATURE, PROTOCOL_VERSION};

/// INI section name.
pub const SECTION: &str = "presence-sync";

/// Discovery configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Multicast group.
    pub group: Ipv4Addr,
    /// Multicast port.
    pub port: u16,
    /// Advertisement cadence.
    pub interval: Duration,
    /// Entries older than this are dropped.
    pub expiry: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 77, 77),
            port: 47777,
            interval: Duration::from_secs(2),
            expiry: Duration::from_secs(6),
        }
    }
}

/// Discovery errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Payload has no `[presence-sync]` section.
    #[error("missing [presence-sync] section")]
    MissingSection,

    /// A required key is absent.
    #[error("missing key {0}")]
    MissingKey(&'static str),

    /// Port is not a number.
    #[error("invalid port {0:?}")]
    InvalidPort(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// PAYLOAD
// =============================================================================

/// One server advertisement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    /// Protocol signature.
    pub signature: String,
    /// Protocol version.
    pub version: String,
    /// Listening port.
    pub port: u16,
    /// Display name, possibly empty.
    pub name: String,
}

impl Advertisement {
    /// An advertisement for this build's protocol.
    pub fn current(port: u16, name: impl Into<String>) -> Self {
        Self {
            signature: PROTOCOL_SIGNATURE.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            port,
            name: name.into(),
        }
    }

    /// Whether a client of this build could connect.
    pub fn is_compatible(&self) -> bool {
        self.signature == PROTOCOL_SIGNATURE && self.version == PROTOCOL_VERSION
    }

    /// Render as INI text.
    pub fn to_payload(&self) -> String {
        format!(
            "[{}]\nsignature={}\nversion={}\nport={}\nname={}\n",
            SECTION,
            self.signature,
            self.version,
            self.port,
            self.name.replace(['\r', '\n'], " ")
        )
    }

    /// Parse INI text. Keys outside our section and unknown keys are ignored.
    pub fn parse(text: &str) -> Result<Self, DiscoveryError> {
        let mut in_section = false;
        let mut seen_section = false;
        let (mut signature, mut version, mut port, mut name) = (None, None, None, None);

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_section = header.trim().eq_ignore_ascii_case(SECTION);
                seen_section |= in_section;
                continue;
            }
            if !in_section {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "signature" => signature = Some(value),
                "version" => version = Some(value),
                "port" => port = Some(value),
                "name" => name = Some(value),
                _ => {}
            }
        }

        if !seen_section {
            return Err(DiscoveryError::MissingSection);
        }
        let port_text = port.ok_or(DiscoveryError::MissingKey("port"))?;
        let port = port_text
            .parse::<u16>()
            .map_err(|_| DiscoveryError::InvalidPort(port_text.clone()))?;

        Ok(Self {
            signature: signature.ok_or(DiscoveryError::MissingKey("signature"))?,
            version: version.ok_or(DiscoveryError::MissingKey("version"))?,
            port,
            name: name.unwrap_or_default(),
        })
    }
}

// =============================================================================
// ADVERTISER
// =============================================================================

/// Periodically multicasts one advertisement.
pub struct DiscoveryAdvertiser {
    config: DiscoveryConfig,
    advertisement: Advertisement,
}

impl DiscoveryAdvertiser {
    /// Create an advertiser.
    pub fn new(config: DiscoveryConfig, advertisement: Advertisement) -> Self {
        Self { config, advertisement }
    }

    /// Advertise until `cancel` fires. Send failures (no multicast route)
    /// are logged and retried on the next interval.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DiscoveryError> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
        if let Err(e) = socket.set_multicast_ttl_v4(1) {
            debug!("Could not set multicast TTL: {}", e);
        }
        let target = SocketAddr::new(IpAddr::V4(self.config.group), self.config.port);
        let payload = self.advertisement.to_payload();
        info!("Advertising on {} as {:?}", target, self.advertisement.name);

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut warned = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match socket.send_to(payload.as_bytes(), target).await {
                Ok(_) => warned = false,
                Err(e) if !warned => {
                    warn!("LAN advertisement failed: {}", e);
                    warned = true;
                }
                Err(e) => trace!("LAN advertisement failed: {}", e),
            }
        }
        debug!("Advertiser stopped");
        Ok(())
    }
}

// =============================================================================
// LISTENER
// =============================================================================

/// A server seen on the LAN.
#[derive(Clone, Debug)]
pub struct DiscoveredServer {
    /// Address to connect to.
    pub addr: SocketAddr,
    /// Advertised name.
    pub name: String,
    /// Advertised protocol version.
    pub version: String,
    /// Whether the version matches ours.
    pub compatible: bool,
    /// Last advertisement received.
    pub last_seen: Instant,
}

/// Receives advertisements and keeps the table of servers.
pub struct DiscoveryListener {
    config: DiscoveryConfig,
    socket: UdpSocket,
    servers: DashMap<SocketAddr, DiscoveredServer>,
}

impl DiscoveryListener {
    /// Bind the discovery port and join the group. A failed join is not
    /// fatal: unicast advertisements still arrive.
    pub async fn bind(config: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port)).await?;
        if let Err(e) = socket.join_multicast_v4(config.group, Ipv4Addr::UNSPECIFIED) {
            warn!("Could not join {}: {}", config.group, e);
        }
        Ok(Self {
            config,
            socket,
            servers: DashMap::new(),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        Ok(self.socket.local_addr()?)
    }

    /// Record an advertisement from `source`. Foreign signatures are ignored.
    pub fn record(&self, ad: Advertisement, source: IpAddr, now: Instant) -> bool {
        if ad.signature != PROTOCOL_SIGNATURE {
            trace!("Ignoring advertisement with signature {:?}", ad.signature);
            return false;
        }
        let addr = SocketAddr::new(source, ad.port);
        let compatible = ad.is_compatible();
        let fresh = !self.servers.contains_key(&addr);
        if fresh {
            if compatible {
                info!("Found server {:?} at {}", ad.name, addr);
            } else {
                info!("Found incompatible server {:?} at {} (version {})", ad.name, addr, ad.version);
            }
        }
        self.servers.insert(
            addr,
            DiscoveredServer {
                addr,
                name: ad.name,
                version: ad.version,
                compatible,
                last_seen: now,
            },
        );
        true
    }

    /// Drop entries not refreshed within the expiry.
    pub fn expire(&self, now: Instant) {
        let expiry = self.config.expiry;
        self.servers
            .retain(|_, s| now.saturating_duration_since(s.last_seen) <= expiry);
    }

    /// Servers a client could connect to, by name.
    pub fn compatible(&self) -> Vec<DiscoveredServer> {
        self.filtered(true)
    }

    /// Servers running a different version.
    pub fn incompatible(&self) -> Vec<DiscoveredServer> {
        self.filtered(false)
    }

    fn filtered(&self, compatible: bool) -> Vec<DiscoveredServer> {
        let mut list: Vec<DiscoveredServer> = self
            .servers
            .iter()
            .filter(|s| s.compatible == compatible)
            .map(|s| s.value().clone())
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then(a.addr.cmp(&b.addr)));
        list
    }

    /// Receive until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), DiscoveryError> {
        let mut buf = [0u8; 2048];
        let mut sweep = interval(self.config.interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => self.expire(Instant::now()),
                result = self.socket.recv_from(&mut buf) => {
                    let (len, src) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            debug!("Discovery receive error: {}", e);
                            continue;
                        }
                    };
                    let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                        trace!("Non-text datagram from {}", src);
                        continue;
                    };
                    match Advertisement::parse(text) {
                        Ok(ad) => {
                            self.record(ad, src.ip(), Instant::now());
                        }
                        Err(e) => trace!("Bad advertisement from {}: {}", src, e),
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_payload_roundtrip() {
        let ad = Advertisement::current(7777, "Basement");
        let parsed = Advertisement::parse(&ad.to_payload()).unwrap();
        assert_eq!(parsed, ad);
        assert!(parsed.is_compatible());
    }

    #[test]
    fn test_parse_tolerates_noise() {
        let text = "; comment\n[other]\nport=1\n\n[Presence-Sync]\n  signature = PSYNC \nversion=0.9\nport= 9000\nextra=1\n";
        let ad = Advertisement::parse(text).unwrap();
        assert_eq!(ad.port, 9000);
        assert_eq!(ad.version, "0.9");
        assert_eq!(ad.name, "");
        assert!(!ad.is_compatible());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Advertisement::parse("port=1"), Err(DiscoveryError::MissingSection)));
        assert!(matches!(
            Advertisement::parse("[presence-sync]\nsignature=PSYNC\nversion=1"),
            Err(DiscoveryError::MissingKey("port"))
        ));
        assert!(matches!(
            Advertisement::parse("[presence-sync]\nsignature=PSYNC\nversion=1\nport=http"),
            Err(DiscoveryError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_name_newlines_flattened() {
        let ad = Advertisement::current(1, "two\nlines");
        assert_eq!(Advertisement::parse(&ad.to_payload()).unwrap().name, "two lines");
    }

    fn test_config() -> DiscoveryConfig {
        DiscoveryConfig {
            port: 0,
            interval: Duration::from_millis(20),
            expiry: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_listener_classifies_and_expires() {
        let listener = DiscoveryListener::bind(test_config()).await.unwrap();
        let now = Instant::now();
        let host: IpAddr = "192.168.1.20".parse().unwrap();

        assert!(listener.record(Advertisement::current(7777, "good"), host, now));
        let mut old = Advertisement::current(7778, "old");
        old.version = "0.1".into();
        assert!(listener.record(old, host, now));
        let mut foreign = Advertisement::current(7779, "other game");
        foreign.signature = "XYZ".into();
        assert!(!listener.record(foreign, host, now));

        let good = listener.compatible();
        assert_eq!(good.len(), 1);
        assert_eq!(good[0].addr, SocketAddr::new(host, 7777));
        assert_eq!(listener.incompatible().len(), 1);

        listener.expire(now + Duration::from_secs(1));
        assert!(listener.compatible().is_empty());
        assert!(listener.incompatible().is_empty());
    }

    #[tokio::test]
    async fn test_listener_receives_unicast() {
        let listener = Arc::new(DiscoveryListener::bind(test_config()).await.unwrap());
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let task = {
            let listener = listener.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { listener.run(cancel).await })
        };

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let payload = Advertisement::current(7777, "local").to_payload();
        let target = SocketAddr::from(([127, 0, 0, 1], port));
        let deadline = Instant::now() + Duration::from_secs(2);
        while listener.compatible().is_empty() {
            assert!(Instant::now() < deadline, "advertisement never arrived");
            sender.send_to(payload.as_bytes(), target).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(listener.compatible()[0].name, "local");

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
