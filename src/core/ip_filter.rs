//! IP Allow/Block Filtering
//!
//! Parses comma-separated range specifications into byte-range matchers.
//!
//! Accepted entry forms:
//!
//! | Form                    | Example                      |
//! |-------------------------|------------------------------|
//! | IPv6 single             | `fe80::1`                    |
//! | IPv6 range              | `fe80::1-fe80::ff`           |
//! | IPv6 CIDR               | `2001:db8::/32`              |
//! | IPv4 single             | `10.0.0.5`                   |
//! | IPv4 CIDR               | `192.168.0.0/16`             |
//! | IPv4 range              | `10.0.0.1-10.0.0.9`          |
//! | IPv4 implied range      | `10.0.0.1-9`, `10.0.0.1-1.9` |
//! | IPv4 implied prefix     | `10.`, `192.168.`            |
//!
//! Entries that fail to parse are skipped; the rest of the filter still works.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::debug;

/// Address family of a range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4 (4 bytes).
    V4,
    /// IPv6 (16 bytes).
    V6,
}

// =============================================================================
// ADDRESS RANGE
// =============================================================================

/// Inclusive low/high byte range over one address family.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IpAddressRange {
    family: AddressFamily,
    low: Vec<u8>,
    high: Vec<u8>,
}

impl IpAddressRange {
    /// Range between two addresses of the same family. Returns `None` if the
    /// families differ or `low > high`.
    pub fn between(low: IpAddr, high: IpAddr) -> Option<Self> {
        let (family, low, high) = match (low, high) {
            (IpAddr::V4(l), IpAddr::V4(h)) => (AddressFamily::V4, l.octets().to_vec(), h.octets().to_vec()),
            (IpAddr::V6(l), IpAddr::V6(h)) => (AddressFamily::V6, l.octets().to_vec(), h.octets().to_vec()),
            _ => return None,
        };
        if low > high {
            return None;
        }
        Some(Self { family, low, high })
    }

    /// Range matching exactly one address.
    pub fn single(addr: IpAddr) -> Self {
        let bytes = match addr {
            IpAddr::V4(a) => a.octets().to_vec(),
            IpAddr::V6(a) => a.octets().to_vec(),
        };
        Self {
            family: family_of(&addr),
            low: bytes.clone(),
            high: bytes,
        }
    }

    /// Parse one filter entry. Returns `None` for anything unparseable.
    pub fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return None;
        }
        if entry.contains(':') {
            parse_v6_entry(entry)
        } else {
            parse_v4_entry(entry)
        }
    }

    /// Address family of this range.
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Lowest matching address, big-endian bytes.
    pub fn low(&self) -> &[u8] {
        &self.low
    }

    /// Highest matching address, big-endian bytes.
    pub fn high(&self) -> &[u8] {
        &self.high
    }

    /// Whether `addr` lies inside this range.
    ///
    /// An IPv4-mapped IPv6 address is compared as IPv4 against IPv4 ranges.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        let bytes: Vec<u8> = match (self.family, addr) {
            (AddressFamily::V4, IpAddr::V4(a)) => a.octets().to_vec(),
            (AddressFamily::V4, IpAddr::V6(a)) => match a.to_ipv4_mapped() {
                Some(v4) => v4.octets().to_vec(),
                None => return false,
            },
            (AddressFamily::V6, IpAddr::V6(a)) => a.octets().to_vec(),
            (AddressFamily::V6, IpAddr::V4(_)) => return false,
        };
        self.low.as_slice() <= bytes.as_slice() && bytes.as_slice() <= self.high.as_slice()
    }
}

impl fmt::Display for IpAddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render = |bytes: &[u8]| -> String {
            match self.family {
                AddressFamily::V4 => {
                    let mut o = [0u8; 4];
                    o.copy_from_slice(bytes);
                    Ipv4Addr::from(o).to_string()
                }
                AddressFamily::V6 => {
                    let mut o = [0u8; 16];
                    o.copy_from_slice(bytes);
                    Ipv6Addr::from(o).to_string()
                }
            }
        };
        if self.low == self.high {
            write!(f, "{}", render(&self.low))
        } else {
            write!(f, "{}-{}", render(&self.low), render(&self.high))
        }
    }
}

fn family_of(addr: &IpAddr) -> AddressFamily {
    match addr {
        IpAddr::V4(_) => AddressFamily::V4,
        IpAddr::V6(_) => AddressFamily::V6,
    }
}

// =============================================================================
// ENTRY PARSERS
// =============================================================================

fn parse_v6_entry(entry: &str) -> Option<IpAddressRange> {
    if let Some((addr, bits)) = entry.split_once('/') {
        let addr: IpAddr = addr.trim().parse().ok()?;
        let bits: u32 = bits.trim().parse().ok()?;
        return cidr_bytes(addr, bits);
    }
    if let Some((low, high)) = entry.split_once('-') {
        let low: Ipv6Addr = low.trim().parse().ok()?;
        let high: Ipv6Addr = high.trim().parse().ok()?;
        return IpAddressRange::between(IpAddr::V6(low), IpAddr::V6(high));
    }
    let addr: Ipv6Addr = entry.parse().ok()?;
    Some(IpAddressRange::single(IpAddr::V6(addr)))
}

/// CIDR over the address's natural byte length, big-endian masking.
fn cidr_bytes(addr: IpAddr, bits: u32) -> Option<IpAddressRange> {
    let (family, bytes) = match addr {
        IpAddr::V4(a) => (AddressFamily::V4, a.octets().to_vec()),
        IpAddr::V6(a) => (AddressFamily::V6, a.octets().to_vec()),
    };
    if bits as usize > bytes.len() * 8 {
        return None;
    }
    let mut low = bytes.clone();
    let mut high = bytes;
    for (i, (l, h)) in low.iter_mut().zip(high.iter_mut()).enumerate() {
        let byte_start = (i * 8) as u32;
        let keep = bits.saturating_sub(byte_start).min(8);
        let mask: u8 = if keep == 0 { 0 } else { 0xFFu8 << (8 - keep) };
        *l &= mask;
        *h |= !mask;
    }
    Some(IpAddressRange { family, low, high })
}

fn parse_v4_entry(entry: &str) -> Option<IpAddressRange> {
    if let Some((addr, bits)) = entry.split_once('/') {
        let addr: Ipv4Addr = addr.trim().parse().ok()?;
        let bits: u32 = bits.trim().parse().ok()?;
        if bits > 32 {
            return None;
        }
        let host = u32::from(addr);
        let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
        let low = Ipv4Addr::from(host & mask);
        let high = Ipv4Addr::from(host | !mask);
        return IpAddressRange::between(IpAddr::V4(low), IpAddr::V4(high));
    }

    if let Some((low, high)) = entry.split_once('-') {
        let low: Ipv4Addr = low.trim().parse().ok()?;
        let high = parse_v4_suffix(low, high.trim())?;
        return IpAddressRange::between(IpAddr::V4(low), IpAddr::V4(high));
    }

    if let Some(prefix) = entry.strip_suffix('.') {
        let parts = parse_octets(prefix)?;
        if parts.is_empty() || parts.len() > 3 {
            return None;
        }
        let mut low = [0u8; 4];
        let mut high = [255u8; 4];
        low[..parts.len()].copy_from_slice(&parts);
        high[..parts.len()].copy_from_slice(&parts);
        return IpAddressRange::between(
            IpAddr::V4(Ipv4Addr::from(low)),
            IpAddr::V4(Ipv4Addr::from(high)),
        );
    }

    let addr: Ipv4Addr = entry.parse().ok()?;
    Some(IpAddressRange::single(IpAddr::V4(addr)))
}

/// Upper bound of a dashed range: a full address, or 1-3 trailing octets
/// replacing the tail of `low`.
fn parse_v4_suffix(low: Ipv4Addr, high: &str) -> Option<Ipv4Addr> {
    if let Ok(full) = high.parse::<Ipv4Addr>() {
        return Some(full);
    }
    let parts = parse_octets(high)?;
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut octets = low.octets();
    let start = 4 - parts.len();
    octets[start..].copy_from_slice(&parts);
    Some(Ipv4Addr::from(octets))
}

fn parse_octets(s: &str) -> Option<Vec<u8>> {
    s.split('.').map(|p| p.trim().parse::<u8>().ok()).collect()
}

// =============================================================================
// FILTER
// =============================================================================

/// Ordered, OR-combined list of address ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpFilter {
    ranges: Vec<IpAddressRange>,
}

impl IpFilter {
    /// Empty filter (matches nothing).
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma-separated specification, skipping bad entries.
    pub fn parse(spec: &str) -> Self {
        let mut ranges = Vec::new();
        for entry in spec.split(',') {
            if entry.trim().is_empty() {
                continue;
            }
            match IpAddressRange::parse(entry) {
                Some(range) => ranges.push(range),
                None => debug!("Skipping unparseable filter entry {:?}", entry.trim()),
            }
        }
        Self { ranges }
    }

    /// Append one range.
    pub fn push(&mut self, range: IpAddressRange) {
        self.ranges.push(range);
    }

    /// Whether any range contains `addr`.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.ranges.iter().any(|r| r.contains(addr))
    }

    /// Parsed ranges in order.
    pub fn ranges(&self) -> &[IpAddressRange] {
        &self.ranges
    }

    /// True if no range parsed.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl fmt::Display for IpFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", range)?;
        }
        Ok(())
    }
}
