//! Coarse IP geolocation backed by a local network table.

use std::{
    fs,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub country: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub timezone: String,
}

impl Location {
    pub fn new(
        country: impl Into<String>,
        region: impl Into<String>,
        city: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Self {
        Self {
            country: country.into(),
            region: region.into(),
            city: city.into(),
            timezone: timezone.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("failed to read geo database: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse geo database: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid network '{0}'")]
    InvalidNetwork(String),
}

pub trait GeoLocator: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<Location>;
}

/// Resolve a textual client address to a location.
///
/// Loopback, private, link-local and unparseable addresses (including the
/// `"unknown"` placeholder) resolve to `None`. IPv4-mapped IPv6 addresses are
/// unwrapped before the lookup.
pub fn locate(ip: &str, locator: &dyn GeoLocator) -> Option<Location> {
    let ip = routable_ip(ip)?;
    locator.lookup(ip)
}

fn routable_ip(raw: &str) -> Option<IpAddr> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("unknown") {
        return None;
    }
    let ip = match trimmed.parse::<IpAddr>().ok()? {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };
    (!is_non_routable(ip)).then_some(ip)
}

fn is_non_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_non_routable_v4(v4),
        IpAddr::V6(v6) => is_non_routable_v6(v6),
    }
}

fn is_non_routable_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_unspecified() || ip.is_link_local()
}

fn is_non_routable_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = first & 0xfe00 == 0xfc00;
    let link_local = first & 0xffc0 == 0xfe80;
    ip.is_loopback() || ip.is_unspecified() || unique_local || link_local
}

/// In-memory longest-prefix table, loadable from a JSON array of
/// `{"network": "81.2.69.0/24", "country": "GB", ...}` records.
#[derive(Debug, Clone, Default)]
pub struct GeoTable {
    entries: Vec<GeoEntry>,
}

#[derive(Debug, Clone)]
struct GeoEntry {
    network: IpAddr,
    prefix: u8,
    location: Location,
}

#[derive(Debug, Deserialize)]
struct GeoRecord {
    network: String,
    #[serde(flatten)]
    location: Location,
}

impl GeoTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, GeoError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, GeoError> {
        let records: Vec<GeoRecord> = serde_json::from_str(raw)?;
        let mut table = Self::new();
        for record in records {
            table.insert(&record.network, record.location)?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, network: &str, location: Location) -> Result<(), GeoError> {
        let (network, prefix) = parse_network(network)?;
        self.entries.push(GeoEntry {
            network,
            prefix,
            location,
        });
        Ok(())
    }

    pub fn with_network(mut self, network: &str, location: Location) -> Result<Self, GeoError> {
        self.insert(network, location)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl GeoLocator for GeoTable {
    fn lookup(&self, ip: IpAddr) -> Option<Location> {
        self.entries
            .iter()
            .filter(|entry| entry.contains(ip))
            .max_by_key(|entry| entry.prefix)
            .map(|entry| entry.location.clone())
    }
}

impl GeoEntry {
    fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(candidate)) => prefix_matches(
                u128::from(u32::from(net)),
                u128::from(u32::from(candidate)),
                self.prefix,
                32,
            ),
            (IpAddr::V6(net), IpAddr::V6(candidate)) => {
                prefix_matches(u128::from(net), u128::from(candidate), self.prefix, 128)
            }
            _ => false,
        }
    }
}

fn prefix_matches(network: u128, candidate: u128, prefix: u8, width: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let shift = u32::from(width - prefix);
    (network >> shift) == (candidate >> shift)
}

fn parse_network(raw: &str) -> Result<(IpAddr, u8), GeoError> {
    let invalid = || GeoError::InvalidNetwork(raw.to_string());
    let trimmed = raw.trim();
    let (addr, prefix) = match trimmed.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (trimmed, None),
    };
    let network: IpAddr = addr.parse().map_err(|_| invalid())?;
    let width = if network.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix {
        Some(prefix) => prefix.parse::<u8>().map_err(|_| invalid())?,
        None => width,
    };
    if prefix > width {
        return Err(invalid());
    }
    Ok((network, prefix))
}
