/// Deterministic node list records and network endpoints
///
/// The node list is ledger-derived ground truth mapping collateral to a
/// network address. Addresses are published as `ip` or `ip:port`; a missing
/// port means the network's default API port, so `1.2.3.4` and
/// `1.2.3.4:16127` name the same node.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Address of a network participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub ip: String,
    pub port: Option<u16>,
}

impl PeerEndpoint {
    pub fn new(ip: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Parse `ip`, `ip:port` or `[ipv6]:port`
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }

        if let Ok(addr) = s.parse::<IpAddr>() {
            return Some(Self::new(addr.to_string(), None));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let addr = host.parse::<IpAddr>().ok()?;
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(p.parse::<u16>().ok()?),
                None if tail.is_empty() => None,
                None => return None,
            };
            return Some(Self::new(addr.to_string(), port));
        }

        let (host, port) = s.rsplit_once(':')?;
        let addr = host.parse::<IpAddr>().ok()?;
        let port = port.parse::<u16>().ok()?;
        Some(Self::new(addr.to_string(), Some(port)))
    }

    /// Effective port, falling back to the network default
    pub fn port_or(&self, default_port: u16) -> u16 {
        self.port.unwrap_or(default_port)
    }

    /// Whether both endpoints address the same node
    pub fn same_node(&self, other: &PeerEndpoint, default_port: u16) -> bool {
        self.ip == other.ip && self.port_or(default_port) == other.port_or(default_port)
    }

    /// Base URL of the node's API
    pub fn api_url(&self, default_port: u16) -> String {
        let port = self.port_or(default_port);
        if self.ip.contains(':') {
            format!("http://[{}]:{}", self.ip, port)
        } else {
            format!("http://{}:{}", self.ip, port)
        }
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.port, self.ip.contains(':')) {
            (Some(port), true) => write!(f, "[{}]:{}", self.ip, port),
            (Some(port), false) => write!(f, "{}:{}", self.ip, port),
            (None, _) => write!(f, "{}", self.ip),
        }
    }
}

/// One record of the deterministic node list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeListEntry {
    /// Published address (`ip` or `ip:port`)
    pub ip: String,
    /// Collateral outpoint backing this identity
    pub collateral: String,
    /// Ledger height at which the identity was last confirmed
    pub confirmed_height: u64,
    #[serde(default)]
    pub status: String,
    /// Hex ed25519 key the node signs its requests with
    #[serde(default)]
    pub pubkey: String,
}

impl NodeListEntry {
    pub fn endpoint(&self) -> Option<PeerEndpoint> {
        PeerEndpoint::parse(&self.ip)
    }
}

/// Entries published at `endpoint`
pub fn entries_at<'a>(
    list: &'a [NodeListEntry],
    endpoint: &PeerEndpoint,
    default_port: u16,
) -> Vec<&'a NodeListEntry> {
    list.iter()
        .filter(|entry| {
            entry
                .endpoint()
                .map(|e| e.same_node(endpoint, default_port))
                .unwrap_or(false)
        })
        .collect()
}

/// Entry owning `collateral` but published at a different address
pub fn collateral_elsewhere<'a>(
    list: &'a [NodeListEntry],
    collateral: &str,
    endpoint: &PeerEndpoint,
    default_port: u16,
) -> Option<&'a NodeListEntry> {
    list.iter().find(|entry| {
        entry.collateral == collateral
            && !entry
                .endpoint()
                .map(|e| e.same_node(endpoint, default_port))
                .unwrap_or(false)
    })
}

/// Whether `endpoint` appears in the list
pub fn contains_endpoint(list: &[NodeListEntry], endpoint: &PeerEndpoint, default_port: u16) -> bool {
    !entries_at(list, endpoint, default_port).is_empty()
}

/// Whether `pubkey` belongs to a listed node
pub fn contains_pubkey(list: &[NodeListEntry], pubkey: &str) -> bool {
    !pubkey.is_empty() && list.iter().any(|entry| entry.pubkey.eq_ignore_ascii_case(pubkey))
}
