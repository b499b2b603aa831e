//! Peer and interface records
//!
//! `Peer` and `InterfaceRecord` are what gets persisted. `PeerView` is the
//! read-only shape handed to callers, without the private key and with
//! telemetry from the live interface merged in.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Stable opaque peer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl FromStr for PeerId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(PeerId)
            .map_err(|_| ValidationError::InvalidId {
                value: s.to_string(),
            })
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-empty display name. Stored as given; only presentation sanitizes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerName(String);

impl PeerName {
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PeerName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerName> for String {
    fn from(name: PeerName) -> Self {
        name.0
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server identity, created once at first boot
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceRecord {
    pub private_key: String,
    pub public_key: String,
    /// The interface's own address inside the subnet (host `.1`)
    pub address: Ipv4Addr,
}

impl fmt::Debug for InterfaceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceRecord")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .field("address", &self.address)
            .finish()
    }
}

/// One VPN client
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub name: PeerName,
    pub address: Ipv4Addr,
    /// `None` only for peers migrated from a legacy config file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    pub enabled: bool,
    /// What the client tunnels; `None` uses the interface policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_ips: Option<Vec<IpNet>>,
    /// Routes on the server side; `None` means `address/32`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_allowed_ips: Option<Vec<IpNet>>,
    /// Seconds, 0 disables
    #[serde(default)]
    pub persistent_keepalive: u16,
    /// Unrecognized directives carried over from a migrated config, verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("public_key", &self.public_key)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl Peer {
    /// Server-side AllowedIPs: the override, or the peer address as a host route
    pub fn routed_ips(&self) -> Vec<IpNet> {
        match &self.server_allowed_ips {
            Some(ips) if !ips.is_empty() => ips.clone(),
            _ => vec![IpNet::from(IpAddr::V4(self.address))],
        }
    }

    /// Read-only copy without key secrets
    pub fn view(&self) -> PeerView {
        PeerView {
            id: self.id,
            name: self.name.to_string(),
            address: self.address,
            public_key: self.public_key.clone(),
            has_preshared_key: self.preshared_key.is_some(),
            enabled: self.enabled,
            allowed_ips: self.allowed_ips.clone(),
            persistent_keepalive: self.persistent_keepalive,
            created_at: self.created_at,
            updated_at: self.updated_at,
            endpoint: None,
            latest_handshake_at: None,
            transfer_rx: None,
            transfer_tx: None,
        }
    }
}

/// Telemetry read from the live interface; never persisted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub endpoint: Option<SocketAddr>,
    pub latest_handshake: Option<DateTime<Utc>>,
    pub transfer_rx: u64,
    pub transfer_tx: u64,
}

/// Caller-facing peer snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerView {
    pub id: PeerId,
    pub name: String,
    pub address: Ipv4Addr,
    pub public_key: String,
    pub has_preshared_key: bool,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_ips: Option<Vec<IpNet>>,
    pub persistent_keepalive: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_handshake_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_rx: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_tx: Option<u64>,
}

impl PeerView {
    pub fn with_stats(mut self, stats: &PeerStats) -> Self {
        self.endpoint = stats.endpoint;
        self.latest_handshake_at = stats.latest_handshake;
        self.transfer_rx = Some(stats.transfer_rx);
        self.transfer_tx = Some(stats.transfer_tx);
        self
    }
}

/// A validated mutation request
///
/// Loosely-typed input (request bodies, path segments) is turned into one of
/// these before it reaches the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    Create { name: PeerName },
    Delete { id: PeerId },
    SetEnabled { id: PeerId, enabled: bool },
    Rename { id: PeerId, name: PeerName },
    Readdress { id: PeerId, address: Ipv4Addr },
}

impl PeerCommand {
    pub fn create(name: &str) -> Result<Self, ValidationError> {
        Ok(Self::Create {
            name: PeerName::new(name)?,
        })
    }

    pub fn delete(id: &str) -> Result<Self, ValidationError> {
        Ok(Self::Delete { id: id.parse()? })
    }

    pub fn set_enabled(id: &str, enabled: bool) -> Result<Self, ValidationError> {
        Ok(Self::SetEnabled {
            id: id.parse()?,
            enabled,
        })
    }

    pub fn rename(id: &str, name: &str) -> Result<Self, ValidationError> {
        Ok(Self::Rename {
            id: id.parse()?,
            name: PeerName::new(name)?,
        })
    }

    pub fn readdress(id: &str, address: &str) -> Result<Self, ValidationError> {
        Ok(Self::Readdress {
            id: id.parse()?,
            address: parse_ipv4(address)?,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Delete { .. } => "delete",
            Self::SetEnabled { .. } => "set_enabled",
            Self::Rename { .. } => "rename",
            Self::Readdress { .. } => "readdress",
        }
    }
}

/// Strict dotted-quad IPv4 parse
pub fn parse_ipv4(value: &str) -> Result<Ipv4Addr, ValidationError> {
    value
        .trim()
        .parse()
        .map_err(|_| ValidationError::InvalidAddress {
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peer() -> Peer {
        let now = Utc::now();
        Peer {
            id: PeerId::random(),
            name: PeerName::new("alice").unwrap(),
            address: Ipv4Addr::new(10, 8, 0, 2),
            private_key: Some("UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=".into()),
            public_key: "ELSHH4/tGng4bXqLmzUVN2dSBrIQX3ELxn/S4NYwL3A=".into(),
            preshared_key: None,
            enabled: true,
            allowed_ips: None,
            server_allowed_ips: None,
            persistent_keepalive: 0,
            extensions: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_peer_name_rejects_blank() {
        assert_eq!(PeerName::new(""), Err(ValidationError::EmptyName));
        assert_eq!(PeerName::new("   "), Err(ValidationError::EmptyName));
        // Stored verbatim, not trimmed or sanitized
        assert_eq!(PeerName::new(" bob's phone ").unwrap().as_str(), " bob's phone ");
    }

    #[test]
    fn test_peer_id_parse() {
        let id = PeerId::random();
        assert_eq!(id.to_string().parse::<PeerId>().unwrap(), id);
        assert!(matches!(
            "not-a-uuid".parse::<PeerId>(),
            Err(ValidationError::InvalidId { .. })
        ));
    }

    #[test]
    fn test_routed_ips_default_host_route() {
        let mut peer = sample_peer();
        assert_eq!(peer.routed_ips(), vec!["10.8.0.2/32".parse::<IpNet>().unwrap()]);

        peer.server_allowed_ips = Some(vec!["192.168.5.0/24".parse().unwrap()]);
        assert_eq!(peer.routed_ips(), vec!["192.168.5.0/24".parse::<IpNet>().unwrap()]);
    }

    #[test]
    fn test_view_hides_private_key() {
        let peer = sample_peer();
        let json = serde_json::to_string(&peer.view()).unwrap();
        assert!(!json.contains("UOvtcWdILFwjb1UnsnK"));
        assert!(json.contains("\"address\":\"10.8.0.2\""));
    }

    #[test]
    fn test_peer_serialization_skips_empty_options() {
        let peer = sample_peer();
        let json = serde_json::to_string(&peer).unwrap();
        assert!(!json.contains("preshared_key"));
        assert!(!json.contains("extensions"));

        let parsed: Peer = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, peer);
    }

    #[test]
    fn test_blank_name_rejected_on_load() {
        let mut value = serde_json::to_value(sample_peer()).unwrap();
        value["name"] = serde_json::Value::String(String::new());
        assert!(serde_json::from_value::<Peer>(value).is_err());
    }

    #[test]
    fn test_commands_validate_at_boundary() {
        let id = PeerId::random().to_string();
        assert!(matches!(
            PeerCommand::create(""),
            Err(ValidationError::EmptyName)
        ));
        assert!(matches!(
            PeerCommand::readdress(&id, "10.8.0.300"),
            Err(ValidationError::InvalidAddress { .. })
        ));
        assert!(matches!(
            PeerCommand::delete("42"),
            Err(ValidationError::InvalidId { .. })
        ));
        let cmd = PeerCommand::set_enabled(&id, false).unwrap();
        assert_eq!(cmd.name(), "set_enabled");
    }
}
