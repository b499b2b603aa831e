//! Legacy WireGuard configuration parser
//!
//! Reads an existing `[Interface]`/`[Peer]` file so a deployment that predates
//! the managed state file can be adopted. The interface section must be
//! sound; peer sections are best-effort and a broken one is skipped with a
//! warning.

use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::{IpNet, Ipv4Net};

use crate::error::ConfigError;
use crate::keys::is_valid_key;

/// Parsed legacy configuration
#[derive(Debug, Clone)]
pub struct LegacyConfig {
    pub interface: LegacyInterface,
    pub peers: Vec<LegacyPeer>,
    /// One entry per skipped peer block
    pub warnings: Vec<String>,
}

/// Interface section
#[derive(Debug, Clone)]
pub struct LegacyInterface {
    pub private_key: String,
    /// First IPv4 `Address`, if any
    pub address: Option<Ipv4Net>,
    pub listen_port: Option<u16>,
    pub mtu: Option<u16>,
}

/// Peer section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyPeer {
    /// From a `# Client: <name> (<id>)` comment
    pub name: Option<String>,
    pub id: Option<String>,
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<u16>,
    /// Directives this parser does not model, verbatim, one per line
    pub extensions: Vec<String>,
    /// 1-indexed line of the `[Peer]` header
    pub line: usize,
}

impl LegacyPeer {
    /// First host route of AllowedIPs that falls inside `subnet`
    pub fn host_address(&self, subnet: &Ipv4Net) -> Option<Ipv4Addr> {
        self.allowed_ips.iter().find_map(|net| match net {
            IpNet::V4(v4) if v4.prefix_len() == 32 && subnet.contains(&v4.addr()) => {
                Some(v4.addr())
            }
            _ => None,
        })
    }
}

impl LegacyConfig {
    /// Parse a legacy configuration file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse legacy configuration text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut interface: Option<InterfaceBuilder> = None;
        let mut peers: Vec<LegacyPeer> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut current_section: Option<Section> = None;
        let mut current_peer: Option<PeerBuilder> = None;
        // A `# Client:` comment seen before the next [Peer] header
        let mut pending_label: Option<(String, Option<String>)> = None;

        for (line_num, raw) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-indexed
            let line = raw.trim();

            if line.is_empty() {
                continue;
            }

            if let Some(comment) = line.strip_prefix('#') {
                if let Some(label) = parse_client_label(comment) {
                    pending_label = Some(label);
                }
                continue;
            }

            // Section headers, possibly with a trailing comment
            let (header, trailing) = match line.split_once('#') {
                Some((h, c)) => (h.trim(), Some(c.trim())),
                None => (line, None),
            };
            if header.eq_ignore_ascii_case("[interface]") {
                finish_peer(current_peer.take(), &mut peers, &mut warnings);
                if interface.is_some() {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Duplicate [Interface] section".to_string(),
                    });
                }
                interface = Some(InterfaceBuilder::default());
                current_section = Some(Section::Interface);
                pending_label = None;
                continue;
            } else if header.eq_ignore_ascii_case("[peer]") {
                finish_peer(current_peer.take(), &mut peers, &mut warnings);
                let mut peer = PeerBuilder::new(line_num);
                if let Some((name, id)) = pending_label.take() {
                    peer.name = Some(name);
                    peer.id = id;
                } else if let Some(name) = trailing.filter(|c| !c.is_empty()) {
                    peer.name = Some(name.to_string());
                }
                current_peer = Some(peer);
                current_section = Some(Section::Peer);
                continue;
            }

            match current_section {
                Some(Section::Interface) => {
                    let iface = interface.get_or_insert_with(InterfaceBuilder::default);
                    iface.apply(line, line_num)?;
                }
                Some(Section::Peer) => {
                    if let Some(peer) = current_peer.as_mut() {
                        peer.apply(line, line_num);
                    }
                }
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        finish_peer(current_peer.take(), &mut peers, &mut warnings);

        let interface = interface
            .ok_or(ConfigError::MissingField {
                field: "[Interface] section".to_string(),
            })?
            .build()?;

        Ok(LegacyConfig {
            interface,
            peers,
            warnings,
        })
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

/// `Client: alice (3f1c...)` → name and optional id
fn parse_client_label(comment: &str) -> Option<(String, Option<String>)> {
    let rest = comment.trim().strip_prefix("Client:")?.trim();
    if rest.is_empty() {
        return None;
    }

    if rest.ends_with(')') {
        if let Some(open) = rest.rfind('(') {
            let name = rest[..open].trim().to_string();
            let id = rest[open + 1..rest.len() - 1].trim().to_string();
            if !name.is_empty() {
                return Some((name, Some(id).filter(|i| !i.is_empty())));
            }
        }
    }
    Some((rest.to_string(), None))
}

fn split_directive(line: &str) -> Option<(String, &str)> {
    let (key, value) = line.split_once('=')?;
    Some((key.trim().to_lowercase(), value.trim()))
}

fn finish_peer(peer: Option<PeerBuilder>, peers: &mut Vec<LegacyPeer>, warnings: &mut Vec<String>) {
    let Some(peer) = peer else { return };
    let line = peer.line;
    match peer.build() {
        Ok(peer) => peers.push(peer),
        Err(reason) => {
            let warning = format!("Skipping [Peer] at line {}: {}", line, reason);
            tracing::warn!("{}", warning);
            warnings.push(warning);
        }
    }
}

#[derive(Default)]
struct InterfaceBuilder {
    private_key: Option<String>,
    address: Option<Ipv4Net>,
    listen_port: Option<u16>,
    mtu: Option<u16>,
}

impl InterfaceBuilder {
    fn apply(&mut self, line: &str, line_num: usize) -> Result<(), ConfigError> {
        let Some((key, value)) = split_directive(line) else {
            return Err(ConfigError::ParseError {
                line: line_num,
                message: format!("Expected 'key = value', got: {}", line),
            });
        };

        match key.as_str() {
            "privatekey" => {
                if !is_valid_key(value) {
                    return Err(ConfigError::InvalidKey {
                        field: "PrivateKey".to_string(),
                    });
                }
                self.private_key = Some(value.to_string());
            }
            "address" => {
                // May have multiple addresses separated by comma
                for addr_str in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    let ip_net: IpNet = addr_str.parse().map_err(|_| ConfigError::InvalidCidr {
                        value: addr_str.to_string(),
                    })?;
                    if let (IpNet::V4(v4net), None) = (ip_net, self.address) {
                        self.address = Some(v4net);
                    }
                }
            }
            "listenport" => {
                self.listen_port = Some(value.parse().map_err(|_| ConfigError::ParseError {
                    line: line_num,
                    message: format!("Invalid ListenPort: {}", value),
                })?);
            }
            "mtu" => {
                self.mtu = Some(value.parse().map_err(|_| ConfigError::ParseError {
                    line: line_num,
                    message: format!("Invalid MTU: {}", value),
                })?);
            }
            _ => {
                // Hooks, DNS, Table etc. come from settings instead
                tracing::debug!("Ignoring interface key: {}", key);
            }
        }
        Ok(())
    }

    fn build(self) -> Result<LegacyInterface, ConfigError> {
        let private_key = self.private_key.ok_or(ConfigError::MissingField {
            field: "PrivateKey".to_string(),
        })?;
        Ok(LegacyInterface {
            private_key,
            address: self.address,
            listen_port: self.listen_port,
            mtu: self.mtu,
        })
    }
}

/// Builder for LegacyPeer; the first problem found is kept and the block skipped
struct PeerBuilder {
    line: usize,
    name: Option<String>,
    id: Option<String>,
    public_key: Option<String>,
    preshared_key: Option<String>,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Option<u16>,
    extensions: Vec<String>,
    error: Option<String>,
}

impl PeerBuilder {
    fn new(line: usize) -> Self {
        Self {
            line,
            name: None,
            id: None,
            public_key: None,
            preshared_key: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: None,
            extensions: Vec::new(),
            error: None,
        }
    }

    fn fail(&mut self, message: String) {
        self.error.get_or_insert(message);
    }

    fn apply(&mut self, line: &str, line_num: usize) {
        let Some((key, value)) = split_directive(line) else {
            self.fail(format!("line {}: expected 'key = value', got: {}", line_num, line));
            return;
        };

        match key.as_str() {
            "publickey" => {
                if is_valid_key(value) {
                    self.public_key = Some(value.to_string());
                } else {
                    self.fail(format!("line {}: invalid PublicKey", line_num));
                }
            }
            "presharedkey" => {
                if is_valid_key(value) {
                    self.preshared_key = Some(value.to_string());
                } else {
                    self.fail(format!("line {}: invalid PresharedKey", line_num));
                }
            }
            "allowedips" => {
                for ip_str in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    // Bare addresses mean a host route
                    let parsed = ip_str
                        .parse::<IpNet>()
                        .or_else(|_| ip_str.parse::<std::net::IpAddr>().map(IpNet::from));
                    match parsed {
                        Ok(net) => self.allowed_ips.push(net),
                        Err(_) => {
                            self.fail(format!("line {}: invalid AllowedIPs entry {}", line_num, ip_str))
                        }
                    }
                }
            }
            "persistentkeepalive" => {
                if value.eq_ignore_ascii_case("off") {
                    self.persistent_keepalive = Some(0);
                } else {
                    match value.parse() {
                        Ok(v) => self.persistent_keepalive = Some(v),
                        Err(_) => self.fail(format!(
                            "line {}: invalid PersistentKeepalive {}",
                            line_num, value
                        )),
                    }
                }
            }
            _ => self.extensions.push(line.to_string()),
        }
    }

    fn build(self) -> Result<LegacyPeer, String> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let public_key = self
            .public_key
            .ok_or_else(|| "missing PublicKey".to_string())?;

        Ok(LegacyPeer {
            name: self.name,
            id: self.id,
            public_key,
            preshared_key: self.preshared_key,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
            extensions: self.extensions,
            line: self.line,
        })
    }
}
