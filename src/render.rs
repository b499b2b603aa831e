//! Configuration rendering
//!
//! Pure functions of interface + peer state. Output is byte-identical for
//! identical input: the live-sync step and anything consuming the files
//! depend on that.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::config::Settings;
use crate::error::{PeerGuardError, ValidationError};
use crate::model::{InterfaceRecord, Peer};

/// Runtime view of the interface: persisted identity plus settings
#[derive(Debug, Clone, Copy)]
pub struct Interface<'a> {
    pub record: &'a InterfaceRecord,
    pub settings: &'a Settings,
}

impl<'a> Interface<'a> {
    pub fn new(record: &'a InterfaceRecord, settings: &'a Settings) -> Self {
        Self { record, settings }
    }
}

/// Stripped interface config for `wg syncconf`: keys, port and enabled peers
pub fn render_sync_config(iface: Interface<'_>, peers: &[Peer]) -> Result<String, PeerGuardError> {
    require_key(&iface.record.private_key, "interface private key")?;

    let mut out = String::new();
    out.push_str("[Interface]\n");
    out.push_str(&format!("PrivateKey = {}\n", iface.record.private_key));
    out.push_str(&format!("ListenPort = {}\n", iface.settings.listen_port));

    for peer in peers.iter().filter(|p| p.enabled) {
        out.push('\n');
        out.push_str("[Peer]\n");
        write_peer_block(&mut out, peer)?;
    }
    Ok(out)
}

/// Full wg-quick file: adds Address, MTU, hooks and a label per peer
pub fn render_quick_config(iface: Interface<'_>, peers: &[Peer]) -> Result<String, PeerGuardError> {
    require_key(&iface.record.private_key, "interface private key")?;
    let settings = iface.settings;

    let mut out = String::new();
    out.push_str("# Note: This file is generated. Manual changes are overwritten.\n\n");
    out.push_str("[Interface]\n");
    out.push_str(&format!("PrivateKey = {}\n", iface.record.private_key));
    out.push_str(&format!("Address = {}/24\n", iface.record.address));
    out.push_str(&format!("ListenPort = {}\n", settings.listen_port));
    if let Some(mtu) = settings.mtu {
        out.push_str(&format!("MTU = {}\n", mtu));
    }
    for (key, hook) in [
        ("PreUp", &settings.pre_up),
        ("PostUp", &settings.post_up),
        ("PreDown", &settings.pre_down),
        ("PostDown", &settings.post_down),
    ] {
        out.push_str(&format!("{} = {}\n", key, hook));
    }

    for peer in peers.iter().filter(|p| p.enabled) {
        out.push('\n');
        out.push_str(&format!("# Client: {} ({})\n", single_line(peer.name.as_str()), peer.id));
        out.push_str("[Peer]\n");
        write_peer_block(&mut out, peer)?;
    }
    Ok(out)
}

fn write_peer_block(out: &mut String, peer: &Peer) -> Result<(), PeerGuardError> {
    require_key(&peer.public_key, "peer public key")?;

    out.push_str(&format!("PublicKey = {}\n", peer.public_key));
    if let Some(psk) = &peer.preshared_key {
        out.push_str(&format!("PresharedKey = {}\n", psk));
    }
    out.push_str(&format!("AllowedIPs = {}\n", join_nets(&peer.routed_ips())));
    if peer.persistent_keepalive > 0 {
        out.push_str(&format!("PersistentKeepalive = {}\n", peer.persistent_keepalive));
    }
    if let Some(extensions) = &peer.extensions {
        for line in extensions.lines().filter(|l| !l.trim().is_empty()) {
            out.push_str(line);
            out.push('\n');
        }
    }
    Ok(())
}

/// Client-side config handed to the peer (file download, QR payload)
pub fn render_client_config(iface: Interface<'_>, peer: &Peer) -> Result<String, PeerGuardError> {
    let settings = iface.settings;
    let private_key = peer
        .private_key
        .as_deref()
        .ok_or_else(|| ValidationError::NoPrivateKey {
            id: peer.id.to_string(),
        })?;
    require_key(&iface.record.public_key, "interface public key")?;

    let mut out = String::new();
    out.push_str("[Interface]\n");
    out.push_str(&format!("PrivateKey = {}\n", private_key));
    out.push_str(&format!("Address = {}/24\n", peer.address));
    if !settings.dns.is_empty() {
        out.push_str(&format!("DNS = {}\n", join_addrs(&settings.dns)));
    }
    if let Some(mtu) = settings.mtu {
        out.push_str(&format!("MTU = {}\n", mtu));
    }

    out.push('\n');
    out.push_str("[Peer]\n");
    out.push_str(&format!("PublicKey = {}\n", iface.record.public_key));
    if let Some(psk) = &peer.preshared_key {
        out.push_str(&format!("PresharedKey = {}\n", psk));
    }
    let allowed = peer.allowed_ips.as_ref().unwrap_or(&settings.allowed_ips);
    out.push_str(&format!("AllowedIPs = {}\n", join_nets(allowed)));
    out.push_str(&format!("PersistentKeepalive = {}\n", peer.persistent_keepalive));
    out.push_str(&format!("Endpoint = {}\n", settings.endpoint()));
    Ok(out)
}

/// Download file stem for a peer's config
pub fn config_file_name(name: &str, id: &str) -> String {
    let mut stem = String::with_capacity(name.len());
    for c in name.chars() {
        let c = if c.is_ascii_alphanumeric() || "_=+.-".contains(c) {
            c
        } else {
            '-'
        };
        // Collapse runs of '-'
        if c == '-' && stem.ends_with('-') {
            continue;
        }
        stem.push(c);
    }
    let stem: String = stem.trim_end_matches('-').chars().take(32).collect();

    if stem.is_empty() {
        id.to_string()
    } else {
        stem
    }
}

fn require_key(key: &str, what: &str) -> Result<(), PeerGuardError> {
    if key.trim().is_empty() {
        return Err(PeerGuardError::internal(format!("{} is missing", what)));
    }
    Ok(())
}

fn single_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}

fn join_nets(nets: &[IpNet]) -> String {
    nets.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

fn join_addrs(addrs: &[IpAddr]) -> String {
    addrs.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}
