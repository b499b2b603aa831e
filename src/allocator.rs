//! Address allocation inside the interface subnet
//!
//! The subnet is written as a template with a free last octet (`10.8.0.x`).
//! Host `.1` belongs to the interface; peers get `.2` through `.254`, handed
//! out lowest first.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;

use crate::error::{ConfigError, PeerGuardError, ValidationError};
use crate::model::PeerId;

/// Host value of the interface's own address
pub const INTERFACE_HOST: u8 = 1;

const FIRST_PEER_HOST: u8 = 2;
const LAST_PEER_HOST: u8 = 254;

/// Subnet template such as `10.8.0.x`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressTemplate {
    prefix: [u8; 3],
}

impl AddressTemplate {
    pub fn with_host(&self, host: u8) -> Ipv4Addr {
        let [a, b, c] = self.prefix;
        Ipv4Addr::new(a, b, c, host)
    }

    /// The interface's own address (`a.b.c.1`)
    pub fn interface_address(&self) -> Ipv4Addr {
        self.with_host(INTERFACE_HOST)
    }

    /// The `/24` network the template spans
    pub fn subnet(&self) -> Ipv4Net {
        // Prefix length 24 is always valid for IPv4
        Ipv4Net::new(self.with_host(0), 24).unwrap_or_default()
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        address.octets()[..3] == self.prefix
    }
}

impl FromStr for AddressTemplate {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidTemplate {
            value: s.to_string(),
        };

        let octets: Vec<&str> = s.trim().split('.').collect();
        if octets.len() != 4 || !octets[3].eq_ignore_ascii_case("x") {
            return Err(invalid());
        }

        let mut prefix = [0u8; 3];
        for (slot, octet) in prefix.iter_mut().zip(&octets[..3]) {
            *slot = octet.parse().map_err(|_| invalid())?;
        }
        Ok(Self { prefix })
    }
}

impl fmt::Display for AddressTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.prefix;
        write!(f, "{}.{}.{}.x", a, b, c)
    }
}

/// Tracks which addresses of the subnet are assigned and to whom
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    template: AddressTemplate,
    assigned: BTreeMap<Ipv4Addr, PeerId>,
}

impl AddressAllocator {
    pub fn new(template: AddressTemplate) -> Self {
        Self {
            template,
            assigned: BTreeMap::new(),
        }
    }

    /// Reserve the first free host for `owner`
    pub fn allocate(&mut self, owner: PeerId) -> Result<Ipv4Addr, PeerGuardError> {
        let free = (FIRST_PEER_HOST..=LAST_PEER_HOST)
            .map(|host| self.template.with_host(host))
            .find(|address| !self.assigned.contains_key(address));

        match free {
            Some(address) => {
                self.assigned.insert(address, owner);
                Ok(address)
            }
            None => Err(PeerGuardError::AddressSpaceExhausted {
                subnet: self.template.subnet().to_string(),
            }),
        }
    }

    /// Return an address to the pool. Releasing a free address is a no-op.
    pub fn release(&mut self, address: Ipv4Addr) {
        self.assigned.remove(&address);
    }

    /// Check that `owner` may take `address`
    pub fn validate(&self, address: Ipv4Addr, owner: PeerId) -> Result<(), PeerGuardError> {
        if !self.template.contains(address) {
            return Err(ValidationError::OutsideSubnet {
                address,
                subnet: self.template.subnet().to_string(),
            }
            .into());
        }

        let host = address.octets()[3];
        if !(FIRST_PEER_HOST..=LAST_PEER_HOST).contains(&host) {
            return Err(ValidationError::ReservedAddress { address }.into());
        }

        match self.assigned.get(&address) {
            Some(current) if *current != owner => Err(PeerGuardError::AddressInUse { address }),
            _ => Ok(()),
        }
    }

    /// Record an existing assignment (startup, migration, re-address)
    pub fn assign(&mut self, address: Ipv4Addr, owner: PeerId) -> Result<(), PeerGuardError> {
        match self.assigned.get(&address) {
            Some(current) if *current != owner => Err(PeerGuardError::AddressInUse { address }),
            _ => {
                self.assigned.insert(address, owner);
                Ok(())
            }
        }
    }

    pub fn assigned_count(&self) -> usize {
        self.assigned.len()
    }
}
