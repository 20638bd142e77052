//! Transport address blocks: one endpoint's protocol, port and addresses.
//!
//! An SCTP endpoint may be multi-homed and carry up to
//! [`MAX_PE_TRANSPORT_ADDRESSES`] addresses. TCP and UDP endpoints carry
//! exactly one. Blocks are plain values; whoever stores one owns its copy.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::RspError;
use crate::wire::{ParameterType, MAX_PE_TRANSPORT_ADDRESSES};

/// The endpoint offers the ASAP control channel on its data association.
pub const TABF_CONTROLCHANNEL: u16 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportProtocol {
    Sctp,
    Tcp,
    Udp,
}

impl TransportProtocol {
    /// Parameter type of the transport TLV for this protocol.
    pub fn parameter_type(self) -> ParameterType {
        match self {
            TransportProtocol::Sctp => ParameterType::SctpTransport,
            TransportProtocol::Tcp => ParameterType::TcpTransport,
            TransportProtocol::Udp => ParameterType::UdpTransport,
        }
    }

    pub fn from_parameter_type(parameter: ParameterType) -> Option<Self> {
        match parameter {
            ParameterType::SctpTransport => Some(TransportProtocol::Sctp),
            ParameterType::TcpTransport => Some(TransportProtocol::Tcp),
            ParameterType::UdpTransport => Some(TransportProtocol::Udp),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TransportProtocol::Sctp => "SCTP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Udp => "UDP",
        }
    }

    /// Only SCTP endpoints may be multi-homed.
    pub fn max_addresses(self) -> usize {
        match self {
            TransportProtocol::Sctp => MAX_PE_TRANSPORT_ADDRESSES,
            TransportProtocol::Tcp | TransportProtocol::Udp => 1,
        }
    }
}

// ── Address Scope ─────────────────────────────────────────────────────────────

/// Reachability class of an address, from least to most widely usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressScope {
    Unspecified,
    Loopback,
    LinkLocal,
    SiteLocal,
    Global,
}

impl AddressScope {
    pub fn of(address: &IpAddr) -> Self {
        match address {
            IpAddr::V4(v4) => Self::of_v4(v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Self::of_v4(&v4),
                None => Self::of_v6(v6),
            },
        }
    }

    fn of_v4(address: &Ipv4Addr) -> Self {
        if address.is_unspecified() || address.is_multicast() || address.is_broadcast() {
            AddressScope::Unspecified
        } else if address.is_loopback() {
            AddressScope::Loopback
        } else if address.is_link_local() {
            AddressScope::LinkLocal
        } else if address.is_private() {
            AddressScope::SiteLocal
        } else {
            AddressScope::Global
        }
    }

    fn of_v6(address: &Ipv6Addr) -> Self {
        let first = address.segments()[0];
        if address.is_unspecified() || address.is_multicast() {
            AddressScope::Unspecified
        } else if address.is_loopback() {
            AddressScope::Loopback
        } else if first & 0xffc0 == 0xfe80 {
            AddressScope::LinkLocal
        } else if first & 0xfe00 == 0xfc00 || first & 0xffc0 == 0xfec0 {
            AddressScope::SiteLocal
        } else {
            AddressScope::Global
        }
    }
}

/// Link-local addresses are useless to a receiver that cannot tell which
/// interface they belong to.
pub fn is_link_local(address: &IpAddr) -> bool {
    AddressScope::of(address) == AddressScope::LinkLocal
}

// ── Transport Address Block ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportAddressBlock {
    protocol: TransportProtocol,
    port: u16,
    flags: u16,
    addresses: Vec<IpAddr>,
}

impl TransportAddressBlock {
    /// Build a block. Fails with [`RspError::InvalidAddresses`] when there are
    /// no addresses, too many, or more than one for TCP/UDP.
    pub fn new(
        protocol: TransportProtocol,
        port: u16,
        flags: u16,
        addresses: Vec<IpAddr>,
    ) -> Result<Self, RspError> {
        if addresses.is_empty() || addresses.len() > protocol.max_addresses() {
            return Err(RspError::InvalidAddresses);
        }
        Ok(Self {
            protocol,
            port,
            flags,
            addresses,
        })
    }

    /// Single-address block for a socket address.
    pub fn from_socket_addr(protocol: TransportProtocol, address: SocketAddr, flags: u16) -> Self {
        Self {
            protocol,
            port: address.port(),
            flags,
            addresses: vec![address.ip()],
        }
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    pub fn has_control_channel(&self) -> bool {
        self.flags & TABF_CONTROLCHANNEL != 0
    }

    pub fn socket_addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.addresses
            .iter()
            .map(move |address| SocketAddr::new(*address, self.port))
    }

    pub fn contains(&self, address: &IpAddr) -> bool {
        self.addresses.contains(address)
    }

    /// Ordering that treats two blocks as the same endpoint when protocol,
    /// port and flags agree and they share at least one address.
    pub fn overlap_cmp(&self, other: &Self) -> Ordering {
        let same_endpoint = self.protocol == other.protocol
            && self.port == other.port
            && self.flags == other.flags;
        if same_endpoint && self.addresses.iter().any(|a| other.contains(a)) {
            return Ordering::Equal;
        }
        self.cmp(other)
    }

    /// Keep the addresses of at least `min_scope`. With an `association`,
    /// only addresses it also carries survive, and with `filter_port` its
    /// port must match as well. `None` when nothing is left.
    pub fn filter(
        &self,
        association: Option<&TransportAddressBlock>,
        filter_port: bool,
        min_scope: AddressScope,
    ) -> Option<TransportAddressBlock> {
        if let Some(association) = association {
            if filter_port && association.port != self.port {
                return None;
            }
        }
        let addresses: Vec<IpAddr> = self
            .addresses
            .iter()
            .filter(|address| AddressScope::of(address) >= min_scope)
            .filter(|address| association.map_or(true, |a| a.contains(address)))
            .copied()
            .take(self.protocol.max_addresses())
            .collect();
        if addresses.is_empty() {
            return None;
        }
        Some(TransportAddressBlock {
            protocol: self.protocol,
            port: self.port,
            flags: self.flags,
            addresses,
        })
    }
}

impl Ord for TransportAddressBlock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.protocol
            .cmp(&other.protocol)
            .then(self.port.cmp(&other.port))
            .then(self.flags.cmp(&other.flags))
            .then(self.addresses.len().cmp(&other.addresses.len()))
            .then_with(|| self.addresses.cmp(&other.addresses))
    }
}

impl PartialOrd for TransportAddressBlock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TransportAddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, address) in self.addresses.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{address}")?;
        }
        write!(f, "}} {}/{}", self.port, self.protocol.name())?;
        if self.has_control_channel() {
            f.write_str("+CtrlCh")?;
        }
        Ok(())
    }
}
