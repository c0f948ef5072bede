//! Transport address blocks describing how to reach an element or a registrar.

use std::{cmp::Ordering, fmt, net::IpAddr};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Maximum number of addresses in one block.
pub const MAX_PE_TRANSPORT_ADDRESSES: usize = 64;

/// Transport protocol of an address block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransportProtocol {
    /// SCTP.
    Sctp,
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// Any other IP protocol number.
    Other(u8),
}

impl TransportProtocol {
    /// IP protocol number.
    pub fn number(self) -> u8 {
        match self {
            TransportProtocol::Sctp => 132,
            TransportProtocol::Tcp => 6,
            TransportProtocol::Udp => 17,
            TransportProtocol::Other(n) => n,
        }
    }

    /// Maps an IP protocol number.
    pub fn from_number(n: u8) -> Self {
        match n {
            132 => TransportProtocol::Sctp,
            6 => TransportProtocol::Tcp,
            17 => TransportProtocol::Udp,
            n => TransportProtocol::Other(n),
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Sctp => write!(f, "SCTP"),
            TransportProtocol::Tcp => write!(f, "TCP"),
            TransportProtocol::Udp => write!(f, "UDP"),
            TransportProtocol::Other(n) => write!(f, "Protocol ${n:04x}"),
        }
    }
}

/// Reachability scope of an address, narrowest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AddressScope {
    /// Loopback.
    Loopback,
    /// Link-local.
    LinkLocal,
    /// Private or unique-local.
    SiteLocal,
    /// Globally routable.
    Global,
}

impl AddressScope {
    /// Classifies an address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => {
                if v4.is_loopback() {
                    AddressScope::Loopback
                } else if v4.is_link_local() {
                    AddressScope::LinkLocal
                } else if v4.is_private() {
                    AddressScope::SiteLocal
                } else {
                    AddressScope::Global
                }
            }
            IpAddr::V6(v6) => {
                let seg = v6.segments()[0];
                if v6.is_loopback() {
                    AddressScope::Loopback
                } else if seg & 0xffc0 == 0xfe80 {
                    AddressScope::LinkLocal
                } else if seg & 0xfe00 == 0xfc00 || seg & 0xffc0 == 0xfec0 {
                    AddressScope::SiteLocal
                } else {
                    AddressScope::Global
                }
            }
        }
    }
}

/// A set of addresses sharing protocol, port and flags.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransportAddressBlock {
    /// Transport protocol.
    pub protocol: TransportProtocol,
    /// Port, shared by all addresses.
    pub port: u16,
    /// Whether the pool uses an ASAP control channel over this transport.
    pub control_channel: bool,
    /// Addresses.
    pub addresses: Vec<IpAddr>,
}

impl TransportAddressBlock {
    /// Creates a block without the control channel flag.
    pub fn new(
        protocol: TransportProtocol,
        port: u16,
        addresses: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        TransportAddressBlock {
            protocol,
            port,
            control_channel: false,
            addresses: addresses.into_iter().collect(),
        }
    }

    /// Sets the control channel flag.
    pub fn with_control_channel(mut self, control_channel: bool) -> Self {
        self.control_channel = control_channel;
        self
    }

    /// Returns `true` if the block has a port and between 1 and
    /// [`MAX_PE_TRANSPORT_ADDRESSES`] addresses.
    pub fn is_usable(&self) -> bool {
        self.port != 0
            && !self.addresses.is_empty()
            && self.addresses.len() <= MAX_PE_TRANSPORT_ADDRESSES
    }

    /// Returns `true` if both blocks share port, protocol and flags and at least one address.
    pub fn overlaps(&self, other: &TransportAddressBlock) -> bool {
        self.protocol == other.protocol
            && self.port == other.port
            && self.control_channel == other.control_channel
            && self
                .addresses
                .iter()
                .any(|addr| other.addresses.contains(addr))
    }

    /// Orders blocks like [`Ord`], except that overlapping blocks compare equal.
    pub fn overlap_cmp(&self, other: &TransportAddressBlock) -> Ordering {
        if self.overlaps(other) {
            Ordering::Equal
        } else {
            self.cmp(other)
        }
    }

    /// Keeps the addresses with at least `min_scope` that also appear in `association`, if
    /// given, returning `None` if nothing is left.
    ///
    /// With `filter_port`, an association block on another port filters out everything.
    pub fn filter(
        &self,
        association: Option<&TransportAddressBlock>,
        filter_port: bool,
        min_scope: AddressScope,
    ) -> Option<TransportAddressBlock> {
        if let Some(assoc) = association {
            if filter_port && assoc.port != self.port {
                return None;
            }
        }
        let addresses: Vec<_> = self
            .addresses
            .iter()
            .filter(|addr| AddressScope::of(addr) >= min_scope)
            .filter(|addr| association.map_or(true, |assoc| assoc.addresses.contains(addr)))
            .copied()
            .unique()
            .take(MAX_PE_TRANSPORT_ADDRESSES)
            .collect();
        if addresses.is_empty() {
            return None;
        }
        Some(TransportAddressBlock {
            addresses,
            ..self.clone()
        })
    }
}

impl fmt::Display for TransportAddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}}} {}/{}{}",
            self.addresses.iter().join(", "),
            self.port,
            self.protocol,
            if self.control_channel { "+CtrlCh" } else { "" }
        )
    }
}
