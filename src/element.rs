//! Pool elements, the registered server instances of a pool.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    checksum::ChecksumAccumulator,
    clock::TimeStamp,
    policy::{PoolPolicySettings, SelectionKey},
    pool_handle::PoolHandle,
    transport::TransportAddressBlock,
};

/// Identifier of a pool element, unique within its pool.
pub type PoolElementIdentifier = u32;

/// Identifier of a registrar.
pub type RegistrarIdentifier = u32;

/// Reserved element identifier meaning "none".
pub const UNDEFINED_POOL_ELEMENT_IDENTIFIER: PoolElementIdentifier = 0;

/// Reserved registrar identifier meaning "none".
pub const UNDEFINED_REGISTRAR_IDENTIFIER: RegistrarIdentifier = 0;

/// Stable reference to an element stored in a handlespace.
///
/// Keys stay valid until the element is removed and may be reused afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementKey(pub(crate) usize);

/// Timer scheduled for a pool element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ElementTimer {
    /// Registration lifetime ran out.
    Expiry,
    /// Next keepalive is due.
    KeepAliveTransmission,
    /// Keepalive acknowledgement is overdue.
    KeepAliveTimeout,
}

impl ElementTimer {
    /// Numeric timer code.
    pub fn code(self) -> u32 {
        match self {
            ElementTimer::Expiry => 1000,
            ElementTimer::KeepAliveTransmission => 1001,
            ElementTimer::KeepAliveTimeout => 1002,
        }
    }
}

impl fmt::Display for ElementTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementTimer::Expiry => write!(f, "Expiry"),
            ElementTimer::KeepAliveTransmission => write!(f, "KeepAliveTransmission"),
            ElementTimer::KeepAliveTimeout => write!(f, "KeepAliveTimeout"),
        }
    }
}

/// The SCTP association an element registered over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Connection {
    /// Socket descriptor.
    pub socket_descriptor: i32,
    /// Association on the socket.
    pub assoc_id: u32,
}

impl Connection {
    /// Creates a connection reference.
    pub fn new(socket_descriptor: i32, assoc_id: u32) -> Self {
        Connection {
            socket_descriptor,
            assoc_id,
        }
    }
}

/// The fields of a registration or handle update, as received from an element or a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementRegistration {
    /// Element identifier.
    pub identifier: PoolElementIdentifier,
    /// Registrar the element is registered at.
    pub home_registrar_identifier: RegistrarIdentifier,
    /// Registration lifetime in microseconds.
    pub registration_life: u64,
    /// Policy settings.
    pub policy_settings: PoolPolicySettings,
    /// Addresses pool users connect to.
    pub user_transport: TransportAddressBlock,
    /// Addresses registrars reach the element's ASAP endpoint at.
    pub registrator_transport: Option<TransportAddressBlock>,
    /// Association the registration arrived on, `None` for entries learned from peers.
    pub connection: Option<Connection>,
}

/// A registered pool element.
#[derive(Clone, Debug)]
pub struct PoolElementNode {
    pub(crate) handle: PoolHandle,
    pub(crate) identifier: PoolElementIdentifier,
    pub(crate) home_registrar_identifier: RegistrarIdentifier,
    pub(crate) registration_life: u64,
    pub(crate) policy_settings: PoolPolicySettings,

    pub(crate) marked: bool,
    pub(crate) updated: bool,
    pub(crate) is_new: bool,

    pub(crate) seq_number: u32,
    pub(crate) round_counter: u32,
    pub(crate) virtual_counter: u32,
    pub(crate) degradation: u32,
    pub(crate) unreachability_reports: u32,
    pub(crate) selection_counter: u64,

    pub(crate) checksum: ChecksumAccumulator,
    pub(crate) selection_key: Option<SelectionKey>,
    pub(crate) timer: Option<(ElementTimer, TimeStamp)>,
    pub(crate) connection: Option<Connection>,

    pub(crate) user_transport: TransportAddressBlock,
    pub(crate) registrator_transport: Option<TransportAddressBlock>,

    pub(crate) last_update: TimeStamp,
    pub(crate) last_keep_alive_transmission: TimeStamp,
}

impl PoolElementNode {
    /// Creates an unlinked element from a registration.
    pub fn new(handle: PoolHandle, registration: ElementRegistration) -> Self {
        PoolElementNode {
            handle,
            identifier: registration.identifier,
            home_registrar_identifier: registration.home_registrar_identifier,
            registration_life: registration.registration_life,
            policy_settings: registration.policy_settings,
            marked: false,
            updated: false,
            is_new: false,
            seq_number: 0,
            round_counter: 0,
            virtual_counter: 0,
            degradation: 0,
            unreachability_reports: 0,
            selection_counter: 0,
            checksum: ChecksumAccumulator::INITIAL,
            selection_key: None,
            timer: None,
            connection: registration.connection,
            user_transport: registration.user_transport,
            registrator_transport: registration.registrator_transport,
            last_update: 0,
            last_keep_alive_transmission: 0,
        }
    }

    /// Handle of the owning pool.
    pub fn handle(&self) -> &PoolHandle {
        &self.handle
    }

    /// Element identifier.
    pub fn identifier(&self) -> PoolElementIdentifier {
        self.identifier
    }

    /// Registrar responsible for the element.
    pub fn home_registrar_identifier(&self) -> RegistrarIdentifier {
        self.home_registrar_identifier
    }

    /// Registration lifetime in microseconds.
    pub fn registration_life(&self) -> u64 {
        self.registration_life
    }

    /// Policy settings.
    pub fn policy_settings(&self) -> &PoolPolicySettings {
        &self.policy_settings
    }

    /// Set by mark operations, cleared by updates.
    pub fn is_marked(&self) -> bool {
        self.marked
    }

    /// Whether the last re-registration changed policy settings.
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    /// Whether the last registration created this element.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Position in the pool's selection sequence.
    pub fn seq_number(&self) -> u32 {
        self.seq_number
    }

    /// Weighted round robin round.
    pub fn round_counter(&self) -> u32 {
        self.round_counter
    }

    /// Selections left in the current weighted round robin round.
    pub fn virtual_counter(&self) -> u32 {
        self.virtual_counter
    }

    /// Load added by selections since the last update.
    pub fn degradation(&self) -> u32 {
        self.degradation
    }

    /// Unreachability reports received.
    pub fn unreachability_reports(&self) -> u32 {
        self.unreachability_reports
    }

    /// Number of times the element was selected.
    pub fn selection_counter(&self) -> u64 {
        self.selection_counter
    }

    /// Checksum contribution as stored in the handlespace.
    pub fn checksum(&self) -> ChecksumAccumulator {
        self.checksum
    }

    /// Scheduled timer, if any.
    pub fn timer(&self) -> Option<(ElementTimer, TimeStamp)> {
        self.timer
    }

    /// Connection the element registered over.
    pub fn connection(&self) -> Option<Connection> {
        self.connection
    }

    /// Addresses pool users connect to.
    pub fn user_transport(&self) -> &TransportAddressBlock {
        &self.user_transport
    }

    /// Addresses of the element's ASAP endpoint.
    pub fn registrator_transport(&self) -> Option<&TransportAddressBlock> {
        self.registrator_transport.as_ref()
    }

    /// Time of the last registration or handle update.
    pub fn last_update(&self) -> TimeStamp {
        self.last_update
    }

    /// Time the last keepalive was sent.
    pub fn last_keep_alive_transmission(&self) -> TimeStamp {
        self.last_keep_alive_transmission
    }

    /// Returns a registration describing this element, as used for handle updates to peers.
    pub fn to_registration(&self) -> ElementRegistration {
        ElementRegistration {
            identifier: self.identifier,
            home_registrar_identifier: self.home_registrar_identifier,
            registration_life: self.registration_life,
            policy_settings: self.policy_settings,
            user_transport: self.user_transport.clone(),
            registrator_transport: self.registrator_transport.clone(),
            connection: self.connection,
        }
    }

    /// Applies a re-registration's policy settings.
    ///
    /// Resets degradation and clamps the virtual counter to the new weight. Returns `true` if
    /// the settings changed or degradation had to be reset, which requires relinking the
    /// element in its pool's selection index.
    pub(crate) fn update(&mut self, source: &ElementRegistration) -> bool {
        self.marked = false;
        if self.policy_settings.differs(&source.policy_settings) || self.degradation != 0 {
            self.policy_settings = source.policy_settings;
            self.degradation = 0;
            self.virtual_counter = self.virtual_counter.min(self.policy_settings.weight);
            self.updated = true;
            return true;
        }
        self.updated = false;
        false
    }

    /// Computes the element's checksum contribution from its current fields.
    ///
    /// Covers the pool handle, identifier, home registrar, policy type, weight, load, load
    /// degradation and user transport. Local state such as distance and policy counters is
    /// left out so that all registrars arrive at the same value.
    pub fn compute_checksum(&self) -> ChecksumAccumulator {
        let pps = &self.policy_settings;
        let mut sum = ChecksumAccumulator::INITIAL
            .compute(self.handle.as_bytes())
            .compute(&self.identifier.to_be_bytes())
            .compute(&self.home_registrar_identifier.to_be_bytes())
            .compute(&pps.policy_type.to_be_bytes())
            .compute(&pps.weight.to_be_bytes())
            .compute(&pps.load.to_be_bytes())
            .compute(&pps.load_degradation.to_be_bytes());

        let transport = &self.user_transport;
        sum = sum
            .compute(&[transport.protocol.number(), u8::from(transport.control_channel)])
            .compute(&transport.port.to_be_bytes());
        for addr in &transport.addresses {
            sum = match addr {
                std::net::IpAddr::V4(v4) => sum.compute(&v4.octets()),
                std::net::IpAddr::V6(v6) => sum.compute(&v6.octets()),
            };
        }
        sum
    }
}

impl fmt::Display for PoolElementNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#${:08x} seq={} home=${:08x} life={}ms {} ureports={} chsum={}",
            self.identifier,
            self.seq_number,
            self.home_registrar_identifier,
            self.registration_life / 1000,
            self.policy_settings,
            self.unreachability_reports,
            self.checksum,
        )?;
        if self.marked {
            write!(f, " [marked]")?;
        }
        write!(f, " user={}", self.user_transport)?;
        if let Some(registrator) = &self.registrator_transport {
            write!(f, " asap={registrator}")?;
        }
        if let Some(conn) = &self.connection {
            write!(f, " sd={} assoc={}", conn.socket_descriptor, conn.assoc_id)?;
        }
        if let Some((timer, ts)) = &self.timer {
            write!(f, " timer={timer}@{ts}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::transport::TransportProtocol;

    pub(crate) fn registration(id: PoolElementIdentifier, policy_type: u32) -> ElementRegistration {
        ElementRegistration {
            identifier: id,
            home_registrar_identifier: 1,
            registration_life: 30_000_000,
            policy_settings: PoolPolicySettings {
                weight: 2,
                ..PoolPolicySettings::new(policy_type)
            },
            user_transport: TransportAddressBlock::new(
                TransportProtocol::Sctp,
                7,
                [IpAddr::V4(Ipv4Addr::new(10, 0, 0, (id % 250) as u8 + 1))],
            ),
            registrator_transport: None,
            connection: None,
        }
    }

    #[test]
    fn update_detects_policy_change() {
        let handle = PoolHandle::try_from("EchoPool").unwrap();
        let mut node = PoolElementNode::new(handle, registration(5, 2));
        node.virtual_counter = 2;
        node.marked = true;

        let same = registration(5, 2);
        assert!(!node.update(&same));
        assert!(!node.marked);
        assert!(!node.updated);

        let mut heavier = registration(5, 2);
        heavier.policy_settings.weight = 1;
        assert!(node.update(&heavier));
        assert!(node.updated);
        assert_eq!(node.virtual_counter, 1);
    }

    #[test]
    fn update_resets_degradation() {
        let handle = PoolHandle::try_from("EchoPool").unwrap();
        let mut node = PoolElementNode::new(handle, registration(5, 2));
        node.degradation = 100;
        assert!(node.update(&registration(5, 2)));
        assert_eq!(node.degradation, 0);
    }

    #[test]
    fn checksum_ignores_local_state() {
        let handle = PoolHandle::try_from("EchoPool").unwrap();
        let mut node = PoolElementNode::new(handle, registration(5, 2));
        let before = node.compute_checksum();
        node.seq_number = 99;
        node.policy_settings.distance = 400;
        assert_eq!(node.compute_checksum(), before);
        node.home_registrar_identifier = 2;
        assert_ne!(node.compute_checksum(), before);
    }

    #[test]
    fn checksum_covers_user_transport() {
        let handle = PoolHandle::try_from("EchoPool").unwrap();
        let mut node = PoolElementNode::new(handle, registration(5, 2));
        let before = node.compute_checksum();
        node.user_transport.port += 1;
        let moved = node.compute_checksum();
        assert_ne!(moved, before);
        node.user_transport.addresses.clear();
        assert_ne!(node.compute_checksum(), moved);
    }
}
