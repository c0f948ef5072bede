//! The list of peer registrars.
//!
//! Peers are indexed by identifier. Static peers that were configured by address only carry
//! the undefined identifier until their first presence arrives; those are ordered and found by
//! their address block instead. A second index orders peers by timer deadline.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    ops::{BitOr, Bound},
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    checksum::{ChecksumAccumulator, HandlespaceChecksum},
    clock::TimeStamp,
    element::{PoolElementIdentifier, RegistrarIdentifier, UNDEFINED_REGISTRAR_IDENTIFIER},
    error::{RegistrarError, Result},
    handlespace::PoolHandlespace,
    takeover::TakeoverProcess,
    transport::TransportAddressBlock,
};

/// Flags of a peer entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerFlags(u16);

impl PeerFlags {
    /// Configured peer.
    pub const STATIC: PeerFlags = PeerFlags(0);
    /// Peer learned at runtime.
    pub const DYNAMIC: PeerFlags = PeerFlags(1 << 0);
    /// Peer learned from another peer's list.
    pub const FROM_PEER: PeerFlags = PeerFlags(1 << 1);
    /// Entry was created by the last registration.
    pub const NEW: PeerFlags = PeerFlags(1 << 15);

    /// Returns `true` if all flags in `other` are set.
    pub fn contains(self, other: PeerFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the flags without `other`.
    pub fn without(self, other: PeerFlags) -> PeerFlags {
        PeerFlags(self.0 & !other.0)
    }
}

impl BitOr for PeerFlags {
    type Output = PeerFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        PeerFlags(self.0 | rhs.0)
    }
}

/// Synchronization state of a peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerStatus(u8);

impl PeerStatus {
    /// Peer list synchronization is in progress.
    pub const LISTSYNC: PeerStatus = PeerStatus(1 << 0);
    /// Handle table synchronization is in progress.
    pub const HTSYNC: PeerStatus = PeerStatus(1 << 1);
    /// Peer is the mentor used during startup.
    pub const MENTOR: PeerStatus = PeerStatus(1 << 2);

    /// Returns `true` if all bits in `other` are set.
    pub fn contains(self, other: PeerStatus) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits in `other`.
    pub fn insert(&mut self, other: PeerStatus) {
        self.0 |= other.0;
    }

    /// Clears the bits in `other`.
    pub fn remove(&mut self, other: PeerStatus) {
        self.0 &= !other.0;
    }
}

/// Timer scheduled for a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PeerTimer {
    /// Peer has been silent too long and gets probed.
    MaxTimeLastHeard,
    /// Probed peer did not answer.
    MaxTimeNoResponse,
    /// Own takeover of the peer ran out of time.
    TakeoverExpiry,
}

impl PeerTimer {
    /// Numeric timer code.
    pub fn code(self) -> u32 {
        match self {
            PeerTimer::MaxTimeLastHeard => 3000,
            PeerTimer::MaxTimeNoResponse => 3001,
            PeerTimer::TakeoverExpiry => 3002,
        }
    }
}

impl fmt::Display for PeerTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerTimer::MaxTimeLastHeard => write!(f, "MaxTimeLastHeard"),
            PeerTimer::MaxTimeNoResponse => write!(f, "MaxTimeNoResponse"),
            PeerTimer::TakeoverExpiry => write!(f, "TakeoverExpiry"),
        }
    }
}

/// Index position of a peer.
///
/// Peers with an identifier are keyed by it alone; peers without one by their addresses.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerKey {
    identifier: RegistrarIdentifier,
    address_block: Option<TransportAddressBlock>,
}

impl PeerKey {
    fn new(identifier: RegistrarIdentifier, address_block: &TransportAddressBlock) -> Self {
        PeerKey {
            identifier,
            address_block: (identifier == UNDEFINED_REGISTRAR_IDENTIFIER)
                .then(|| address_block.clone()),
        }
    }

    fn identified(identifier: RegistrarIdentifier) -> Self {
        PeerKey {
            identifier,
            address_block: None,
        }
    }

    /// Identifier of the peer.
    pub fn identifier(&self) -> RegistrarIdentifier {
        self.identifier
    }
}

/// A peer registrar.
#[derive(Clone, Debug)]
pub struct PeerListNode {
    identifier: RegistrarIdentifier,
    flags: PeerFlags,
    address_block: TransportAddressBlock,
    last_update: TimeStamp,
    timer: Option<(PeerTimer, TimeStamp)>,

    /// Synchronization state.
    pub status: PeerStatus,
    /// Registrar that announced a takeover of this peer.
    pub takeover_registrar_identifier: RegistrarIdentifier,
    /// Own takeover of this peer, if running.
    pub takeover_process: Option<TakeoverProcess>,
}

impl PeerListNode {
    fn new(
        identifier: RegistrarIdentifier,
        flags: PeerFlags,
        address_block: TransportAddressBlock,
    ) -> Self {
        PeerListNode {
            identifier,
            flags,
            address_block,
            last_update: 0,
            timer: None,
            status: PeerStatus::default(),
            takeover_registrar_identifier: UNDEFINED_REGISTRAR_IDENTIFIER,
            takeover_process: None,
        }
    }

    fn key(&self) -> PeerKey {
        PeerKey::new(self.identifier, &self.address_block)
    }

    /// Registrar identifier, undefined for unresolved static peers.
    pub fn identifier(&self) -> RegistrarIdentifier {
        self.identifier
    }

    /// Entry flags.
    pub fn flags(&self) -> PeerFlags {
        self.flags
    }

    /// Returns `true` if the entry was created by the last registration.
    pub fn is_new(&self) -> bool {
        self.flags.contains(PeerFlags::NEW)
    }

    /// Returns `true` for peers learned at runtime.
    pub fn is_dynamic(&self) -> bool {
        self.flags.contains(PeerFlags::DYNAMIC)
    }

    /// ENRP transport addresses.
    pub fn address_block(&self) -> &TransportAddressBlock {
        &self.address_block
    }

    /// Time of the last registration.
    pub fn last_update(&self) -> TimeStamp {
        self.last_update
    }

    /// Scheduled timer, if any.
    pub fn timer(&self) -> Option<(PeerTimer, TimeStamp)> {
        self.timer
    }
}

impl fmt::Display for PeerListNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:08x} upd={} flags=", self.identifier, self.last_update)?;
        if self.is_new() {
            write!(f, "[new]")?;
        }
        if self.is_dynamic() {
            write!(f, "[dynamic]")?;
        } else {
            write!(f, "(static)")?;
        }
        if self.flags.contains(PeerFlags::FROM_PEER) {
            write!(f, "[fromPeer]")?;
        }
        for (status, name) in [
            (PeerStatus::LISTSYNC, "LISTSYNC"),
            (PeerStatus::HTSYNC, "HTSYNC"),
            (PeerStatus::MENTOR, "MENTOR"),
        ] {
            if self.status.contains(status) {
                write!(f, " {name}")?;
            }
        }
        if self.takeover_process.is_some() {
            write!(f, " TAKEOVER(own)")?;
        }
        if self.takeover_registrar_identifier != UNDEFINED_REGISTRAR_IDENTIFIER {
            write!(f, " TAKEOVER(other)")?;
        }
        write!(f, " addrs={}", self.address_block)?;
        if let Some((timer, ts)) = self.timer {
            write!(f, " timer={timer}@{ts}")?;
        }
        Ok(())
    }
}

/// All known peer registrars.
#[derive(Clone, Debug)]
pub struct PeerListManagement {
    own_identifier: RegistrarIdentifier,
    peers: BTreeMap<PeerKey, PeerListNode>,
    timers: BTreeSet<(TimeStamp, PeerKey)>,
}

impl PeerListManagement {
    /// Creates an empty peer list.
    pub fn new(own_identifier: RegistrarIdentifier) -> Self {
        PeerListManagement {
            own_identifier,
            peers: BTreeMap::new(),
            timers: BTreeSet::new(),
        }
    }

    /// Own registrar identifier.
    pub fn own_identifier(&self) -> RegistrarIdentifier {
        self.own_identifier
    }

    /// Number of peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns `true` if no peers are known.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers in index order.
    pub fn iter(&self) -> impl Iterator<Item = &PeerListNode> + '_ {
        self.peers.values()
    }

    /// Looks up a peer by key.
    pub fn get(&self, key: &PeerKey) -> Option<&PeerListNode> {
        self.peers.get(key)
    }

    /// Looks up a peer by key, mutably.
    pub fn get_mut(&mut self, key: &PeerKey) -> Option<&mut PeerListNode> {
        self.peers.get_mut(key)
    }

    /// Finds a peer by identifier or, for the undefined identifier, by overlapping addresses.
    pub fn find(
        &self,
        identifier: RegistrarIdentifier,
        address_block: Option<&TransportAddressBlock>,
    ) -> Option<PeerKey> {
        if identifier != UNDEFINED_REGISTRAR_IDENTIFIER {
            let key = PeerKey::identified(identifier);
            return self.peers.contains_key(&key).then_some(key);
        }
        let address_block = address_block?;
        self.peers
            .values()
            .find(|peer| peer.address_block.overlaps(address_block))
            .map(PeerListNode::key)
    }

    /// Looks up a peer by identifier.
    pub fn find_by_identifier(&self, identifier: RegistrarIdentifier) -> Option<&PeerListNode> {
        self.peers.get(&PeerKey::identified(identifier))
    }

    /// The peer immediately before the given position in index order.
    pub fn find_nearest_prev(
        &self,
        identifier: RegistrarIdentifier,
        address_block: &TransportAddressBlock,
    ) -> Option<&PeerListNode> {
        let key = PeerKey::new(identifier, address_block);
        self.peers.range(..key).next_back().map(|(_, peer)| peer)
    }

    /// The peer immediately after the given position in index order.
    pub fn find_nearest_next(
        &self,
        identifier: RegistrarIdentifier,
        address_block: &TransportAddressBlock,
    ) -> Option<&PeerListNode> {
        let key = PeerKey::new(identifier, address_block);
        self.peers
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(_, peer)| peer)
    }

    /// Picks a peer uniformly at random.
    pub fn random_peer<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&PeerListNode> {
        if self.peers.is_empty() {
            return None;
        }
        let n = rng.random_range(0..self.peers.len());
        self.peers.values().nth(n)
    }

    /// Adds or updates a peer.
    ///
    /// Dynamic entries need an identifier; a dynamic registration matching a static entry
    /// assigns the identifier to the static entry instead. Static entries are configured by
    /// address only and must use the undefined identifier.
    pub fn register(
        &mut self,
        identifier: RegistrarIdentifier,
        flags: PeerFlags,
        address_block: TransportAddressBlock,
        now: TimeStamp,
    ) -> Result<PeerKey> {
        if flags.contains(PeerFlags::DYNAMIC) {
            if identifier == UNDEFINED_REGISTRAR_IDENTIFIER {
                return Err(RegistrarError::InvalidId);
            }
            let existing = self
                .find(identifier, None)
                .or_else(|| self.find(UNDEFINED_REGISTRAR_IDENTIFIER, Some(&address_block)));
            if let Some(key) = existing.filter(|key| !self.peers[key].is_dynamic()) {
                return self.resolve_static(key, identifier, now);
            }
        } else if identifier != UNDEFINED_REGISTRAR_IDENTIFIER {
            return Err(RegistrarError::InvalidId);
        }

        if self.own_identifier != UNDEFINED_REGISTRAR_IDENTIFIER
            && identifier == self.own_identifier
        {
            return Err(RegistrarError::OwnId);
        }

        let key = PeerKey::new(identifier, &address_block);
        match self.peers.get_mut(&key) {
            Some(peer) => {
                peer.flags = flags.without(PeerFlags::NEW);
                peer.address_block = address_block;
                peer.last_update = now;
            }
            None => {
                let mut peer = PeerListNode::new(identifier, flags | PeerFlags::NEW, address_block);
                peer.last_update = now;
                debug!(identifier = format_args!("${identifier:08x}"), addrs = %peer.address_block, "peer added");
                self.peers.insert(key.clone(), peer);
            }
        }
        Ok(key)
    }

    fn resolve_static(
        &mut self,
        key: PeerKey,
        identifier: RegistrarIdentifier,
        now: TimeStamp,
    ) -> Result<PeerKey> {
        if self.own_identifier != UNDEFINED_REGISTRAR_IDENTIFIER
            && identifier == self.own_identifier
        {
            return Err(RegistrarError::OwnId);
        }
        let timer = self.deactivate_timer(&key);
        let mut peer = self
            .peers
            .remove(&key)
            .ok_or_else(|| RegistrarError::internal("static peer vanished"))?;
        let was_unresolved = peer.identifier == UNDEFINED_REGISTRAR_IDENTIFIER;
        peer.identifier = identifier;
        peer.flags = if was_unresolved {
            peer.flags | PeerFlags::NEW
        } else {
            peer.flags.without(PeerFlags::NEW)
        };
        peer.last_update = now;
        if was_unresolved {
            debug!(identifier = format_args!("${identifier:08x}"), addrs = %peer.address_block, "static peer resolved");
        }

        let new_key = peer.key();
        self.peers.insert(new_key.clone(), peer);
        if let Some((timer, ts)) = timer {
            self.activate_timer(&new_key, timer, ts)?;
        }
        Ok(new_key)
    }

    /// Removes a peer found by identifier or address.
    pub fn deregister(
        &mut self,
        identifier: RegistrarIdentifier,
        address_block: Option<&TransportAddressBlock>,
    ) -> Result<()> {
        let key = self
            .find(identifier, address_block)
            .ok_or(RegistrarError::NotFound)?;
        self.deregister_by_key(&key)
    }

    /// Removes a peer.
    ///
    /// A static peer with an identifier is turned back into an address-only entry.
    pub fn deregister_by_key(&mut self, key: &PeerKey) -> Result<()> {
        self.deactivate_timer(key);
        let peer = self.peers.remove(key).ok_or(RegistrarError::NotFound)?;
        debug!(identifier = format_args!("${:08x}", peer.identifier), "peer removed");
        if !peer.is_dynamic() && peer.identifier != UNDEFINED_REGISTRAR_IDENTIFIER {
            let reverted = PeerListNode::new(
                UNDEFINED_REGISTRAR_IDENTIFIER,
                peer.flags,
                peer.address_block,
            );
            self.peers.insert(reverted.key(), reverted);
        }
        Ok(())
    }

    /// Schedules a timer for a peer, replacing any active one.
    pub fn activate_timer(&mut self, key: &PeerKey, timer: PeerTimer, ts: TimeStamp) -> Result<()> {
        self.deactivate_timer(key);
        let peer = self.peers.get_mut(key).ok_or(RegistrarError::NotFound)?;
        peer.timer = Some((timer, ts));
        self.timers.insert((ts, key.clone()));
        Ok(())
    }

    /// Cancels a peer's timer and returns it.
    pub fn deactivate_timer(&mut self, key: &PeerKey) -> Option<(PeerTimer, TimeStamp)> {
        let timer = self.peers.get_mut(key)?.timer.take()?;
        self.timers.remove(&(timer.1, key.clone()));
        Some(timer)
    }

    /// Deadline of the earliest peer timer.
    pub fn next_timer_timestamp(&self) -> Option<TimeStamp> {
        self.timers.first().map(|(ts, _)| *ts)
    }

    /// Peers whose timer is due at `now`, in deadline order.
    pub fn due_timers(&self, now: TimeStamp) -> Vec<PeerKey> {
        self.timers
            .iter()
            .take_while(|(ts, _)| *ts <= now)
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Schedules the no-response timer at the peer's last update plus `expiry_timeout`.
    pub fn restart_expiry_timer(&mut self, key: &PeerKey, expiry_timeout: u64) -> Result<()> {
        let last_update = self
            .peers
            .get(key)
            .ok_or(RegistrarError::NotFound)?
            .last_update;
        self.activate_timer(
            key,
            PeerTimer::MaxTimeNoResponse,
            last_update.saturating_add(expiry_timeout),
        )
    }

    /// Removes every peer whose no-response timer is due. Returns the number removed.
    pub fn purge_expired(&mut self, now: TimeStamp) -> Result<usize> {
        let expired: Vec<_> = self
            .due_timers(now)
            .into_iter()
            .filter(|key| {
                self.peers
                    .get(key)
                    .and_then(|peer| peer.timer)
                    .is_some_and(|(timer, _)| timer == PeerTimer::MaxTimeNoResponse)
            })
            .collect();
        for key in &expired {
            self.deregister_by_key(key)?;
        }
        Ok(expired.len())
    }

    /// The peer whose identifier is farthest from the element's, if it beats the own one.
    ///
    /// Distance is the XOR of the identifiers; the own registrar sets the bar.
    pub fn useful_peer_for_element(
        &self,
        element_identifier: PoolElementIdentifier,
    ) -> Option<&PeerListNode> {
        let own_metric = self.own_identifier ^ element_identifier;
        self.peers
            .values()
            .filter(|peer| peer.identifier != UNDEFINED_REGISTRAR_IDENTIFIER)
            .map(|peer| (peer.identifier ^ element_identifier, peer))
            .filter(|(metric, _)| *metric > own_metric)
            .max_by_key(|(metric, _)| *metric)
            .map(|(_, peer)| peer)
    }

    /// Ownership checksum of a peer as tracked by the handlespace.
    pub fn ownership_checksum(
        &self,
        identifier: RegistrarIdentifier,
        handlespace: &PoolHandlespace,
    ) -> Option<HandlespaceChecksum> {
        self.find_by_identifier(identifier)?;
        Some(
            handlespace
                .ownership_checksum_accumulator_of(identifier)
                .finish(),
        )
    }

    /// Compares every peer's tracked ownership checksum with one recomputed from scratch.
    pub fn verify_checksums_in_handlespace(&self, handlespace: &PoolHandlespace) -> Result<()> {
        for peer in self
            .peers
            .values()
            .filter(|peer| peer.identifier != UNDEFINED_REGISTRAR_IDENTIFIER)
        {
            let tracked: ChecksumAccumulator =
                handlespace.ownership_checksum_accumulator_of(peer.identifier);
            if tracked != handlespace.compute_ownership_checksum(peer.identifier) {
                return Err(RegistrarError::internal(format!(
                    "ownership checksum of peer ${:08x} is stale",
                    peer.identifier
                )));
            }
        }
        Ok(())
    }

    /// Checks that the timer index matches the peers' timers.
    pub fn verify(&self) -> Result<()> {
        let timers = self.peers.values().filter(|peer| peer.timer.is_some()).count();
        if timers != self.timers.len() {
            return Err(RegistrarError::internal(format!(
                "peer timer index has {} entries, {timers} peers have timers",
                self.timers.len()
            )));
        }
        for (ts, key) in &self.timers {
            let scheduled = self.peers.get(key).and_then(|peer| peer.timer);
            if scheduled.map(|(_, at)| at) != Some(*ts) {
                return Err(RegistrarError::internal("peer timer index out of sync"));
            }
        }
        Ok(())
    }

    /// Removes all peers.
    pub fn clear(&mut self) {
        self.peers.clear();
        self.timers.clear();
    }

    /// Writes the peer list, including ownership checksums taken from `handlespace`.
    pub fn describe(
        &self,
        handlespace: Option<&PoolHandlespace>,
        f: &mut impl fmt::Write,
    ) -> fmt::Result {
        writeln!(
            f,
            "Peer list of ${:08x}: {} peers",
            self.own_identifier,
            self.peers.len()
        )?;
        for peer in self.peers.values() {
            write!(f, "   - {peer}")?;
            if let Some(hs) = handlespace {
                write!(
                    f,
                    " chsum=${:04x}",
                    hs.ownership_checksum_accumulator_of(peer.identifier).finish()
                )?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Display for PeerListManagement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.describe(None, f)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::transport::TransportProtocol;

    fn addr(last: u8) -> TransportAddressBlock {
        TransportAddressBlock::new(
            TransportProtocol::Sctp,
            9901,
            [IpAddr::V4(Ipv4Addr::new(10, 1, 0, last))],
        )
    }

    fn list(ids: &[RegistrarIdentifier]) -> PeerListManagement {
        let mut peers = PeerListManagement::new(1);
        for id in ids {
            peers
                .register(*id, PeerFlags::DYNAMIC, addr(*id as u8), 10)
                .unwrap();
        }
        peers
    }

    #[test]
    fn register_validates_identifiers() {
        let mut peers = PeerListManagement::new(1);
        assert_eq!(
            peers.register(0, PeerFlags::DYNAMIC, addr(2), 0),
            Err(RegistrarError::InvalidId)
        );
        assert_eq!(
            peers.register(2, PeerFlags::STATIC, addr(2), 0),
            Err(RegistrarError::InvalidId)
        );
        assert_eq!(
            peers.register(1, PeerFlags::DYNAMIC, addr(1), 0),
            Err(RegistrarError::OwnId)
        );
        assert!(peers.is_empty());
    }

    #[test]
    fn reregistration_clears_new_flag() {
        let mut peers = PeerListManagement::new(1);
        let key = peers.register(2, PeerFlags::DYNAMIC, addr(2), 5).unwrap();
        assert!(peers.get(&key).unwrap().is_new());
        let again = peers.register(2, PeerFlags::DYNAMIC, addr(2), 9).unwrap();
        assert_eq!(again, key);
        let peer = peers.get(&key).unwrap();
        assert!(!peer.is_new());
        assert_eq!(peer.last_update(), 9);
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn static_peer_gets_identifier_and_reverts() {
        let mut peers = PeerListManagement::new(1);
        peers.register(0, PeerFlags::STATIC, addr(7), 0).unwrap();
        assert!(peers.find(0, Some(&addr(7))).is_some());

        let key = peers.register(7, PeerFlags::DYNAMIC, addr(7), 3).unwrap();
        let peer = peers.get(&key).unwrap();
        assert_eq!(peer.identifier(), 7);
        assert!(!peer.is_dynamic());
        assert!(peer.is_new());
        assert_eq!(peers.len(), 1);

        peers.deregister(7, None).unwrap();
        assert_eq!(peers.len(), 1);
        assert!(peers.find_by_identifier(7).is_none());
        assert!(peers.find(0, Some(&addr(7))).is_some());

        assert_eq!(peers.deregister(8, None), Err(RegistrarError::NotFound));
    }

    #[test]
    fn dynamic_peer_is_removed() {
        let mut peers = list(&[2, 3]);
        peers.deregister(2, None).unwrap();
        assert_eq!(peers.len(), 1);
        assert!(peers.find_by_identifier(2).is_none());
    }

    #[test]
    fn nearest_neighbours_follow_index_order() {
        let peers = list(&[2, 5, 9]);
        let prev = peers.find_nearest_prev(5, &addr(5)).unwrap();
        let next = peers.find_nearest_next(5, &addr(5)).unwrap();
        assert_eq!(prev.identifier(), 2);
        assert_eq!(next.identifier(), 9);
        assert_eq!(peers.find_nearest_next(6, &addr(6)).unwrap().identifier(), 9);
        assert!(peers.find_nearest_prev(2, &addr(2)).is_none());
        assert!(peers.find_nearest_next(9, &addr(9)).is_none());
    }

    #[test]
    fn random_peer_picks_known_peers() {
        let peers = list(&[2, 3, 4]);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let id = peers.random_peer(&mut rng).unwrap().identifier();
            assert!([2, 3, 4].contains(&id));
        }
        assert!(PeerListManagement::new(1).random_peer(&mut rng).is_none());
    }

    #[test]
    fn timers_expire_in_order() {
        let mut peers = list(&[2, 3]);
        let two = peers.find(2, None).unwrap();
        let three = peers.find(3, None).unwrap();
        peers.restart_expiry_timer(&two, 100).unwrap();
        peers
            .activate_timer(&three, PeerTimer::MaxTimeLastHeard, 50)
            .unwrap();
        assert_eq!(peers.next_timer_timestamp(), Some(50));
        assert_eq!(peers.due_timers(110), vec![three.clone(), two.clone()]);

        assert_eq!(peers.purge_expired(110), Ok(1));
        assert!(peers.find_by_identifier(2).is_none());
        assert_eq!(peers.next_timer_timestamp(), Some(50));
        peers.deactivate_timer(&three);
        assert_eq!(peers.next_timer_timestamp(), None);
        peers.verify().unwrap();
    }

    #[test]
    fn useful_peer_beats_own_metric() {
        let peers = list(&[2, 4, 8]);
        // own 1: metric 1 ^ 0 = 1, peers 2, 4, 8 -> 8 wins
        assert_eq!(peers.useful_peer_for_element(0).unwrap().identifier(), 8);
        // own 1 ^ 14 = 15 beats every peer
        assert!(peers.useful_peer_for_element(14).is_none());
    }

    #[test]
    fn display_shows_flags() {
        let mut peers = list(&[2]);
        peers.register(0, PeerFlags::STATIC, addr(9), 0).unwrap();
        let text = peers.to_string();
        assert!(text.contains("$00000002 upd=10 flags=[new][dynamic]"));
        assert!(text.contains("$00000000 upd=0 flags=[new](static)"));
    }
}
