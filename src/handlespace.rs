//! The handlespace: all pools and elements known to a registrar.
//!
//! Elements are stored once in a slab and addressed by [`ElementKey`]. Besides the per-pool
//! indices, the handlespace keeps three global indices over them:
//!
//! - the **timer** index, ordered by deadline, element identifier and pool handle,
//! - the **connection** index, grouping elements by the association they registered over,
//!   ordered by element identifier and pool handle within a connection,
//! - the **ownership** index, ordered by home registrar, pool handle and element identifier.
//!
//! Removing an element unlinks it from every index before the slab entry is freed, so a
//! scheduled timer can never fire for an element that no longer exists.
//!
//! Checksums are maintained incrementally: every element carries its contribution, which is
//! added to the handlespace checksum and to the checksum of its home registrar on insertion
//! and subtracted on removal.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    ops::Bound,
};

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    checksum::{ChecksumAccumulator, HandlespaceChecksum},
    clock::TimeStamp,
    element::{
        Connection, ElementKey, ElementRegistration, ElementTimer, PoolElementIdentifier,
        PoolElementNode, RegistrarIdentifier, UNDEFINED_REGISTRAR_IDENTIFIER,
    },
    error::{RegistrarError, Result},
    policy::PoolPolicy,
    pool::{ElementSlab, PoolNode},
    pool_handle::PoolHandle,
};

/// Kind of change reported to a [`HandlespaceObserver`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateAction {
    /// An element was added.
    Create = 1,
    /// An element was removed.
    Delete = 2,
    /// An element's ownership or contents changed.
    Update = 3,
}

/// An element change, as reported to observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlespaceChange {
    /// What happened.
    pub action: UpdateAction,
    /// Pool handle of the element.
    pub handle: PoolHandle,
    /// Element identifier.
    pub identifier: PoolElementIdentifier,
    /// Home registrar after the change.
    pub home_registrar_identifier: RegistrarIdentifier,
    /// Checksum contribution after the change.
    pub checksum: ChecksumAccumulator,
    /// Checksum contribution before the change.
    pub pre_checksum: ChecksumAccumulator,
    /// Home registrar before the change.
    pub pre_home_registrar_identifier: RegistrarIdentifier,
}

/// Receives element changes as they are applied.
pub trait HandlespaceObserver: Send + 'static {
    /// Called synchronously after each create, update or delete.
    fn element_changed(&mut self, change: &HandlespaceChange);
}

impl HandlespaceObserver for tokio::sync::mpsc::UnboundedSender<HandlespaceChange> {
    fn element_changed(&mut self, change: &HandlespaceChange) {
        // A closed receiver just means nobody is listening anymore.
        let _ = self.send(change.clone());
    }
}

type TimerEntry = (TimeStamp, PoolElementIdentifier, PoolHandle, ElementKey);
type ConnectionEntry = (Connection, PoolElementIdentifier, PoolHandle, ElementKey);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct OwnerTotals {
    elements: usize,
    checksum: ChecksumAccumulator,
}

/// The pools, elements and global indices of a registrar.
pub struct PoolHandlespace {
    home_registrar_identifier: RegistrarIdentifier,
    elements: ElementSlab,
    pools: BTreeMap<PoolHandle, PoolNode>,
    timers: BTreeSet<TimerEntry>,
    connections: BTreeSet<ConnectionEntry>,
    ownership: BTreeMap<(RegistrarIdentifier, PoolHandle, PoolElementIdentifier), ElementKey>,
    owners: BTreeMap<RegistrarIdentifier, OwnerTotals>,
    handlespace_checksum: ChecksumAccumulator,
    rng: StdRng,
    observer: Option<Box<dyn HandlespaceObserver>>,
}

impl fmt::Debug for PoolHandlespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandlespace")
            .field("home_registrar_identifier", &self.home_registrar_identifier)
            .field("pools", &self.pools.len())
            .field("elements", &self.elements.len())
            .field("timers", &self.timers.len())
            .field("handlespace_checksum", &self.handlespace_checksum)
            .finish_non_exhaustive()
    }
}

impl PoolHandlespace {
    /// Creates an empty handlespace for the given own registrar identifier.
    pub fn new(home_registrar_identifier: RegistrarIdentifier) -> Self {
        Self::with_rng(home_registrar_identifier, StdRng::from_os_rng())
    }

    /// Creates an empty handlespace whose randomized policies draw from a seeded generator.
    pub fn with_seed(home_registrar_identifier: RegistrarIdentifier, seed: u64) -> Self {
        Self::with_rng(home_registrar_identifier, StdRng::seed_from_u64(seed))
    }

    fn with_rng(home_registrar_identifier: RegistrarIdentifier, rng: StdRng) -> Self {
        PoolHandlespace {
            home_registrar_identifier,
            elements: ElementSlab::new(),
            pools: BTreeMap::new(),
            timers: BTreeSet::new(),
            connections: BTreeSet::new(),
            ownership: BTreeMap::new(),
            owners: BTreeMap::new(),
            handlespace_checksum: ChecksumAccumulator::INITIAL,
            rng,
            observer: None,
        }
    }

    /// Installs the observer notified about element changes.
    pub fn set_observer(&mut self, observer: impl HandlespaceObserver) {
        self.observer = Some(Box::new(observer));
    }

    /// Removes the observer.
    pub fn clear_observer(&mut self) {
        self.observer = None;
    }

    /// Own registrar identifier.
    pub fn home_registrar_identifier(&self) -> RegistrarIdentifier {
        self.home_registrar_identifier
    }

    /// Number of pools.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Number of elements.
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Number of elements owned by this registrar.
    pub fn owned_element_count(&self) -> usize {
        self.owned_element_count_of(self.home_registrar_identifier)
    }

    /// Number of elements owned by a registrar.
    pub fn owned_element_count_of(&self, owner: RegistrarIdentifier) -> usize {
        self.owners.get(&owner).map_or(0, |totals| totals.elements)
    }

    /// Number of elements of a pool, `0` if the pool does not exist.
    pub fn pool_element_count(&self, handle: &PoolHandle) -> usize {
        self.pools.get(handle).map_or(0, PoolNode::len)
    }

    /// Number of elements registered over a connection.
    pub fn connection_element_count(&self, connection: Connection) -> usize {
        self.connection_range(connection).count()
    }

    /// Number of active element timers.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Returns `true` if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Looks up a pool.
    pub fn pool(&self, handle: &PoolHandle) -> Option<&PoolNode> {
        self.pools.get(handle)
    }

    /// Pools in handle order.
    pub fn pools(&self) -> impl Iterator<Item = &PoolNode> + '_ {
        self.pools.values()
    }

    /// Pools with a handle greater than or equal to `handle`, in handle order.
    pub fn pools_from<'a>(
        &'a self,
        handle: &PoolHandle,
    ) -> impl Iterator<Item = &'a PoolNode> + 'a {
        self.pools
            .range((Bound::Included(handle.clone()), Bound::Unbounded))
            .map(|(_, pool)| pool)
    }

    /// Looks up an element by key.
    pub fn element(&self, key: ElementKey) -> Option<&PoolElementNode> {
        self.elements.get(key.0)
    }

    pub(crate) fn element_mut(&mut self, key: ElementKey) -> Option<&mut PoolElementNode> {
        self.elements.get_mut(key.0)
    }

    /// Finds an element by pool handle and identifier.
    pub fn find_element(
        &self,
        handle: &PoolHandle,
        identifier: PoolElementIdentifier,
    ) -> Option<ElementKey> {
        self.pools.get(handle)?.find(identifier)
    }

    /// Adds a new element or updates an existing one with the same identifier.
    ///
    /// The pool is created on demand, using the policy and the user transport's protocol and
    /// control channel flag. Returns the element's key and whether it was newly created. The
    /// caller sets the element's last update time.
    pub fn add_or_update(
        &mut self,
        handle: &PoolHandle,
        policy: PoolPolicy,
        registration: ElementRegistration,
    ) -> Result<(ElementKey, bool)> {
        let created_pool = !self.pools.contains_key(handle);
        if created_pool {
            let pool = PoolNode::new(
                handle.clone(),
                policy,
                registration.user_transport.protocol,
                registration.user_transport.control_channel,
            );
            self.pools.insert(handle.clone(), pool);
            trace!(%handle, %policy, "pool created");
        }

        let res = match self.find_element(handle, registration.identifier) {
            Some(key) => self.update_element(handle, key, registration).map(|()| (key, false)),
            None => self.insert_element(handle, registration).map(|key| (key, true)),
        };

        if res.is_err() && created_pool {
            self.pools.remove(handle);
        }
        res
    }

    fn insert_element(
        &mut self,
        handle: &PoolHandle,
        registration: ElementRegistration,
    ) -> Result<ElementKey> {
        let pool = self
            .pools
            .get_mut(handle)
            .ok_or_else(|| RegistrarError::internal("pool vanished during insert"))?;
        let key = pool.add(&mut self.elements, registration)?;

        let node = &mut self.elements[key.0];
        let home = node.home_registrar_identifier;
        let identifier = node.identifier;
        if home != UNDEFINED_REGISTRAR_IDENTIFIER {
            self.ownership.insert((home, handle.clone(), identifier), key);
        }
        if let Some(conn) = node.connection.filter(|conn| conn.socket_descriptor > 0) {
            self.connections.insert((conn, identifier, handle.clone(), key));
        }

        node.checksum = node.compute_checksum();
        node.is_new = true;
        let checksum = node.checksum;
        self.handlespace_checksum += checksum;
        self.add_owner_contribution(home, checksum);

        debug!(%handle, identifier = format_args!("${identifier:08x}"), home = format_args!("${home:08x}"), "element added");
        self.notify(HandlespaceChange {
            action: UpdateAction::Create,
            handle: handle.clone(),
            identifier,
            home_registrar_identifier: home,
            checksum,
            pre_checksum: ChecksumAccumulator::INITIAL,
            pre_home_registrar_identifier: UNDEFINED_REGISTRAR_IDENTIFIER,
        });
        Ok(key)
    }

    fn update_element(
        &mut self,
        handle: &PoolHandle,
        key: ElementKey,
        registration: ElementRegistration,
    ) -> Result<()> {
        let pool = self
            .pools
            .get_mut(handle)
            .ok_or_else(|| RegistrarError::internal("pool vanished during update"))?;
        pool.update(&mut self.elements, key, &registration)?;

        let node = &mut self.elements[key.0];
        if node.connection != registration.connection {
            let identifier = node.identifier;
            if let Some(old) = node.connection {
                self.connections.remove(&(old, identifier, handle.clone(), key));
            }
            node.connection = registration.connection;
            if let Some(conn) = node.connection.filter(|conn| conn.socket_descriptor > 0) {
                self.connections.insert((conn, identifier, handle.clone(), key));
            }
        }
        node.registration_life = registration.registration_life;
        node.user_transport = registration.user_transport;
        node.registrator_transport = registration.registrator_transport;

        self.update_ownership(key, registration.home_registrar_identifier)?;
        if let Some(node) = self.elements.get_mut(key.0) {
            node.is_new = false;
        }
        Ok(())
    }

    /// Reassigns an element to a new home registrar and recomputes its checksum.
    ///
    /// Also clears the element's mark.
    pub fn update_ownership(
        &mut self,
        key: ElementKey,
        new_home: RegistrarIdentifier,
    ) -> Result<()> {
        let node = self
            .elements
            .get_mut(key.0)
            .ok_or(RegistrarError::NotFound)?;
        let pre_checksum = node.checksum;
        let pre_home = node.home_registrar_identifier;
        let handle = node.handle.clone();
        let identifier = node.identifier;

        if pre_home != new_home {
            if pre_home != UNDEFINED_REGISTRAR_IDENTIFIER {
                self.ownership.remove(&(pre_home, handle.clone(), identifier));
            }
            node.home_registrar_identifier = new_home;
            if new_home != UNDEFINED_REGISTRAR_IDENTIFIER {
                self.ownership.insert((new_home, handle.clone(), identifier), key);
            }
            node.updated = true;
        } else {
            node.updated = false;
        }
        node.marked = false;
        node.checksum = node.compute_checksum();
        let checksum = node.checksum;

        self.handlespace_checksum -= pre_checksum;
        self.remove_owner_contribution(pre_home, pre_checksum);
        self.handlespace_checksum += checksum;
        self.add_owner_contribution(new_home, checksum);

        if pre_home != new_home {
            debug!(%handle, identifier = format_args!("${identifier:08x}"), from = format_args!("${pre_home:08x}"), to = format_args!("${new_home:08x}"), "element ownership changed");
        }
        self.notify(HandlespaceChange {
            action: UpdateAction::Update,
            handle,
            identifier,
            home_registrar_identifier: new_home,
            checksum,
            pre_checksum,
            pre_home_registrar_identifier: pre_home,
        });
        Ok(())
    }

    /// Removes an element from every index and returns it.
    ///
    /// A pool left without elements is removed as well.
    pub fn remove(&mut self, key: ElementKey) -> Result<PoolElementNode> {
        let node = self.elements.get(key.0).ok_or(RegistrarError::NotFound)?;
        let handle = node.handle.clone();
        let identifier = node.identifier;
        let home = node.home_registrar_identifier;

        if let Some((_, ts)) = node.timer {
            self.timers.remove(&(ts, identifier, handle.clone(), key));
        }
        if home != UNDEFINED_REGISTRAR_IDENTIFIER {
            self.ownership.remove(&(home, handle.clone(), identifier));
        }
        if let Some(conn) = node.connection {
            self.connections.remove(&(conn, identifier, handle.clone(), key));
        }

        let pool = self
            .pools
            .get_mut(&handle)
            .ok_or_else(|| RegistrarError::internal("element without pool"))?;
        pool.remove(&mut self.elements, key);
        let pool_is_empty = pool.is_empty();

        let mut node = self.elements.remove(key.0);
        node.timer = None;
        self.handlespace_checksum -= node.checksum;
        self.remove_owner_contribution(home, node.checksum);

        if pool_is_empty {
            self.pools.remove(&handle);
            trace!(%handle, "pool removed");
        }

        debug!(%handle, identifier = format_args!("${identifier:08x}"), "element removed");
        self.notify(HandlespaceChange {
            action: UpdateAction::Delete,
            handle,
            identifier,
            home_registrar_identifier: home,
            checksum: node.checksum,
            pre_checksum: node.checksum,
            pre_home_registrar_identifier: home,
        });
        Ok(node)
    }

    /// Selects elements of a pool according to its policy.
    pub fn select(
        &mut self,
        handle: &PoolHandle,
        max_elements: usize,
        max_increment: usize,
    ) -> Result<Vec<ElementKey>> {
        let pool = self.pools.get_mut(handle).ok_or(RegistrarError::NotFound)?;
        Ok(pool.select(&mut self.elements, &mut self.rng, max_elements, max_increment))
    }

    /// Schedules a timer for an element, replacing any active one.
    pub fn activate_timer(
        &mut self,
        key: ElementKey,
        timer: ElementTimer,
        ts: TimeStamp,
    ) -> Result<()> {
        self.deactivate_timer(key)?;
        let node = self
            .elements
            .get_mut(key.0)
            .ok_or(RegistrarError::NotFound)?;
        node.timer = Some((timer, ts));
        self.timers
            .insert((ts, node.identifier, node.handle.clone(), key));
        Ok(())
    }

    /// Cancels an element's timer. Returns the cancelled timer, if any.
    pub fn deactivate_timer(&mut self, key: ElementKey) -> Result<Option<ElementTimer>> {
        let node = self
            .elements
            .get_mut(key.0)
            .ok_or(RegistrarError::NotFound)?;
        let Some((timer, ts)) = node.timer.take() else {
            return Ok(None);
        };
        self.timers
            .remove(&(ts, node.identifier, node.handle.clone(), key));
        Ok(Some(timer))
    }

    /// The element with the earliest timer.
    pub fn first_timer(&self) -> Option<(TimeStamp, ElementKey)> {
        self.timers.first().map(|(ts, _, _, key)| (*ts, *key))
    }

    /// Deadline of the earliest timer.
    pub fn next_timer_timestamp(&self) -> Option<TimeStamp> {
        self.first_timer().map(|(ts, _)| ts)
    }

    /// Elements whose timer is due at `now`, in deadline order.
    ///
    /// Elements with the same deadline are ordered by identifier, then by pool handle.
    pub fn due_timers(&self, now: TimeStamp) -> Vec<ElementKey> {
        self.timers
            .iter()
            .take_while(|(ts, ..)| *ts <= now)
            .map(|(.., key)| *key)
            .collect()
    }

    /// Elements registered over a connection.
    pub fn elements_of_connection(&self, connection: Connection) -> Vec<ElementKey> {
        self.connection_range(connection).collect()
    }

    fn connection_range(&self, connection: Connection) -> impl Iterator<Item = ElementKey> + '_ {
        let start = (connection, 0, PoolHandle::default(), ElementKey(0));
        self.connections
            .range(start..)
            .take_while(move |(conn, ..)| *conn == connection)
            .map(|(.., key)| *key)
    }

    /// Elements owned by a registrar, in (handle, identifier) order.
    pub fn elements_owned_by(&self, owner: RegistrarIdentifier) -> Vec<ElementKey> {
        self.ownership_range(owner, None).map(|(_, key)| key).collect()
    }

    /// Ownership entries of `owner` after the given (handle, identifier) cursor, or from the
    /// start without a cursor.
    pub(crate) fn ownership_range<'a>(
        &'a self,
        owner: RegistrarIdentifier,
        after: Option<(&PoolHandle, PoolElementIdentifier)>,
    ) -> impl Iterator<Item = ((PoolHandle, PoolElementIdentifier), ElementKey)> + 'a {
        let start = match after {
            Some((handle, id)) => Bound::Excluded((owner, handle.clone(), id)),
            None => Bound::Included((owner, PoolHandle::default(), 0)),
        };
        self.ownership
            .range((start, Bound::Unbounded))
            .take_while(move |((home, _, _), _)| *home == owner)
            .map(|((_, handle, id), key)| ((handle.clone(), *id), *key))
    }

    /// Sets the mark of every element owned by `owner`.
    pub fn mark_elements_of(&mut self, owner: RegistrarIdentifier) {
        for key in self.elements_owned_by(owner) {
            if let Some(node) = self.elements.get_mut(key.0) {
                node.marked = true;
            }
        }
    }

    /// Raw checksum accumulator over all elements.
    pub fn handlespace_checksum_accumulator(&self) -> ChecksumAccumulator {
        self.handlespace_checksum
    }

    /// Checksum over all elements.
    pub fn handlespace_checksum(&self) -> HandlespaceChecksum {
        self.handlespace_checksum.finish()
    }

    /// Raw checksum accumulator over the elements owned by `owner`.
    pub fn ownership_checksum_accumulator_of(
        &self,
        owner: RegistrarIdentifier,
    ) -> ChecksumAccumulator {
        self.owners
            .get(&owner)
            .map_or(ChecksumAccumulator::INITIAL, |totals| totals.checksum)
    }

    /// Checksum over the elements owned by this registrar.
    pub fn ownership_checksum(&self) -> HandlespaceChecksum {
        self.ownership_checksum_accumulator_of(self.home_registrar_identifier)
            .finish()
    }

    /// Recomputes the ownership checksum of `owner` from scratch.
    pub fn compute_ownership_checksum(&self, owner: RegistrarIdentifier) -> ChecksumAccumulator {
        self.ownership_range(owner, None)
            .filter_map(|(_, key)| self.elements.get(key.0))
            .fold(ChecksumAccumulator::INITIAL, |sum, node| {
                sum + node.compute_checksum()
            })
    }

    /// Checks all index invariants and recomputes all checksums.
    pub fn verify(&self) -> Result<()> {
        let timers = self.elements.iter().filter(|(_, n)| n.timer.is_some()).count();
        if timers != self.timers.len() {
            return Err(RegistrarError::internal(format!(
                "timer index has {} entries, {timers} elements have timers",
                self.timers.len()
            )));
        }
        for (idx, node) in &self.elements {
            if let Some((_, ts)) = node.timer {
                let entry = (ts, node.identifier, node.handle.clone(), ElementKey(idx));
                if !self.timers.contains(&entry) {
                    return Err(RegistrarError::internal(format!(
                        "timer of element ${:08x} in {} is not indexed",
                        node.identifier, node.handle
                    )));
                }
            }
        }
        let mut connected = 0;
        for (idx, node) in &self.elements {
            let Some(conn) = node.connection.filter(|conn| conn.socket_descriptor > 0) else {
                continue;
            };
            connected += 1;
            let entry = (conn, node.identifier, node.handle.clone(), ElementKey(idx));
            if !self.connections.contains(&entry) {
                return Err(RegistrarError::internal(format!(
                    "connection of element ${:08x} in {} is not indexed",
                    node.identifier, node.handle
                )));
            }
        }
        if connected != self.connections.len() {
            return Err(RegistrarError::internal(format!(
                "connection index has {} entries, {connected} elements have connections",
                self.connections.len()
            )));
        }

        let owned = self
            .elements
            .iter()
            .filter(|(_, n)| n.home_registrar_identifier != UNDEFINED_REGISTRAR_IDENTIFIER)
            .count();
        if owned != self.ownership.len() || self.ownership.len() > self.elements.len() {
            return Err(RegistrarError::internal(format!(
                "ownership index has {} entries, expected {owned}",
                self.ownership.len()
            )));
        }

        let mut total = 0;
        for pool in self.pools.values() {
            if pool.is_empty() || pool.len() != pool.selection_len() {
                return Err(RegistrarError::internal(format!(
                    "pool {} has {} indexed and {} selectable elements",
                    pool.handle(),
                    pool.len(),
                    pool.selection_len()
                )));
            }
            total += pool.len();
        }
        if total != self.elements.len() {
            return Err(RegistrarError::internal(format!(
                "pools hold {total} elements, handlespace holds {}",
                self.elements.len()
            )));
        }

        let mut handlespace_checksum = ChecksumAccumulator::INITIAL;
        let mut owners: BTreeMap<RegistrarIdentifier, OwnerTotals> = BTreeMap::new();
        for (_, node) in &self.elements {
            let checksum = node.compute_checksum();
            if checksum != node.checksum {
                return Err(RegistrarError::internal(format!(
                    "stale checksum of element ${:08x} in {}",
                    node.identifier, node.handle
                )));
            }
            handlespace_checksum += checksum;
            if node.home_registrar_identifier != UNDEFINED_REGISTRAR_IDENTIFIER {
                let totals = owners.entry(node.home_registrar_identifier).or_default();
                totals.elements += 1;
                totals.checksum += checksum;
            }
        }
        if handlespace_checksum != self.handlespace_checksum {
            return Err(RegistrarError::internal("handlespace checksum mismatch"));
        }
        if owners != self.owners {
            return Err(RegistrarError::internal("ownership checksum mismatch"));
        }
        Ok(())
    }

    /// Removes all pools and elements.
    pub fn clear(&mut self) {
        let keys: Vec<_> = self.elements.iter().map(|(idx, _)| ElementKey(idx)).collect();
        for key in keys {
            let _ = self.remove(key);
        }
    }

    fn add_owner_contribution(&mut self, owner: RegistrarIdentifier, checksum: ChecksumAccumulator) {
        if owner == UNDEFINED_REGISTRAR_IDENTIFIER {
            return;
        }
        let totals = self.owners.entry(owner).or_default();
        totals.elements += 1;
        totals.checksum += checksum;
    }

    fn remove_owner_contribution(
        &mut self,
        owner: RegistrarIdentifier,
        checksum: ChecksumAccumulator,
    ) {
        if owner == UNDEFINED_REGISTRAR_IDENTIFIER {
            return;
        }
        if let Some(totals) = self.owners.get_mut(&owner) {
            totals.elements -= 1;
            totals.checksum -= checksum;
            if totals.elements == 0 {
                self.owners.remove(&owner);
            }
        }
    }

    fn notify(&mut self, change: HandlespaceChange) {
        if let Some(observer) = self.observer.as_mut() {
            observer.element_changed(&change);
        }
    }
}

impl fmt::Display for PoolHandlespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Handlespace of ${:08x}: {} pools, {} elements ({} owned), checksum ${:04x}, ownership checksum ${:04x}",
            self.home_registrar_identifier,
            self.pools.len(),
            self.elements.len(),
            self.owned_element_count(),
            self.handlespace_checksum(),
            self.ownership_checksum(),
        )?;
        for pool in self.pools.values() {
            pool.describe(&self.elements, f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::element::tests::registration;

    const OWN: RegistrarIdentifier = 1;

    fn handle(name: &str) -> PoolHandle {
        PoolHandle::try_from(name).unwrap()
    }

    fn add(hs: &mut PoolHandlespace, pool: &str, id: u32, home: u32) -> ElementKey {
        let mut reg = registration(id, PoolPolicy::RoundRobin.type_code());
        reg.home_registrar_identifier = home;
        hs.add_or_update(&handle(pool), PoolPolicy::RoundRobin, reg)
            .unwrap()
            .0
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<HandlespaceChange>>>);

    impl HandlespaceObserver for Recorder {
        fn element_changed(&mut self, change: &HandlespaceChange) {
            self.0.lock().unwrap().push(change.clone());
        }
    }

    #[test]
    fn checksum_tracks_additions_and_removals() {
        let mut hs = PoolHandlespace::with_seed(OWN, 1);
        let a = add(&mut hs, "A", 1, OWN);
        let after_a = hs.handlespace_checksum_accumulator();
        let b = add(&mut hs, "A", 2, 7);
        let b_sum = hs.element(b).unwrap().compute_checksum();
        assert_eq!(hs.handlespace_checksum_accumulator(), after_a + b_sum);
        assert_eq!(hs.owned_element_count(), 1);
        assert_eq!(hs.owned_element_count_of(7), 1);

        hs.remove(b).unwrap();
        assert_eq!(hs.handlespace_checksum_accumulator(), after_a);
        hs.remove(a).unwrap();
        assert_eq!(hs.handlespace_checksum_accumulator(), ChecksumAccumulator::INITIAL);
        assert_eq!(hs.pool_count(), 0);
        hs.verify().unwrap();
    }

    #[test]
    fn reregistration_updates_in_place() {
        let mut hs = PoolHandlespace::with_seed(OWN, 1);
        let key = add(&mut hs, "A", 1, OWN);
        let mut reg = registration(1, PoolPolicy::RoundRobin.type_code());
        reg.home_registrar_identifier = OWN;
        reg.policy_settings.weight = 9;
        reg.user_transport.port = 99;
        let (same, is_new) = hs
            .add_or_update(&handle("A"), PoolPolicy::RoundRobin, reg)
            .unwrap();
        assert_eq!(same, key);
        assert!(!is_new);
        let node = hs.element(key).unwrap();
        assert_eq!(node.policy_settings().weight, 9);
        assert_eq!(node.user_transport().port, 99);
        assert_eq!(node.checksum(), node.compute_checksum());
        assert_eq!(hs.element_count(), 1);
        hs.verify().unwrap();
    }

    #[test]
    fn failed_insert_removes_new_pool() {
        let mut hs = PoolHandlespace::with_seed(OWN, 1);
        let reg = registration(0, PoolPolicy::RoundRobin.type_code());
        assert_eq!(
            hs.add_or_update(&handle("A"), PoolPolicy::RoundRobin, reg),
            Err(RegistrarError::InvalidId)
        );
        assert_eq!(hs.pool_count(), 0);
    }

    #[test]
    fn ownership_change_moves_checksums() {
        let mut hs = PoolHandlespace::with_seed(OWN, 1);
        let key = add(&mut hs, "A", 1, 5);
        add(&mut hs, "B", 2, 5);
        assert_eq!(hs.owned_element_count(), 0);
        assert_eq!(hs.elements_owned_by(5).len(), 2);

        hs.update_ownership(key, OWN).unwrap();
        assert_eq!(hs.owned_element_count(), 1);
        assert_eq!(hs.elements_owned_by(5).len(), 1);
        assert_eq!(
            hs.ownership_checksum_accumulator_of(OWN),
            hs.compute_ownership_checksum(OWN)
        );
        assert_eq!(
            hs.ownership_checksum_accumulator_of(5),
            hs.compute_ownership_checksum(5)
        );
        hs.verify().unwrap();
    }

    #[test]
    fn timers_are_ordered_and_cancelled_on_removal() {
        let mut hs = PoolHandlespace::with_seed(OWN, 1);
        let a = add(&mut hs, "A", 1, OWN);
        let b = add(&mut hs, "A", 2, OWN);
        hs.activate_timer(a, ElementTimer::Expiry, 500).unwrap();
        hs.activate_timer(b, ElementTimer::KeepAliveTransmission, 100)
            .unwrap();
        assert_eq!(hs.next_timer_timestamp(), Some(100));
        assert_eq!(hs.due_timers(100), vec![b]);
        assert_eq!(hs.due_timers(499), vec![b]);
        assert_eq!(hs.due_timers(500), vec![b, a]);

        hs.activate_timer(b, ElementTimer::KeepAliveTimeout, 700).unwrap();
        assert_eq!(hs.timer_count(), 2);
        assert_eq!(hs.next_timer_timestamp(), Some(500));

        hs.remove(a).unwrap();
        assert_eq!(hs.next_timer_timestamp(), Some(700));
        assert_eq!(
            hs.deactivate_timer(b).unwrap(),
            Some(ElementTimer::KeepAliveTimeout)
        );
        assert_eq!(hs.next_timer_timestamp(), None);
        hs.verify().unwrap();
    }

    #[test]
    fn tied_deadlines_are_ordered_by_identifier_and_handle() {
        let mut hs = PoolHandlespace::with_seed(OWN, 1);
        let b2 = add(&mut hs, "B", 2, OWN);
        let a2 = add(&mut hs, "A", 2, OWN);
        let b1 = add(&mut hs, "B", 1, OWN);
        for key in [b2, a2, b1] {
            hs.activate_timer(key, ElementTimer::Expiry, 5000).unwrap();
        }
        assert!(hs.due_timers(4999).is_empty());
        assert_eq!(hs.due_timers(5000), vec![b1, a2, b2]);
        assert_eq!(hs.first_timer(), Some((5000, b1)));
        hs.verify().unwrap();
    }

    #[test]
    fn verify_detects_unindexed_connection() {
        let mut hs = PoolHandlespace::with_seed(OWN, 1);
        let mut reg = registration(1, PoolPolicy::RoundRobin.type_code());
        reg.connection = Some(Connection::new(4, 1));
        hs.add_or_update(&handle("A"), PoolPolicy::RoundRobin, reg)
            .unwrap();
        hs.verify().unwrap();

        hs.connections.clear();
        assert!(matches!(
            hs.verify(),
            Err(RegistrarError::InternalConsistency(_))
        ));
    }

    #[test]
    fn connection_index_groups_elements() {
        let mut hs = PoolHandlespace::with_seed(OWN, 1);
        let conn = Connection::new(4, 1);
        for id in 1..=3 {
            let mut reg = registration(id, PoolPolicy::RoundRobin.type_code());
            reg.home_registrar_identifier = OWN;
            reg.connection = Some(conn);
            hs.add_or_update(&handle("A"), PoolPolicy::RoundRobin, reg)
                .unwrap();
        }
        add(&mut hs, "A", 4, OWN);
        assert_eq!(hs.connection_element_count(conn), 3);
        assert_eq!(hs.connection_element_count(Connection::new(4, 2)), 0);
        let ids: Vec<_> = hs
            .elements_of_connection(conn)
            .into_iter()
            .map(|key| hs.element(key).unwrap().identifier())
            .collect();
        assert_eq!(ids, [1, 2, 3]);
        hs.verify().unwrap();
    }

    #[test]
    fn observer_sees_changes() {
        let mut hs = PoolHandlespace::with_seed(OWN, 1);
        let recorder = Recorder::default();
        hs.set_observer(recorder.clone());

        let key = add(&mut hs, "A", 1, OWN);
        hs.update_ownership(key, 9).unwrap();
        hs.remove(key).unwrap();

        let changes = recorder.0.lock().unwrap();
        let actions: Vec<_> = changes.iter().map(|c| c.action).collect();
        assert_eq!(
            actions,
            vec![UpdateAction::Create, UpdateAction::Update, UpdateAction::Delete]
        );
        assert_eq!(changes[1].pre_home_registrar_identifier, OWN);
        assert_eq!(changes[1].home_registrar_identifier, 9);
        assert_eq!(changes[0].pre_checksum, ChecksumAccumulator::INITIAL);
    }

    #[test]
    fn mark_sets_flag_on_owned_only() {
        let mut hs = PoolHandlespace::with_seed(OWN, 1);
        let a = add(&mut hs, "A", 1, 5);
        let b = add(&mut hs, "A", 2, 6);
        hs.mark_elements_of(5);
        assert!(hs.element(a).unwrap().is_marked());
        assert!(!hs.element(b).unwrap().is_marked());
    }

    #[test]
    fn display_lists_pools() {
        let mut hs = PoolHandlespace::with_seed(OWN, 1);
        add(&mut hs, "EchoPool", 1, OWN);
        let text = hs.to_string();
        assert!(text.contains("1 pools, 1 elements (1 owned)"));
        assert!(text.contains("Pool \"EchoPool\", policy=RoundRobin"));
    }
}
