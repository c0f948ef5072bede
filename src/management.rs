//! Request-level operations on a handlespace.
//!
//! [`PoolHandlespaceManagement`] validates registrations before they reach the handlespace,
//! resolves pool handles, extracts handle tables for peer synchronization and implements the
//! bulk mark, purge and expiry operations.

use std::{
    fmt,
    ops::{BitOr, BitOrAssign},
};

use itertools::Either;

use crate::{
    checksum::HandlespaceChecksum,
    clock::TimeStamp,
    element::{
        ElementKey, ElementRegistration, ElementTimer, PoolElementIdentifier, PoolElementNode,
        RegistrarIdentifier,
    },
    error::{RegistrarError, Result},
    handlespace::PoolHandlespace,
    policy::{PoolPolicy, PoolPolicySettings},
    pool_handle::PoolHandle,
};

/// Upper bound on the elements returned by a single handle resolution.
pub const MAX_MAX_HANDLE_RESOLUTION_ITEMS: usize = 128;

/// Upper bound on the elements in a single handle table extract.
pub const NTE_MAX_POOL_ELEMENT_NODES: usize = 1024;

/// Flags of a handle table request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct HandleTableFlags(u8);

impl HandleTableFlags {
    /// No flags; continue after the extract's cursor over the whole handlespace.
    pub const NONE: HandleTableFlags = HandleTableFlags(0);
    /// Start from the beginning, ignoring the cursor.
    pub const START: HandleTableFlags = HandleTableFlags(1 << 0);
    /// Only include elements owned by the requested registrar.
    pub const OWN_CHILDREN_ONLY: HandleTableFlags = HandleTableFlags(1 << 1);

    /// Returns `true` if all flags in `other` are set.
    pub fn contains(self, other: HandleTableFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for HandleTableFlags {
    type Output = HandleTableFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        HandleTableFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for HandleTableFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One page of a handle table, with the cursor to continue from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandleTableExtract {
    /// Pool handle of the last returned element.
    pub last_handle: PoolHandle,
    /// Identifier of the last returned element.
    pub last_identifier: PoolElementIdentifier,
    /// Elements of this page.
    pub elements: Vec<ElementKey>,
}

impl HandleTableExtract {
    /// Creates an extract positioned at the start.
    pub fn new() -> Self {
        Self::default()
    }

    fn finish(&mut self, handlespace: &PoolHandlespace) {
        if let Some(node) = self
            .elements
            .last()
            .and_then(|key| handlespace.element(*key))
        {
            self.last_handle = node.handle().clone();
            self.last_identifier = node.identifier();
        }
    }
}

/// Result of a handle resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleResolution {
    /// Selected elements, in selection order.
    pub elements: Vec<ElementKey>,
    /// Policy settings of the first selected element.
    pub policy_settings: Option<PoolPolicySettings>,
}

/// A handlespace together with its request-level operations.
#[derive(Debug)]
pub struct PoolHandlespaceManagement {
    handlespace: PoolHandlespace,
}

impl PoolHandlespaceManagement {
    /// Creates an empty handlespace for the given own registrar identifier.
    pub fn new(home_registrar_identifier: RegistrarIdentifier) -> Self {
        PoolHandlespaceManagement {
            handlespace: PoolHandlespace::new(home_registrar_identifier),
        }
    }

    /// Creates an empty handlespace whose randomized policies use a seeded generator.
    pub fn with_seed(home_registrar_identifier: RegistrarIdentifier, seed: u64) -> Self {
        PoolHandlespaceManagement {
            handlespace: PoolHandlespace::with_seed(home_registrar_identifier, seed),
        }
    }

    /// The underlying handlespace.
    pub fn handlespace(&self) -> &PoolHandlespace {
        &self.handlespace
    }

    /// The underlying handlespace, mutably.
    pub fn handlespace_mut(&mut self) -> &mut PoolHandlespace {
        &mut self.handlespace
    }

    /// Looks up an element.
    pub fn element(&self, key: ElementKey) -> Option<&PoolElementNode> {
        self.handlespace.element(key)
    }

    /// Finds an element by pool handle and identifier.
    pub fn find_pool_element(
        &self,
        handle: &PoolHandle,
        identifier: PoolElementIdentifier,
    ) -> Option<ElementKey> {
        self.handlespace.find_element(handle, identifier)
    }

    /// Registers a new element or re-registers an existing one.
    ///
    /// Returns the element's key and whether it is new. The element's last update time is set
    /// to `now`; timers are left to the caller.
    pub fn register_pool_element(
        &mut self,
        handle: &PoolHandle,
        registration: ElementRegistration,
        now: TimeStamp,
    ) -> Result<(ElementKey, bool)> {
        if !handle.is_valid() {
            return Err(RegistrarError::InvalidPoolHandle);
        }
        let policy = PoolPolicy::from_type(registration.policy_settings.policy_type)
            .ok_or(RegistrarError::InvalidPoolPolicy)?;

        let (key, is_new) = self.handlespace.add_or_update(handle, policy, registration)?;
        if let Some(node) = self.handlespace.element_mut(key) {
            node.last_update = now;
        }
        Ok((key, is_new))
    }

    /// Removes an element, if present.
    ///
    /// Deregistering an element that does not exist succeeds and returns `None`.
    pub fn deregister_pool_element(
        &mut self,
        handle: &PoolHandle,
        identifier: PoolElementIdentifier,
    ) -> Result<Option<PoolElementNode>> {
        match self.handlespace.find_element(handle, identifier) {
            Some(key) => self.handlespace.remove(key).map(Some),
            None => Ok(None),
        }
    }

    /// Removes an element by key.
    pub fn deregister_pool_element_by_key(&mut self, key: ElementKey) -> Result<PoolElementNode> {
        self.handlespace.remove(key)
    }

    /// Selects up to `max_items` elements of a pool, at most [`MAX_MAX_HANDLE_RESOLUTION_ITEMS`].
    ///
    /// Fails with [`RegistrarError::NotFound`] for an unknown pool and with
    /// [`RegistrarError::NoElements`] if nothing was selected.
    pub fn handle_resolution(
        &mut self,
        handle: &PoolHandle,
        max_items: usize,
        max_increment: usize,
    ) -> Result<HandleResolution> {
        let max_items = max_items.min(MAX_MAX_HANDLE_RESOLUTION_ITEMS);
        let elements = self.handlespace.select(handle, max_items, max_increment)?;
        if elements.is_empty() {
            return Err(RegistrarError::NoElements);
        }
        let policy_settings = elements
            .first()
            .and_then(|key| self.handlespace.element(*key))
            .map(|node| *node.policy_settings());
        Ok(HandleResolution {
            elements,
            policy_settings,
        })
    }

    /// Fills `extract` with the next page of the handle table.
    ///
    /// With [`HandleTableFlags::OWN_CHILDREN_ONLY`] only elements owned by `owner` are listed,
    /// in (handle, identifier) order; otherwise all pools are walked in handle order. Without
    /// [`HandleTableFlags::START`] the walk continues after the extract's cursor. Returns
    /// `true` if any element was returned.
    pub fn get_handle_table(
        &self,
        owner: RegistrarIdentifier,
        extract: &mut HandleTableExtract,
        flags: HandleTableFlags,
        max_elements: usize,
    ) -> bool {
        extract.elements.clear();
        let max_elements = max_elements.min(NTE_MAX_POOL_ELEMENT_NODES);
        if max_elements == 0 {
            return false;
        }

        if flags.contains(HandleTableFlags::OWN_CHILDREN_ONLY) {
            let cursor = (!flags.contains(HandleTableFlags::START))
                .then(|| (&extract.last_handle, extract.last_identifier));
            let keys: Vec<_> = self
                .handlespace
                .ownership_range(owner, cursor)
                .map(|(_, key)| key)
                .take(max_elements)
                .collect();
            extract.elements = keys;
        } else {
            if flags.contains(HandleTableFlags::START) {
                extract.last_handle = PoolHandle::default();
                extract.last_identifier = 0;
            }
            let mut keys = Vec::with_capacity(max_elements);
            'pools: for pool in self.handlespace.pools_from(&extract.last_handle) {
                let continues = !flags.contains(HandleTableFlags::START)
                    && *pool.handle() == extract.last_handle;
                let entries = if continues {
                    Either::Left(pool.iter_index_after(extract.last_identifier))
                } else {
                    Either::Right(pool.iter_index())
                };
                for (_, key) in entries {
                    keys.push(key);
                    if keys.len() >= max_elements {
                        break 'pools;
                    }
                }
            }
            extract.elements = keys;
        }

        extract.finish(&self.handlespace);
        !extract.elements.is_empty()
    }

    /// Marks every element owned by `owner`.
    pub fn mark_pool_element_nodes(&mut self, owner: RegistrarIdentifier) {
        self.handlespace.mark_elements_of(owner);
    }

    /// Removes every element of `owner` that is still marked. Returns the number removed.
    pub fn purge_marked_pool_element_nodes(&mut self, owner: RegistrarIdentifier) -> Result<usize> {
        let marked: Vec<_> = self
            .handlespace
            .elements_owned_by(owner)
            .into_iter()
            .filter(|key| self.handlespace.element(*key).is_some_and(|n| n.is_marked()))
            .collect();
        for key in &marked {
            self.handlespace.remove(*key)?;
        }
        Ok(marked.len())
    }

    /// Schedules an element's expiry at its last update plus `expiry_timeout` microseconds.
    pub fn restart_expiry_timer(&mut self, key: ElementKey, expiry_timeout: u64) -> Result<()> {
        let last_update = self
            .handlespace
            .element(key)
            .ok_or(RegistrarError::NotFound)?
            .last_update();
        self.handlespace.activate_timer(
            key,
            ElementTimer::Expiry,
            last_update.saturating_add(expiry_timeout),
        )
    }

    /// Removes every element whose expiry timer is due at `now`. Returns the number removed.
    ///
    /// Elements with other timers are left alone.
    pub fn purge_expired_pool_element_nodes(&mut self, now: TimeStamp) -> Result<usize> {
        let expired: Vec<_> = self
            .handlespace
            .due_timers(now)
            .into_iter()
            .filter(|key| {
                self.handlespace
                    .element(*key)
                    .and_then(PoolElementNode::timer)
                    .is_some_and(|(timer, _)| timer == ElementTimer::Expiry)
            })
            .collect();
        for key in &expired {
            self.handlespace.remove(*key)?;
        }
        Ok(expired.len())
    }

    /// Deadline of the earliest element timer.
    pub fn next_timer_timestamp(&self) -> Option<TimeStamp> {
        self.handlespace.next_timer_timestamp()
    }

    /// Checksum over all elements.
    pub fn handlespace_checksum(&self) -> HandlespaceChecksum {
        self.handlespace.handlespace_checksum()
    }

    /// Checksum over the elements owned by this registrar.
    pub fn ownership_checksum(&self) -> HandlespaceChecksum {
        self.handlespace.ownership_checksum()
    }

    /// Checks all index invariants and checksums.
    pub fn verify(&self) -> Result<()> {
        self.handlespace.verify()
    }

    /// Removes all pools and elements.
    pub fn clear(&mut self) {
        self.handlespace.clear();
    }
}

impl fmt::Display for PoolHandlespaceManagement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.handlespace.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{element::tests::registration, policy::PoolPolicy};

    const OWN: RegistrarIdentifier = 1;

    fn handle(name: &str) -> PoolHandle {
        PoolHandle::try_from(name).unwrap()
    }

    fn register(
        mgmt: &mut PoolHandlespaceManagement,
        pool: &str,
        id: u32,
        home: RegistrarIdentifier,
    ) -> ElementKey {
        let mut reg = registration(id, PoolPolicy::RoundRobin.type_code());
        reg.home_registrar_identifier = home;
        mgmt.register_pool_element(&handle(pool), reg, 1_000).unwrap().0
    }

    #[test]
    fn register_validates_handle_and_policy() {
        let mut mgmt = PoolHandlespaceManagement::with_seed(OWN, 1);
        let reg = registration(1, PoolPolicy::RoundRobin.type_code());
        assert_eq!(
            mgmt.register_pool_element(&PoolHandle::default(), reg.clone(), 0),
            Err(RegistrarError::InvalidPoolHandle)
        );

        let mut unknown = reg.clone();
        unknown.policy_settings.policy_type = 0xb000_2004;
        assert_eq!(
            mgmt.register_pool_element(&handle("A"), unknown, 0),
            Err(RegistrarError::InvalidPoolPolicy)
        );

        let (key, is_new) = mgmt.register_pool_element(&handle("A"), reg, 77).unwrap();
        assert!(is_new);
        assert_eq!(mgmt.element(key).unwrap().last_update(), 77);
    }

    #[test]
    fn deregister_absent_element_succeeds() {
        let mut mgmt = PoolHandlespaceManagement::with_seed(OWN, 1);
        register(&mut mgmt, "A", 1, OWN);
        let checksum = mgmt.handlespace_checksum();
        assert!(matches!(mgmt.deregister_pool_element(&handle("A"), 99), Ok(None)));
        assert!(matches!(mgmt.deregister_pool_element(&handle("B"), 1), Ok(None)));
        assert_eq!(mgmt.handlespace_checksum(), checksum);
        assert_eq!(mgmt.handlespace().element_count(), 1);

        let removed = mgmt.deregister_pool_element(&handle("A"), 1).unwrap();
        assert_eq!(removed.map(|n| n.identifier()), Some(1));
        assert_eq!(mgmt.handlespace().pool_count(), 0);
    }

    #[test]
    fn handle_resolution_reports_first_settings() {
        let mut mgmt = PoolHandlespaceManagement::with_seed(OWN, 1);
        assert_eq!(
            mgmt.handle_resolution(&handle("A"), 3, 1),
            Err(RegistrarError::NotFound)
        );
        for id in 1..=5 {
            register(&mut mgmt, "A", id, OWN);
        }
        let res = mgmt.handle_resolution(&handle("A"), 3, 1).unwrap();
        assert_eq!(res.elements.len(), 3);
        assert_eq!(
            res.policy_settings.map(|pps| pps.policy_type),
            Some(PoolPolicy::RoundRobin.type_code())
        );
        let res = mgmt.handle_resolution(&handle("A"), 1_000, 1).unwrap();
        assert_eq!(res.elements.len(), 5);
    }

    #[test]
    fn empty_selection_reports_no_elements() {
        let mut mgmt = PoolHandlespaceManagement::with_seed(OWN, 1);
        register(&mut mgmt, "A", 1, OWN);
        assert_eq!(
            mgmt.handle_resolution(&handle("A"), 0, 1),
            Err(RegistrarError::NoElements)
        );
        assert_eq!(RegistrarError::NoElements.code(), 0xf009);
        assert!(mgmt.handle_resolution(&handle("A"), 1, 1).is_ok());
    }

    #[test]
    fn global_handle_table_pages_through_pools() {
        let mut mgmt = PoolHandlespaceManagement::with_seed(OWN, 1);
        for (pool, id) in [("A", 1), ("A", 2), ("B", 1), ("CC", 3), ("CC", 4)] {
            register(&mut mgmt, pool, id, OWN);
        }
        let mut extract = HandleTableExtract::new();
        let mut seen = Vec::new();
        let mut flags = HandleTableFlags::START;
        while mgmt.get_handle_table(OWN, &mut extract, flags, 2) {
            for key in &extract.elements {
                let node = mgmt.element(*key).unwrap();
                seen.push((node.handle().to_string(), node.identifier()));
            }
            flags = HandleTableFlags::NONE;
        }
        assert_eq!(
            seen,
            vec![
                ("A".to_string(), 1),
                ("A".to_string(), 2),
                ("B".to_string(), 1),
                ("CC".to_string(), 3),
                ("CC".to_string(), 4),
            ]
        );
    }

    #[test]
    fn ownership_handle_table_filters_owner() {
        let mut mgmt = PoolHandlespaceManagement::with_seed(OWN, 1);
        register(&mut mgmt, "A", 1, 5);
        register(&mut mgmt, "A", 2, 6);
        register(&mut mgmt, "B", 3, 5);
        register(&mut mgmt, "B", 4, 5);

        let mut extract = HandleTableExtract::new();
        let flags = HandleTableFlags::START | HandleTableFlags::OWN_CHILDREN_ONLY;
        assert!(mgmt.get_handle_table(5, &mut extract, flags, 2));
        assert_eq!(extract.elements.len(), 2);
        assert_eq!(extract.last_identifier, 3);

        assert!(mgmt.get_handle_table(5, &mut extract, HandleTableFlags::OWN_CHILDREN_ONLY, 2));
        assert_eq!(extract.elements.len(), 1);
        assert_eq!(extract.last_identifier, 4);
        assert!(!mgmt.get_handle_table(5, &mut extract, HandleTableFlags::OWN_CHILDREN_ONLY, 2));
        assert!(!mgmt.get_handle_table(5, &mut extract, flags, 0));
    }

    #[test]
    fn mark_and_purge_removes_only_marked_owner() {
        let mut mgmt = PoolHandlespaceManagement::with_seed(OWN, 1);
        register(&mut mgmt, "A", 1, 5);
        register(&mut mgmt, "A", 2, 5);
        register(&mut mgmt, "A", 3, 6);
        register(&mut mgmt, "B", 4, 5);

        mgmt.mark_pool_element_nodes(5);
        // A re-registration clears the mark of element 2.
        register(&mut mgmt, "A", 2, 5);

        assert_eq!(mgmt.purge_marked_pool_element_nodes(5), Ok(2));
        assert_eq!(mgmt.handlespace().owned_element_count_of(5), 1);
        assert_eq!(mgmt.handlespace().owned_element_count_of(6), 1);
        assert!(mgmt.find_pool_element(&handle("A"), 2).is_some());
        mgmt.verify().unwrap();
    }

    #[test]
    fn purge_expired_only_touches_due_expiry_timers() {
        let mut mgmt = PoolHandlespaceManagement::with_seed(OWN, 1);
        let a = register(&mut mgmt, "A", 1, 5);
        let b = register(&mut mgmt, "A", 2, 5);
        let c = register(&mut mgmt, "A", 3, OWN);
        mgmt.restart_expiry_timer(a, 500).unwrap();
        mgmt.restart_expiry_timer(b, 5_000).unwrap();
        mgmt.handlespace_mut()
            .activate_timer(c, ElementTimer::KeepAliveTimeout, 1_200)
            .unwrap();

        assert_eq!(mgmt.next_timer_timestamp(), Some(1_200));
        assert_eq!(mgmt.element(a).unwrap().timer(), Some((ElementTimer::Expiry, 1_500)));
        assert_eq!(mgmt.purge_expired_pool_element_nodes(2_000), Ok(1));
        assert!(mgmt.element(c).is_some());
        assert_eq!(mgmt.next_timer_timestamp(), Some(1_200));
        assert_eq!(mgmt.purge_expired_pool_element_nodes(6_000), Ok(1));
        mgmt.verify().unwrap();
    }
}
