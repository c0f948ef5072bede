//! Pools, the element collections registered under one pool handle.
//!
//! A [`PoolNode`] keeps two indices over its elements: an identifier index and a selection
//! index ordered by the pool policy's [`SelectionKey`]. The elements themselves live in the
//! handlespace's slab and are passed in by the caller.

use std::{collections::BTreeMap, fmt, ops::Bound};

use rand::Rng;
use slab::Slab;

use crate::{
    element::{ElementKey, ElementRegistration, PoolElementIdentifier, PoolElementNode},
    error::{RegistrarError, Result},
    policy::{PoolPolicy, SelectionKey, SelectionMethod},
    pool_handle::PoolHandle,
    transport::{TransportProtocol, MAX_PE_TRANSPORT_ADDRESSES},
};

/// Element storage shared by all pools of a handlespace.
pub type ElementSlab = Slab<PoolElementNode>;

/// All elements registered under one pool handle.
#[derive(Clone, Debug)]
pub struct PoolNode {
    handle: PoolHandle,
    policy: PoolPolicy,
    protocol: TransportProtocol,
    control_channel: bool,
    global_seq_number: u32,
    index: BTreeMap<PoolElementIdentifier, ElementKey>,
    selection: BTreeMap<SelectionKey, ElementKey>,
}

impl PoolNode {
    /// Creates an empty pool.
    pub fn new(
        handle: PoolHandle,
        policy: PoolPolicy,
        protocol: TransportProtocol,
        control_channel: bool,
    ) -> Self {
        PoolNode {
            handle,
            policy,
            protocol,
            control_channel,
            global_seq_number: crate::policy::SEQ_NUMBER_START,
            index: BTreeMap::new(),
            selection: BTreeMap::new(),
        }
    }

    /// Pool handle.
    pub fn handle(&self) -> &PoolHandle {
        &self.handle
    }

    /// Pool policy.
    pub fn policy(&self) -> PoolPolicy {
        self.policy
    }

    /// Transport protocol all elements use.
    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    /// Whether elements use an ASAP control channel.
    pub fn control_channel(&self) -> bool {
        self.control_channel
    }

    /// Next sequence number to hand out.
    pub fn global_seq_number(&self) -> u32 {
        self.global_seq_number
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns `true` if the pool has no elements.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of elements in the selection index.
    pub fn selection_len(&self) -> usize {
        self.selection.len()
    }

    /// Finds an element by identifier.
    pub fn find(&self, identifier: PoolElementIdentifier) -> Option<ElementKey> {
        self.index.get(&identifier).copied()
    }

    /// Elements in identifier order.
    pub fn iter_index(&self) -> impl Iterator<Item = (PoolElementIdentifier, ElementKey)> + '_ {
        self.index.iter().map(|(id, key)| (*id, *key))
    }

    /// Elements with an identifier greater than `identifier`, in identifier order.
    pub fn iter_index_after(
        &self,
        identifier: PoolElementIdentifier,
    ) -> impl Iterator<Item = (PoolElementIdentifier, ElementKey)> + '_ {
        self.index
            .range((Bound::Excluded(identifier), Bound::Unbounded))
            .map(|(id, key)| (*id, *key))
    }

    /// Elements in selection order.
    pub fn iter_selection(&self) -> impl Iterator<Item = ElementKey> + '_ {
        self.selection.values().copied()
    }

    /// First element in selection order.
    pub fn first_in_selection(&self) -> Option<ElementKey> {
        self.selection.values().next().copied()
    }

    /// Checks whether a registration may join this pool.
    pub fn check_compatibility(&self, registration: &ElementRegistration) -> Result<()> {
        if registration.identifier == 0 {
            return Err(RegistrarError::InvalidId);
        }
        if registration.user_transport.protocol != self.protocol {
            return Err(RegistrarError::WrongProtocol);
        }
        if let Some(registrator) = &registration.registrator_transport {
            if registrator.protocol != TransportProtocol::Sctp
                || registrator.control_channel
                || registrator.addresses.is_empty()
                || registrator.addresses.len() > MAX_PE_TRANSPORT_ADDRESSES
                || registrator.port == 0
            {
                return Err(RegistrarError::InvalidRegistrator);
            }
        }
        if !registration.user_transport.is_usable() {
            return Err(RegistrarError::InvalidAddresses);
        }
        if registration.user_transport.control_channel != self.control_channel {
            return Err(RegistrarError::WrongControlChannelHandling);
        }
        if !registration.policy_settings.is_valid() {
            return Err(RegistrarError::InvalidPoolPolicy);
        }
        if !registration
            .policy_settings
            .adapt(self.policy.type_code())
        {
            return Err(RegistrarError::IncompatiblePoolPolicy);
        }
        Ok(())
    }

    /// Inserts a new element into both indices and the slab.
    ///
    /// Fails with [`RegistrarError::DuplicateId`] if the identifier is taken.
    pub fn add(
        &mut self,
        elements: &mut ElementSlab,
        registration: ElementRegistration,
    ) -> Result<ElementKey> {
        self.check_compatibility(&registration)?;
        if self.index.contains_key(&registration.identifier) {
            return Err(RegistrarError::DuplicateId);
        }

        if self.global_seq_number.checked_add(1).is_none() {
            self.resequence(elements);
        }

        let current_round = self
            .first_in_selection()
            .map(|key| elements[key.0].round_counter);

        let mut node = PoolElementNode::new(self.handle.clone(), registration);
        node.updated = true;
        node.seq_number = self.next_seq_number();
        self.policy.init(&mut node, current_round);

        let identifier = node.identifier;
        let key = ElementKey(elements.insert(node));
        self.index.insert(identifier, key);
        self.link(elements, key);
        Ok(key)
    }

    /// Applies a re-registration to an existing element.
    ///
    /// Returns `true` if policy relevant fields changed.
    pub fn update(
        &mut self,
        elements: &mut ElementSlab,
        key: ElementKey,
        source: &ElementRegistration,
    ) -> Result<bool> {
        self.check_compatibility(source)?;
        let changed = elements[key.0].update(source);
        if changed {
            self.unlink(elements, key);
            self.link(elements, key);
        }
        Ok(changed)
    }

    /// Unlinks an element from both indices, leaving it in the slab.
    pub fn remove(&mut self, elements: &mut ElementSlab, key: ElementKey) {
        self.unlink(elements, key);
        let identifier = elements[key.0].identifier;
        self.index.remove(&identifier);
    }

    /// Selects up to `max_elements` elements according to the pool policy.
    ///
    /// At most `max_increment` of the selected elements get their policy state advanced,
    /// `0` uses the policy's default.
    pub fn select<R: Rng + ?Sized>(
        &mut self,
        elements: &mut ElementSlab,
        rng: &mut R,
        max_elements: usize,
        max_increment: usize,
    ) -> Vec<ElementKey> {
        if max_elements == 0 {
            return Vec::new();
        }
        let max_increment = if max_increment == 0 {
            self.policy.default_max_increment()
        } else {
            max_increment
        };

        let needs_resequence = u32::try_from(max_elements)
            .ok()
            .and_then(|n| self.global_seq_number.checked_add(n))
            .is_none();
        if needs_resequence {
            self.resequence(elements);
        }
        if self.policy.needs_prepare() {
            self.prepare_selection(elements);
        }

        match self.policy.selection_method() {
            SelectionMethod::SortingOrder => {
                self.select_by_sorting_order(elements, max_elements, max_increment)
            }
            SelectionMethod::ValueTree => {
                self.select_by_value_tree(elements, rng, max_elements, max_increment)
            }
        }
    }

    fn select_by_sorting_order(
        &mut self,
        elements: &mut ElementSlab,
        max_elements: usize,
        max_increment: usize,
    ) -> Vec<ElementKey> {
        let selected: Vec<_> = self.selection.values().copied().take(max_elements).collect();
        for &key in selected.iter().take(max_increment) {
            self.unlink(elements, key);
            let seq = self.next_seq_number();
            let node = &mut elements[key.0];
            node.seq_number = seq;
            node.selection_counter += 1;
            self.policy.update(node);
            self.link(elements, key);
        }
        selected
    }

    fn select_by_value_tree<R: Rng + ?Sized>(
        &mut self,
        elements: &mut ElementSlab,
        rng: &mut R,
        max_elements: usize,
        max_increment: usize,
    ) -> Vec<ElementKey> {
        let rounds = self.selection.len().min(max_elements);
        let mut selected = Vec::with_capacity(rounds);
        for _ in 0..rounds {
            let mut sum: u64 = self
                .selection
                .values()
                .map(|key| self.policy.selection_value(&elements[key.0]))
                .sum();
            // All values zero: every element is equally likely.
            let uniform = sum == 0;
            if uniform {
                sum = self.selection.len() as u64;
            }
            if sum < 1 {
                break;
            }

            let value = rng.random_range(0..sum);
            let Some(key) = self.node_by_value(elements, value, uniform) else {
                break;
            };

            let seq = self.next_seq_number();
            let node = &mut elements[key.0];
            node.seq_number = seq;
            node.selection_counter += 1;
            if selected.len() < max_increment {
                self.policy.update(node);
            }

            // Drawn elements leave the index until the end so they are not drawn twice.
            self.unlink(elements, key);
            selected.push(key);
        }

        for &key in &selected {
            self.link(elements, key);
        }
        selected
    }

    fn node_by_value(
        &self,
        elements: &ElementSlab,
        value: u64,
        uniform: bool,
    ) -> Option<ElementKey> {
        let mut upper = 0u64;
        for key in self.selection.values() {
            upper += if uniform {
                1
            } else {
                self.policy.selection_value(&elements[key.0])
            };
            if value < upper {
                return Some(*key);
            }
        }
        None
    }

    fn prepare_selection(&mut self, elements: &mut ElementSlab) {
        let Some(first) = self.first_in_selection() else {
            return;
        };
        let current_round = elements[first.0].round_counter;
        if current_round.checked_add(2).is_some() {
            return;
        }
        let keys: Vec<_> = self.selection.values().copied().collect();
        self.selection.clear();
        for key in keys {
            elements[key.0].round_counter -= current_round;
            self.insert_selection(elements, key);
        }
    }

    /// Renumbers all sequence numbers from the start, keeping selection order.
    pub(crate) fn resequence(&mut self, elements: &mut ElementSlab) {
        self.global_seq_number = crate::policy::SEQ_NUMBER_START;
        let keys: Vec<_> = self.selection.values().copied().collect();
        self.selection.clear();
        for key in keys {
            let seq = self.next_seq_number();
            elements[key.0].seq_number = seq;
            self.insert_selection(elements, key);
        }
    }

    fn next_seq_number(&mut self) -> u32 {
        let seq = self.global_seq_number;
        self.global_seq_number = self.global_seq_number.wrapping_add(1);
        seq
    }

    fn link(&mut self, elements: &mut ElementSlab, key: ElementKey) {
        self.insert_selection(elements, key);
    }

    fn insert_selection(&mut self, elements: &mut ElementSlab, key: ElementKey) {
        let node = &mut elements[key.0];
        let selection_key = self.policy.selection_key(node);
        node.selection_key = Some(selection_key);
        self.selection.insert(selection_key, key);
    }

    fn unlink(&mut self, elements: &mut ElementSlab, key: ElementKey) {
        if let Some(selection_key) = elements[key.0].selection_key.take() {
            self.selection.remove(&selection_key);
        }
    }

    /// Writes a description of the pool and its elements.
    pub fn describe(&self, elements: &ElementSlab, f: &mut impl fmt::Write) -> fmt::Result {
        writeln!(
            f,
            "+-- Pool \"{}\", policy={}, protocol={}{}, {} elements",
            self.handle,
            self.policy,
            self.protocol,
            if self.control_channel { "+CtrlCh" } else { "" },
            self.len(),
        )?;
        for key in self.selection.values() {
            writeln!(f, "   - {}", elements[key.0])?;
        }
        Ok(())
    }
}
