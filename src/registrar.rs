//! The registrar: ASAP request handling, element monitoring and ENRP peer maintenance on top
//! of a handlespace and a peer list.
//!
//! [`Registrar`] is a synchronous state machine. Every handler takes the current timestamp
//! and reports outgoing messages through a [`RegistrarNotifier`], so the same code runs
//! inside the [`service`](crate::service) task and in plain unit tests.
//!
//! # Element monitoring
//!
//! Elements registered at this registrar cycle between two timers: a keepalive is sent when
//! the transmission timer fires, and the element is removed if the timeout timer fires before
//! the acknowledgement arrives. Elements learned from peers carry an expiry timer instead.
//!
//! # Takeover
//!
//! A peer that stops answering is taken over if it still owns elements: every other peer is
//! asked to acknowledge, and once all have done so the elements are reassigned to this
//! registrar. Two registrars racing for the same target resolve the conflict by identifier,
//! the lower one wins.

use std::{collections::BTreeMap, fmt};

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::{
    checksum::HandlespaceChecksum,
    clock::TimeStamp,
    config::{micros, RegistrarConfig},
    element::{
        Connection, ElementKey, ElementRegistration, ElementTimer, PoolElementIdentifier,
        PoolElementNode, RegistrarIdentifier, UNDEFINED_REGISTRAR_IDENTIFIER,
    },
    error::{RegistrarError, Result},
    handlespace::UpdateAction,
    management::{HandleResolution, HandleTableExtract, HandleTableFlags, PoolHandlespaceManagement},
    peer_list::{PeerFlags, PeerKey, PeerListManagement, PeerListNode, PeerStatus, PeerTimer},
    policy::PoolPolicy,
    pool_handle::PoolHandle,
    takeover::TakeoverProcess,
    transport::TransportAddressBlock,
};

/// Receiver of a presence message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerDestination {
    /// A single peer.
    Peer(RegistrarIdentifier),
    /// Every known peer.
    All,
}

/// A message the registrar wants delivered to an element or a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundMessage {
    /// ASAP keepalive to an element.
    KeepAlive {
        /// Pool handle of the element.
        handle: PoolHandle,
        /// Element identifier.
        identifier: PoolElementIdentifier,
        /// ASAP addresses of the element.
        registrator_transport: Option<TransportAddressBlock>,
        /// Association the element registered over.
        connection: Option<Connection>,
        /// Set when this registrar just became the element's home.
        new_home: bool,
    },
    /// ENRP handle update to all peers.
    HandleUpdate {
        /// What happened to the element.
        action: UpdateAction,
        /// Pool handle of the element.
        handle: PoolHandle,
        /// The element as stored.
        registration: ElementRegistration,
    },
    /// ENRP presence.
    Presence {
        /// Receiver.
        to: PeerDestination,
        /// Asks the receiver to answer with its own presence.
        reply_required: bool,
        /// Checksum over the elements owned by this registrar.
        checksum: HandlespaceChecksum,
    },
    /// ENRP handle table request.
    HandleTableRequest {
        /// Peer to synchronize with.
        to: RegistrarIdentifier,
        /// Request flags.
        flags: HandleTableFlags,
    },
    /// Announces the takeover of `target` to all peers.
    InitTakeover {
        /// Registrar being taken over.
        target: RegistrarIdentifier,
    },
    /// Acknowledges another registrar's takeover.
    InitTakeoverAck {
        /// Registrar running the takeover.
        to: RegistrarIdentifier,
        /// Registrar being taken over.
        target: RegistrarIdentifier,
    },
    /// Tells all peers that this registrar now serves `target`'s elements.
    TakeoverServer {
        /// Registrar that was taken over.
        target: RegistrarIdentifier,
    },
}

impl OutboundMessage {
    fn keep_alive(node: &PoolElementNode, new_home: bool) -> Self {
        OutboundMessage::KeepAlive {
            handle: node.handle().clone(),
            identifier: node.identifier(),
            registrator_transport: node.registrator_transport().cloned(),
            connection: node.connection(),
            new_home,
        }
    }

    fn handle_update(action: UpdateAction, node: &PoolElementNode) -> Self {
        OutboundMessage::HandleUpdate {
            action,
            handle: node.handle().clone(),
            registration: node.to_registration(),
        }
    }

    /// Short name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::KeepAlive { .. } => "KeepAlive",
            OutboundMessage::HandleUpdate { .. } => "HandleUpdate",
            OutboundMessage::Presence { .. } => "Presence",
            OutboundMessage::HandleTableRequest { .. } => "HandleTableRequest",
            OutboundMessage::InitTakeover { .. } => "InitTakeover",
            OutboundMessage::InitTakeoverAck { .. } => "InitTakeoverAck",
            OutboundMessage::TakeoverServer { .. } => "TakeoverServer",
        }
    }
}

/// Delivers the registrar's outgoing messages.
pub trait RegistrarNotifier: Send + 'static {
    /// Sends a message, returning `false` if it could not be delivered.
    fn send(&mut self, message: OutboundMessage) -> bool;
}

impl RegistrarNotifier for tokio::sync::mpsc::UnboundedSender<OutboundMessage> {
    fn send(&mut self, message: OutboundMessage) -> bool {
        tokio::sync::mpsc::UnboundedSender::send(self, message).is_ok()
    }
}

/// An ASAP registration as received over an association.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationRequest {
    /// Pool to register in.
    pub handle: PoolHandle,
    /// The element as announced. Home registrar, ASAP transport and connection are replaced.
    pub registration: ElementRegistration,
    /// Peer addresses of the association the request arrived on.
    pub association: TransportAddressBlock,
    /// The association itself.
    pub connection: Connection,
    /// Smoothed round trip time of the association in milliseconds, if known.
    pub round_trip_time: Option<u32>,
}

/// An ENRP handle update received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerHandleUpdate {
    /// Sending registrar.
    pub sender: RegistrarIdentifier,
    /// What happened to the element.
    pub action: UpdateAction,
    /// Pool handle of the element.
    pub handle: PoolHandle,
    /// The element as stored by the sender.
    pub registration: ElementRegistration,
    /// Round trip time to the sender in milliseconds, if known.
    pub round_trip_time: Option<u32>,
}

/// An ENRP presence received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Presence {
    /// Sending registrar.
    pub sender: RegistrarIdentifier,
    /// ENRP addresses of the sender.
    pub address_block: TransportAddressBlock,
    /// Checksum over the elements the sender owns.
    pub checksum: HandlespaceChecksum,
    /// The sender asks for a presence in return.
    pub reply_required: bool,
}

/// One page of this registrar's handle table, as sent to a peer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandleTableResponse {
    /// Elements of this page.
    pub entries: Vec<(PoolHandle, ElementRegistration)>,
    /// More pages follow.
    pub more: bool,
}

/// Request counters of a registrar.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrarStats {
    /// New registrations.
    pub registrations: u64,
    /// Registrations of already registered elements.
    pub reregistrations: u64,
    /// Deregistrations of existing elements.
    pub deregistrations: u64,
    /// Handle resolutions.
    pub handle_resolutions: u64,
    /// Endpoint unreachable reports.
    pub failure_reports: u64,
    /// Handle updates received from peers.
    pub updates: u64,
    /// Completed handle table synchronizations.
    pub synchronizations: u64,
    /// Completed takeovers.
    pub takeovers: u64,
}

/// A registrar's complete state.
pub struct Registrar<N> {
    config: RegistrarConfig,
    handlespace: PoolHandlespaceManagement,
    peers: PeerListManagement,
    table_cursors: BTreeMap<RegistrarIdentifier, HandleTableExtract>,
    notifier: N,
    stats: RegistrarStats,
}

impl<N> fmt::Debug for Registrar<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registrar")
            .field("identifier", &self.peers.own_identifier())
            .field("handlespace", &self.handlespace)
            .field("peers", &self.peers.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<N: RegistrarNotifier> Registrar<N> {
    /// Creates a registrar.
    ///
    /// An undefined identifier in the configuration is replaced by a random non-zero one.
    pub fn new(mut config: RegistrarConfig, notifier: N) -> Self {
        if config.registrar_identifier == UNDEFINED_REGISTRAR_IDENTIFIER {
            config.registrar_identifier = random_identifier(config.selection_seed);
        }
        let own = config.registrar_identifier;
        let handlespace = match config.selection_seed {
            Some(seed) => PoolHandlespaceManagement::with_seed(own, seed),
            None => PoolHandlespaceManagement::new(own),
        };
        info!(identifier = format_args!("${own:08x}"), "registrar created");

        Registrar {
            config,
            handlespace,
            peers: PeerListManagement::new(own),
            table_cursors: BTreeMap::new(),
            notifier,
            stats: RegistrarStats::default(),
        }
    }

    /// Own registrar identifier.
    pub fn own_identifier(&self) -> RegistrarIdentifier {
        self.config.registrar_identifier
    }

    /// Configuration in effect.
    pub fn config(&self) -> &RegistrarConfig {
        &self.config
    }

    /// The handlespace.
    pub fn handlespace(&self) -> &PoolHandlespaceManagement {
        &self.handlespace
    }

    /// The handlespace, mutably.
    pub fn handlespace_mut(&mut self) -> &mut PoolHandlespaceManagement {
        &mut self.handlespace
    }

    /// The peer list.
    pub fn peers(&self) -> &PeerListManagement {
        &self.peers
    }

    /// Request counters.
    pub fn stats(&self) -> RegistrarStats {
        self.stats
    }

    /// The notifier.
    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// The notifier, mutably.
    pub fn notifier_mut(&mut self) -> &mut N {
        &mut self.notifier
    }

    /// Earliest deadline over element and peer timers.
    pub fn next_timer_timestamp(&self) -> Option<TimeStamp> {
        [
            self.handlespace.next_timer_timestamp(),
            self.peers.next_timer_timestamp(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Adds a configured peer known only by its addresses.
    pub fn add_static_peer(
        &mut self,
        address_block: TransportAddressBlock,
        now: TimeStamp,
    ) -> Result<PeerKey> {
        self.peers
            .register(UNDEFINED_REGISTRAR_IDENTIFIER, PeerFlags::STATIC, address_block, now)
    }

    /// Writes the handlespace and the peer list.
    pub fn describe(&self, f: &mut impl fmt::Write) -> fmt::Result {
        write!(f, "{}", self.handlespace)?;
        self.peers.describe(Some(self.handlespace.handlespace()), f)
    }

    fn send(&mut self, message: OutboundMessage) -> bool {
        let kind = message.kind();
        let sent = self.notifier.send(message);
        if !sent {
            warn!(kind, "failed to send message");
        }
        sent
    }

    fn presence(&self, to: PeerDestination, reply_required: bool) -> OutboundMessage {
        OutboundMessage::Presence {
            to,
            reply_required,
            checksum: self.handlespace.ownership_checksum(),
        }
    }

    /// Removes an element and announces the removal to peers if this registrar owns it.
    fn remove_element(&mut self, key: ElementKey) -> Result<PoolElementNode> {
        let node = self.handlespace.deregister_pool_element_by_key(key)?;
        if node.home_registrar_identifier() == self.own_identifier() {
            self.send(OutboundMessage::handle_update(UpdateAction::Delete, &node));
        }
        Ok(node)
    }

    fn apply_distance(&self, registration: &mut ElementRegistration, round_trip_time: Option<u32>) {
        let settings = &mut registration.policy_settings;
        if PoolPolicy::from_type(settings.policy_type).is_some_and(PoolPolicy::uses_distance) {
            settings.distance = self
                .config
                .round_distance(round_trip_time.map_or(0, |rtt| rtt / 2));
        }
    }

    /// Handles an ASAP registration.
    ///
    /// The announced user transport is narrowed to the association's addresses and the ASAP
    /// transport is taken from the association itself; the element is registered with this
    /// registrar as its home, announced to peers and monitored by keepalives.
    pub fn handle_registration(
        &mut self,
        request: RegistrationRequest,
        now: TimeStamp,
    ) -> Result<ElementKey> {
        let handle = request.handle.clone();
        let identifier = request.registration.identifier;
        let res = self.register(request, now);
        match &res {
            Ok(_) => {
                debug!(%handle, identifier = format_args!("${identifier:08x}"), "registered");
            }
            Err(err) => {
                warn!(%handle, identifier = format_args!("${identifier:08x}"), %err, "registration rejected");
            }
        }
        res
    }

    fn register(&mut self, request: RegistrationRequest, now: TimeStamp) -> Result<ElementKey> {
        let RegistrationRequest {
            handle,
            mut registration,
            association,
            connection,
            round_trip_time,
        } = request;
        let min_scope = self.config.min_endpoint_address_scope;

        registration.user_transport = registration
            .user_transport
            .filter(Some(&association), false, min_scope)
            .ok_or(RegistrarError::NoUsableUserAddresses)?;
        registration.registrator_transport = Some(
            association
                .filter(None, true, min_scope)
                .ok_or(RegistrarError::NoUsableAsapAddresses)?,
        );
        registration.home_registrar_identifier = self.own_identifier();
        registration.connection = Some(connection);
        self.apply_distance(&mut registration, round_trip_time);

        let (key, is_new) = self
            .handlespace
            .register_pool_element(&handle, registration, now)?;
        if is_new {
            self.stats.registrations += 1;
        } else {
            self.stats.reregistrations += 1;
        }

        let handlespace = self.handlespace.handlespace_mut();
        handlespace.deactivate_timer(key)?;
        handlespace.activate_timer(
            key,
            ElementTimer::KeepAliveTransmission,
            now + micros(self.config.endpoint_keep_alive_transmission_interval),
        )?;

        let node = self
            .handlespace
            .element(key)
            .ok_or_else(|| RegistrarError::internal("registered element vanished"))?;
        let update = OutboundMessage::handle_update(UpdateAction::Create, node);
        self.send(update);
        Ok(key)
    }

    /// Handles an ASAP deregistration. Deregistering an unknown element succeeds.
    pub fn handle_deregistration(
        &mut self,
        handle: &PoolHandle,
        identifier: PoolElementIdentifier,
    ) -> Result<()> {
        match self.handlespace.deregister_pool_element(handle, identifier)? {
            Some(node) => {
                let mut update = OutboundMessage::handle_update(UpdateAction::Delete, &node);
                if let OutboundMessage::HandleUpdate { registration, .. } = &mut update {
                    registration.home_registrar_identifier = self.own_identifier();
                }
                self.send(update);
                self.stats.deregistrations += 1;
                debug!(%handle, identifier = format_args!("${identifier:08x}"), "deregistered");
            }
            None => {
                debug!(%handle, identifier = format_args!("${identifier:08x}"), "deregistration of unknown element");
            }
        }
        Ok(())
    }

    /// Handles an ASAP handle resolution.
    ///
    /// A request for zero items gets the configured default.
    pub fn handle_resolution(
        &mut self,
        handle: &PoolHandle,
        items: usize,
    ) -> Result<HandleResolution> {
        let items = match items {
            0 => self.config.max_handle_resolution_items,
            n => n,
        };
        self.stats.handle_resolutions += 1;
        let res = self
            .handlespace
            .handle_resolution(handle, items, self.config.max_increment);
        if let Err(err) = &res {
            debug!(%handle, %err, "handle resolution failed");
        }
        res
    }

    /// Handles a keepalive acknowledgement by scheduling the next keepalive.
    pub fn handle_keep_alive_ack(
        &mut self,
        handle: &PoolHandle,
        identifier: PoolElementIdentifier,
        now: TimeStamp,
    ) -> Result<()> {
        let Some(key) = self.handlespace.find_pool_element(handle, identifier) else {
            debug!(%handle, identifier = format_args!("${identifier:08x}"), "keepalive ack for unknown element");
            return Ok(());
        };
        self.handlespace.handlespace_mut().activate_timer(
            key,
            ElementTimer::KeepAliveTransmission,
            now + micros(self.config.endpoint_keep_alive_transmission_interval),
        )
    }

    /// Handles an endpoint unreachable report, removing the element once enough reports
    /// have arrived.
    pub fn handle_endpoint_unreachable(
        &mut self,
        handle: &PoolHandle,
        identifier: PoolElementIdentifier,
    ) -> Result<()> {
        self.stats.failure_reports += 1;
        let Some(key) = self.handlespace.find_pool_element(handle, identifier) else {
            return Ok(());
        };
        let reports = {
            let node = self
                .handlespace
                .handlespace_mut()
                .element_mut(key)
                .ok_or(RegistrarError::NotFound)?;
            node.unreachability_reports += 1;
            node.unreachability_reports
        };
        if reports >= self.config.max_bad_pe_reports {
            info!(%handle, identifier = format_args!("${identifier:08x}"), reports, "removing unreachable element");
            self.remove_element(key)?;
        }
        Ok(())
    }

    /// Removes every element registered over a lost association. Returns the number removed.
    pub fn remove_elements_of_connection(&mut self, connection: Connection) -> Result<usize> {
        let keys = self
            .handlespace
            .handlespace()
            .elements_of_connection(connection);
        for key in &keys {
            self.remove_element(*key)?;
        }
        if !keys.is_empty() {
            debug!(
                socket_descriptor = connection.socket_descriptor,
                assoc_id = connection.assoc_id,
                removed = keys.len(),
                "removed elements of closed association"
            );
        }
        Ok(keys.len())
    }

    /// Fires all element timers due at `now`. Returns the number fired.
    pub fn handle_element_timers(&mut self, now: TimeStamp) -> Result<usize> {
        let due = self.handlespace.handlespace().due_timers(now);
        for key in &due {
            let key = *key;
            let Some((timer, _)) = self.handlespace.element(key).and_then(PoolElementNode::timer)
            else {
                continue;
            };
            match timer {
                ElementTimer::KeepAliveTransmission => {
                    self.handlespace.handlespace_mut().deactivate_timer(key)?;
                    let node = self.handlespace.element(key).ok_or(RegistrarError::NotFound)?;
                    let keep_alive = OutboundMessage::keep_alive(node, false);
                    if self.send(keep_alive) {
                        if let Some(node) = self.handlespace.handlespace_mut().element_mut(key) {
                            node.last_keep_alive_transmission = now;
                        }
                    }
                    self.handlespace.handlespace_mut().activate_timer(
                        key,
                        ElementTimer::KeepAliveTimeout,
                        now + micros(self.config.endpoint_keep_alive_timeout_interval),
                    )?;
                }
                ElementTimer::KeepAliveTimeout | ElementTimer::Expiry => {
                    let node = self.remove_element(key)?;
                    debug!(handle = %node.handle(), identifier = format_args!("${:08x}", node.identifier()), %timer, "element timed out");
                }
            }
        }
        Ok(due.len())
    }

    /// Fires all peer timers due at `now`. Returns the number fired.
    pub fn handle_peer_timers(&mut self, now: TimeStamp) -> Result<usize> {
        let due = self.peers.due_timers(now);
        for key in &due {
            let Some((timer, _)) = self.peers.get(key).and_then(PeerListNode::timer) else {
                continue;
            };
            self.peers.deactivate_timer(key);
            let peer_id = key.identifier();
            match timer {
                PeerTimer::MaxTimeLastHeard => {
                    debug!(peer = format_args!("${peer_id:08x}"), "peer not heard, probing");
                    let probe = self.presence(PeerDestination::Peer(peer_id), true);
                    self.send(probe);
                    self.peers.activate_timer(
                        key,
                        PeerTimer::MaxTimeNoResponse,
                        now + micros(self.config.peer_max_time_no_response),
                    )?;
                }
                PeerTimer::MaxTimeNoResponse => self.peer_not_responding(key, now)?,
                PeerTimer::TakeoverExpiry => {
                    if let Some(process) = self
                        .peers
                        .get_mut(key)
                        .and_then(|peer| peer.takeover_process.take())
                    {
                        warn!(%process, "takeover expired");
                    }
                    self.peers.deregister_by_key(key)?;
                }
            }
        }
        Ok(due.len())
    }

    /// Fires every element and peer timer due at `now`.
    pub fn handle_timers(&mut self, now: TimeStamp) -> Result<usize> {
        Ok(self.handle_element_timers(now)? + self.handle_peer_timers(now)?)
    }

    fn peer_not_responding(&mut self, key: &PeerKey, now: TimeStamp) -> Result<()> {
        let peer_id = key.identifier();
        let taken_over_by_other = self
            .peers
            .get(key)
            .ok_or(RegistrarError::NotFound)?
            .takeover_registrar_identifier
            != UNDEFINED_REGISTRAR_IDENTIFIER;
        let owns_elements = self
            .handlespace
            .handlespace()
            .owned_element_count_of(peer_id)
            > 0;

        if taken_over_by_other || !owns_elements {
            info!(peer = format_args!("${peer_id:08x}"), "removing dead peer");
            return self.peers.deregister_by_key(key);
        }

        let process = TakeoverProcess::new(peer_id, &self.peers)?;
        info!(%process, "initiating takeover of dead peer");
        let complete = process.is_complete();
        if let Some(peer) = self.peers.get_mut(key) {
            peer.takeover_process = Some(process);
        }
        self.send(OutboundMessage::InitTakeover { target: peer_id });
        self.peers.activate_timer(
            key,
            PeerTimer::TakeoverExpiry,
            now + micros(self.config.takeover_expiry_interval),
        )?;
        if complete {
            self.finish_takeover(key, now)?;
        }
        Ok(())
    }

    fn finish_takeover(&mut self, key: &PeerKey, now: TimeStamp) -> Result<()> {
        let target = key.identifier();
        let own = self.own_identifier();
        self.send(OutboundMessage::TakeoverServer { target });

        let elements = self.handlespace.handlespace().elements_owned_by(target);
        for element in &elements {
            let element = *element;
            let handlespace = self.handlespace.handlespace_mut();
            handlespace.deactivate_timer(element)?;
            handlespace.update_ownership(element, own)?;
            let node = handlespace.element(element).ok_or(RegistrarError::NotFound)?;
            let keep_alive = OutboundMessage::keep_alive(node, true);
            self.send(keep_alive);
            self.handlespace.handlespace_mut().activate_timer(
                element,
                ElementTimer::KeepAliveTimeout,
                now + micros(self.config.endpoint_keep_alive_timeout_interval),
            )?;
        }
        info!(target = format_args!("${target:08x}"), elements = elements.len(), "takeover finished");
        self.stats.takeovers += 1;

        if let Some(peer) = self.peers.get_mut(key) {
            peer.takeover_process = None;
        }
        self.peers.deregister_by_key(key)
    }

    /// Applies a handle update received from a peer.
    ///
    /// Updates about elements owned by this registrar are ignored; this registrar is their
    /// authority.
    pub fn handle_peer_handle_update(
        &mut self,
        update: PeerHandleUpdate,
        now: TimeStamp,
    ) -> Result<()> {
        let PeerHandleUpdate {
            sender,
            action,
            handle,
            mut registration,
            round_trip_time,
        } = update;
        if sender == self.own_identifier() {
            trace!("skipping own handle update");
            return Ok(());
        }
        self.stats.updates += 1;

        match action {
            UpdateAction::Create | UpdateAction::Update => {
                if registration.home_registrar_identifier == self.own_identifier() {
                    debug!(%handle, identifier = format_args!("${:08x}", registration.identifier), "ignoring peer update of own element");
                    return Ok(());
                }
                registration.connection = None;
                self.apply_distance(&mut registration, round_trip_time);
                let life = registration.registration_life;
                let (key, _) = self
                    .handlespace
                    .register_pool_element(&handle, registration, now)?;
                self.handlespace.restart_expiry_timer(key, life)?;
            }
            UpdateAction::Delete => {
                if let Some(key) = self
                    .handlespace
                    .find_pool_element(&handle, registration.identifier)
                {
                    self.handlespace.deregister_pool_element_by_key(key)?;
                }
            }
        }
        Ok(())
    }

    /// Handles a peer's presence.
    ///
    /// Registers or refreshes the peer, requests a handle table synchronization if its
    /// ownership checksum disagrees with ours, and cancels any takeover of it.
    pub fn handle_presence(&mut self, presence: Presence, now: TimeStamp) -> Result<()> {
        let Presence {
            sender,
            address_block,
            checksum,
            reply_required,
        } = presence;
        if sender == self.own_identifier() {
            trace!("skipping own presence");
            return Ok(());
        }

        let key = self
            .peers
            .register(sender, PeerFlags::DYNAMIC, address_block, now)
            .inspect_err(|err| warn!(peer = format_args!("${sender:08x}"), %err, "failed to add peer"))?;

        if self.peers.get(&key).is_some_and(PeerListNode::is_new) {
            debug!(peer = format_args!("${sender:08x}"), "new peer, sending presence");
            let greeting = self.presence(PeerDestination::Peer(sender), true);
            self.send(greeting);
        }

        let tracked = self
            .handlespace
            .handlespace()
            .ownership_checksum_accumulator_of(sender)
            .finish();
        let needs_sync = {
            let peer = self.peers.get_mut(&key).ok_or(RegistrarError::NotFound)?;
            let needs_sync = !peer.status.contains(PeerStatus::HTSYNC) && tracked != checksum;
            if needs_sync {
                peer.status.insert(PeerStatus::HTSYNC);
            }
            needs_sync
        };
        if needs_sync {
            debug!(
                peer = format_args!("${sender:08x}"),
                ours = format_args!("${tracked:04x}"),
                theirs = format_args!("${checksum:04x}"),
                "handle table synchronization required"
            );
            self.send(OutboundMessage::HandleTableRequest {
                to: sender,
                flags: HandleTableFlags::OWN_CHILDREN_ONLY,
            });
            self.handlespace.mark_pool_element_nodes(sender);
        }

        self.peers.activate_timer(
            &key,
            PeerTimer::MaxTimeLastHeard,
            now + micros(self.config.peer_max_time_last_heard),
        )?;

        if reply_required {
            let reply = self.presence(PeerDestination::Peer(sender), false);
            self.send(reply);
        }

        if let Some(peer) = self.peers.get_mut(&key) {
            peer.takeover_registrar_identifier = UNDEFINED_REGISTRAR_IDENTIFIER;
            if let Some(process) = peer.takeover_process.take() {
                info!(%process, "peer is alive, takeover cancelled");
            }
        }
        Ok(())
    }

    /// Sends the periodic presence to all peers.
    pub fn send_heartbeat(&mut self) {
        let heartbeat = self.presence(PeerDestination::All, false);
        self.send(heartbeat);
    }

    /// Answers a peer's handle table request with the next page of our handle table.
    ///
    /// Each peer has its own cursor, which is reset once the last page has been sent.
    pub fn handle_handle_table_request(
        &mut self,
        sender: RegistrarIdentifier,
        mut flags: HandleTableFlags,
    ) -> HandleTableResponse {
        let max_elements = self.config.max_elements_per_handle_table_request;
        let own = self.own_identifier();
        let extract = self.table_cursors.entry(sender).or_insert_with(|| {
            flags |= HandleTableFlags::START;
            HandleTableExtract::new()
        });
        self.handlespace
            .get_handle_table(own, extract, flags, max_elements);

        let entries: Vec<_> = extract
            .elements
            .iter()
            .filter_map(|key| self.handlespace.element(*key))
            .map(|node| (node.handle().clone(), node.to_registration()))
            .collect();
        let more = entries.len() >= max_elements.min(crate::management::NTE_MAX_POOL_ELEMENT_NODES);
        if !more {
            self.table_cursors.remove(&sender);
        }
        HandleTableResponse { entries, more }
    }

    /// Applies one page of a peer's handle table.
    ///
    /// After the last page, elements of the peer that were not confirmed are purged.
    pub fn handle_handle_table_response(
        &mut self,
        sender: RegistrarIdentifier,
        response: HandleTableResponse,
        now: TimeStamp,
    ) -> Result<()> {
        if sender == self.own_identifier() {
            return Ok(());
        }
        let Some(key) = self.peers.find(sender, None) else {
            warn!(peer = format_args!("${sender:08x}"), "handle table from unknown peer");
            return Ok(());
        };

        for (handle, registration) in response.entries {
            if registration.home_registrar_identifier == self.own_identifier() {
                continue;
            }
            let life = registration.registration_life;
            let (element, _) = match self.handlespace.register_pool_element(
                &handle,
                ElementRegistration {
                    connection: None,
                    ..registration
                },
                now,
            ) {
                Ok(res) => res,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(%handle, %err, "failed to apply handle table entry");
                    continue;
                }
            };
            let has_timer = self
                .handlespace
                .element(element)
                .is_some_and(|node| node.timer().is_some());
            if !has_timer {
                self.handlespace.restart_expiry_timer(element, life)?;
            }
        }

        if response.more {
            let flags = match self.peers.get(&key) {
                Some(peer) if peer.status.contains(PeerStatus::MENTOR) => HandleTableFlags::NONE,
                _ => HandleTableFlags::OWN_CHILDREN_ONLY,
            };
            self.send(OutboundMessage::HandleTableRequest { to: sender, flags });
            return Ok(());
        }

        if let Some(peer) = self.peers.get_mut(&key) {
            peer.status.remove(PeerStatus::MENTOR);
            peer.status.remove(PeerStatus::HTSYNC);
        }
        let purged = self.handlespace.purge_marked_pool_element_nodes(sender)?;
        if purged > 0 {
            debug!(peer = format_args!("${sender:08x}"), purged, "purged stale elements after synchronization");
        }
        self.stats.synchronizations += 1;
        Ok(())
    }

    /// Handles a peer's announcement that it takes over `target`.
    pub fn handle_init_takeover(
        &mut self,
        sender: RegistrarIdentifier,
        target: RegistrarIdentifier,
        now: TimeStamp,
    ) -> Result<()> {
        let own = self.own_identifier();
        if sender == own {
            return Ok(());
        }
        if target == own {
            warn!(peer = format_args!("${sender:08x}"), "peer tries to take us over, announcing presence");
            let presence = self.presence(PeerDestination::All, false);
            self.send(presence);
            return Ok(());
        }

        let ack = OutboundMessage::InitTakeoverAck { to: sender, target };
        let Some(key) = self.peers.find(target, None) else {
            self.send(ack);
            return Ok(());
        };
        let peer = self.peers.get_mut(&key).ok_or(RegistrarError::NotFound)?;
        if peer.takeover_process.is_none() {
            peer.takeover_registrar_identifier = sender;
            self.send(ack);
            return Ok(());
        }

        if sender < own {
            info!(target = format_args!("${target:08x}"), winner = format_args!("${sender:08x}"), "conflicting takeover, peer wins");
            peer.takeover_registrar_identifier = sender;
            peer.takeover_process = None;
            self.send(ack);
            self.peers.activate_timer(
                &key,
                PeerTimer::MaxTimeNoResponse,
                now + micros(self.config.peer_max_time_no_response),
            )?;
        } else {
            debug!(target = format_args!("${target:08x}"), loser = format_args!("${sender:08x}"), "conflicting takeover, we win");
        }
        Ok(())
    }

    /// Handles a peer's acknowledgement of our takeover of `target`.
    pub fn handle_init_takeover_ack(
        &mut self,
        sender: RegistrarIdentifier,
        target: RegistrarIdentifier,
        now: TimeStamp,
    ) -> Result<()> {
        let Some(key) = self.peers.find(target, None) else {
            return Ok(());
        };
        let Some(process) = self
            .peers
            .get_mut(&key)
            .and_then(|peer| peer.takeover_process.as_mut())
        else {
            debug!(target = format_args!("${target:08x}"), "acknowledgement for takeover we do not run");
            return Ok(());
        };
        let outstanding = process.acknowledge(target, sender);
        trace!(target = format_args!("${target:08x}"), outstanding, "takeover acknowledged");
        if outstanding == 0 {
            self.finish_takeover(&key, now)?;
        }
        Ok(())
    }

    /// Handles a peer's announcement that it now serves `target`'s elements.
    pub fn handle_takeover_server(
        &mut self,
        sender: RegistrarIdentifier,
        target: RegistrarIdentifier,
    ) -> Result<usize> {
        if sender == self.own_identifier() || target == self.own_identifier() {
            return Ok(0);
        }
        let handlespace = self.handlespace.handlespace_mut();
        let elements = handlespace.elements_owned_by(target);
        for element in &elements {
            handlespace.update_ownership(*element, sender)?;
        }
        info!(target = format_args!("${target:08x}"), by = format_args!("${sender:08x}"), elements = elements.len(), "elements taken over by peer");
        Ok(elements.len())
    }
}

fn random_identifier(seed: Option<u64>) -> RegistrarIdentifier {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    loop {
        let id: RegistrarIdentifier = rng.random();
        if id != UNDEFINED_REGISTRAR_IDENTIFIER {
            return id;
        }
    }
}
