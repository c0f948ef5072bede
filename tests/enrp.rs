//! Several registrars exchanging ENRP messages through an in-memory mesh.

use std::net::{IpAddr, Ipv4Addr};

use rserpool_registrar::{
    clock::{Clock, ManualClock, TimeStamp},
    element::ElementTimer,
    policy::PPT_LEASTUSED,
    registrar::{
        PeerDestination, PeerHandleUpdate, Presence, RegistrationRequest,
    },
    Connection, ElementRegistration, OutboundMessage, PoolHandle, PoolPolicySettings,
    Registrar, RegistrarConfig, RegistrarIdentifier, RegistrarNotifier, TransportAddressBlock,
    TransportProtocol,
};
use tracing_subscriber::EnvFilter;

const SECOND: TimeStamp = 1_000_000;

#[derive(Debug, Default)]
struct Outbox(Vec<OutboundMessage>);

impl RegistrarNotifier for Outbox {
    fn send(&mut self, message: OutboundMessage) -> bool {
        self.0.push(message);
        true
    }
}

struct Mesh {
    nodes: Vec<Registrar<Outbox>>,
    alive: Vec<bool>,
    clock: ManualClock,
}

impl Mesh {
    fn new(ids: &[RegistrarIdentifier]) -> Self {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

        let nodes = ids
            .iter()
            .map(|id| {
                let config = RegistrarConfig {
                    selection_seed: Some(u64::from(*id)),
                    ..RegistrarConfig::with_identifier(*id)
                };
                Registrar::new(config, Outbox::default())
            })
            .collect::<Vec<_>>();
        Mesh {
            alive: vec![true; nodes.len()],
            nodes,
            clock: ManualClock::new(0),
        }
    }

    fn node(&self, id: RegistrarIdentifier) -> &Registrar<Outbox> {
        &self.nodes[self.position(id).unwrap()]
    }

    fn node_mut(&mut self, id: RegistrarIdentifier) -> &mut Registrar<Outbox> {
        let i = self.position(id).unwrap();
        &mut self.nodes[i]
    }

    fn position(&self, id: RegistrarIdentifier) -> Option<usize> {
        self.nodes.iter().position(|node| node.own_identifier() == id)
    }

    fn kill(&mut self, id: RegistrarIdentifier) {
        let i = self.position(id).unwrap();
        self.alive[i] = false;
    }

    fn heartbeat(&mut self) {
        for (node, alive) in self.nodes.iter_mut().zip(&self.alive) {
            if *alive {
                node.send_heartbeat();
            }
        }
        self.settle();
    }

    /// Moves time forward, fires every live node's timers, then delivers the fallout.
    fn tick(&mut self, to: TimeStamp) {
        self.clock.set(to);
        let now = self.clock.now();
        for (node, alive) in self.nodes.iter_mut().zip(&self.alive) {
            if *alive {
                node.handle_timers(now).unwrap();
            }
        }
        self.settle();
    }

    fn settle(&mut self) {
        for _ in 0..64 {
            let mut quiet = true;
            for from in 0..self.nodes.len() {
                let messages = std::mem::take(&mut self.nodes[from].notifier_mut().0);
                if !self.alive[from] {
                    continue;
                }
                for message in messages {
                    quiet = false;
                    self.deliver(from, message);
                }
            }
            if quiet {
                return;
            }
        }
        panic!("mesh did not settle");
    }

    fn deliver(&mut self, from: usize, message: OutboundMessage) {
        let now = self.clock.now();
        let sender = self.nodes[from].own_identifier();
        let targets: Vec<usize> = match &message {
            OutboundMessage::KeepAlive { .. } => Vec::new(),
            OutboundMessage::Presence {
                to: PeerDestination::Peer(id),
                ..
            }
            | OutboundMessage::HandleTableRequest { to: id, .. }
            | OutboundMessage::InitTakeoverAck { to: id, .. } => {
                self.position(*id).into_iter().collect()
            }
            _ => (0..self.nodes.len()).filter(|i| *i != from).collect(),
        };

        for to in targets {
            if !self.alive[to] {
                continue;
            }
            match message.clone() {
                OutboundMessage::KeepAlive { .. } => {}
                OutboundMessage::HandleUpdate {
                    action,
                    handle,
                    registration,
                } => self.nodes[to]
                    .handle_peer_handle_update(
                        PeerHandleUpdate {
                            sender,
                            action,
                            handle,
                            registration,
                            round_trip_time: None,
                        },
                        now,
                    )
                    .unwrap(),
                OutboundMessage::Presence {
                    reply_required,
                    checksum,
                    ..
                } => self.nodes[to]
                    .handle_presence(
                        Presence {
                            sender,
                            address_block: enrp_address(sender),
                            checksum,
                            reply_required,
                        },
                        now,
                    )
                    .unwrap(),
                OutboundMessage::HandleTableRequest { flags, .. } => {
                    let responder = self.nodes[to].own_identifier();
                    let response = self.nodes[to].handle_handle_table_request(sender, flags);
                    self.nodes[from]
                        .handle_handle_table_response(responder, response, now)
                        .unwrap();
                }
                OutboundMessage::InitTakeover { target } => self.nodes[to]
                    .handle_init_takeover(sender, target, now)
                    .unwrap(),
                OutboundMessage::InitTakeoverAck { target, .. } => self.nodes[to]
                    .handle_init_takeover_ack(sender, target, now)
                    .unwrap(),
                OutboundMessage::TakeoverServer { target } => {
                    self.nodes[to]
                        .handle_takeover_server(sender, target)
                        .unwrap();
                }
            }
        }
    }
}

fn enrp_address(id: RegistrarIdentifier) -> TransportAddressBlock {
    TransportAddressBlock::new(
        TransportProtocol::Sctp,
        9901,
        [IpAddr::V4(Ipv4Addr::new(10, 3, 0, id as u8))],
    )
}

fn handle() -> PoolHandle {
    PoolHandle::try_from("DaytimePool").unwrap()
}

fn registration_request(identifier: u32, load: u32) -> RegistrationRequest {
    let addr = IpAddr::V4(Ipv4Addr::new(10, 4, 0, identifier as u8));
    RegistrationRequest {
        handle: handle(),
        registration: ElementRegistration {
            identifier,
            home_registrar_identifier: 0,
            registration_life: 30 * SECOND,
            policy_settings: PoolPolicySettings {
                load,
                ..PoolPolicySettings::new(PPT_LEASTUSED)
            },
            user_transport: TransportAddressBlock::new(TransportProtocol::Sctp, 13, [addr]),
            registrator_transport: None,
            connection: None,
        },
        association: TransportAddressBlock::new(TransportProtocol::Sctp, 3863, [addr]),
        connection: Connection::new(5, identifier),
        round_trip_time: None,
    }
}

/// Handle updates lost on the way are recovered through handle table synchronization,
/// triggered by the checksum carried in the presence.
#[test]
fn lost_updates_are_recovered_by_synchronization() {
    let mut mesh = Mesh::new(&[0x1, 0x2]);
    for id in 1..=3 {
        mesh.node_mut(0x1)
            .handle_registration(registration_request(id, id * 100), 0)
            .unwrap();
    }
    // drop the handle updates
    mesh.node_mut(0x1).notifier_mut().0.clear();

    mesh.heartbeat();

    let second = mesh.node(0x2).handlespace().handlespace();
    assert_eq!(second.element_count(), 3);
    assert_eq!(second.owned_element_count_of(0x1), 3);
    assert_eq!(
        second.ownership_checksum_accumulator_of(0x1).finish(),
        mesh.node(0x1).handlespace().ownership_checksum()
    );
    assert_eq!(
        second.handlespace_checksum(),
        mesh.node(0x1).handlespace().handlespace_checksum()
    );
    assert_eq!(mesh.node(0x2).stats().synchronizations, 1);

    let key = second.find_element(&handle(), 2).unwrap();
    assert_eq!(
        second.element(key).unwrap().timer(),
        Some((ElementTimer::Expiry, 30 * SECOND))
    );
    mesh.node(0x2).peers().verify_checksums_in_handlespace(second).unwrap();
    second.verify().unwrap();
}

/// Updates propagate to peers, and peers resolve the pool the same way as the home.
#[test]
fn updates_propagate_to_peers() {
    let mut mesh = Mesh::new(&[0x1, 0x2]);
    mesh.heartbeat();
    mesh.node_mut(0x1)
        .handle_registration(registration_request(7, 500), 0)
        .unwrap();
    mesh.node_mut(0x1)
        .handle_registration(registration_request(8, 100), 0)
        .unwrap();
    mesh.settle();

    let resolved = mesh.node_mut(0x2).handle_resolution(&handle(), 1).unwrap();
    let key = resolved.elements[0];
    assert_eq!(
        mesh.node(0x2).handlespace().element(key).unwrap().identifier(),
        8
    );

    mesh.node_mut(0x1).handle_deregistration(&handle(), 8).unwrap();
    mesh.settle();
    assert_eq!(
        mesh.node(0x2).handlespace().handlespace().element_count(),
        1
    );
}

/// When the home registrar of an element dies, the surviving peers race for the takeover and
/// the one with the lower identifier wins.
#[test]
fn dead_registrar_is_taken_over_by_lowest_identifier() {
    let mut mesh = Mesh::new(&[0x1, 0x2, 0x3]);
    mesh.heartbeat();
    mesh.node_mut(0x3)
        .handle_registration(registration_request(42, 0), 0)
        .unwrap();
    mesh.settle();
    assert_eq!(
        mesh.node(0x1).handlespace().handlespace().owned_element_count_of(0x3),
        1
    );

    mesh.kill(0x3);
    mesh.tick(5 * SECOND);
    mesh.tick(10 * SECOND);

    for id in [0x1, 0x2] {
        let handlespace = mesh.node(id).handlespace();
        let key = handlespace.find_pool_element(&handle(), 42).unwrap();
        assert_eq!(
            handlespace.element(key).unwrap().home_registrar_identifier(),
            0x1,
            "home of element 42 at ${id:08x}"
        );
    }

    let first = mesh.node(0x1);
    assert!(first.peers().find_by_identifier(0x3).is_none());
    assert_eq!(first.stats().takeovers, 1);
    assert_eq!(mesh.node(0x2).stats().takeovers, 0);
    let key = first.handlespace().find_pool_element(&handle(), 42).unwrap();
    assert_eq!(
        first.handlespace().element(key).unwrap().timer(),
        Some((ElementTimer::KeepAliveTimeout, 15 * SECOND))
    );
    assert_eq!(
        mesh.node(0x2)
            .handlespace()
            .handlespace()
            .ownership_checksum_accumulator_of(0x1)
            .finish(),
        first.handlespace().ownership_checksum()
    );

    // the loser forgets the dead peer once its own probe times out
    mesh.node_mut(0x1)
        .handle_keep_alive_ack(&handle(), 42, 12 * SECOND)
        .unwrap();
    mesh.tick(15 * SECOND);
    assert!(mesh.node(0x2).peers().find_by_identifier(0x3).is_none());
}
