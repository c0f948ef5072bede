use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use rserpool_registrar::{
    error::{RegistrarError, ServiceError},
    policy::{PPT_ROUNDROBIN, PPT_WEIGHTED_RANDOM},
    registrar::{PeerDestination, RegistrationRequest},
    Connection, ElementRegistration, OutboundMessage, PoolHandle, PoolPolicySettings, Registrar,
    RegistrarConfig, TransportAddressBlock, TransportProtocol, UpdateAction,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn spawn(
    identifier: u32,
) -> (
    rserpool_registrar::RegistrarRef<mpsc::UnboundedSender<OutboundMessage>>,
    mpsc::UnboundedReceiver<OutboundMessage>,
) {
    init_tracing();
    let (tx, rx) = mpsc::unbounded_channel();
    let config = RegistrarConfig {
        selection_seed: Some(7),
        ..RegistrarConfig::with_identifier(identifier)
    };
    (rserpool_registrar::spawn(Registrar::new(config, tx)), rx)
}

fn pool() -> PoolHandle {
    PoolHandle::try_from("EchoPool").unwrap()
}

fn request(identifier: u32, policy_type: u32) -> RegistrationRequest {
    let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, identifier as u8));
    RegistrationRequest {
        handle: pool(),
        registration: ElementRegistration {
            identifier,
            home_registrar_identifier: 0,
            registration_life: 30_000_000,
            policy_settings: PoolPolicySettings {
                weight: 1,
                ..PoolPolicySettings::new(policy_type)
            },
            user_transport: TransportAddressBlock::new(TransportProtocol::Sctp, 7, [addr]),
            registrator_transport: None,
            connection: None,
        },
        association: TransportAddressBlock::new(TransportProtocol::Sctp, 3863, [addr]),
        connection: Connection::new(3, identifier),
        round_trip_time: None,
    }
}

/// Drains everything sent so far, skipping presences.
fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Vec<OutboundMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if !matches!(message, OutboundMessage::Presence { .. }) {
            messages.push(message);
        }
    }
    messages
}

#[tokio::test(start_paused = true)]
async fn register_and_resolve() {
    let (registrar, mut outbound) = spawn(0x100);
    assert_eq!(registrar.own_identifier().await.unwrap(), 0x100);

    for id in 1..=4 {
        registrar.register(request(id, PPT_ROUNDROBIN)).await.unwrap();
    }
    let updates = drain(&mut outbound);
    assert_eq!(updates.len(), 4);
    assert!(updates.iter().all(|message| matches!(
        message,
        OutboundMessage::HandleUpdate {
            action: UpdateAction::Create,
            registration,
            ..
        } if registration.home_registrar_identifier == 0x100
    )));

    let first = registrar.handle_resolution(pool(), 2).await.unwrap();
    let second = registrar.handle_resolution(pool(), 2).await.unwrap();
    let mut ids = first
        .iter()
        .chain(&second)
        .map(|registration| registration.identifier)
        .collect::<Vec<_>>();
    ids.sort_unstable();
    // round robin advances by one element per resolution
    assert_eq!(ids, [1, 2, 2, 3]);

    let stats = registrar.stats().await.unwrap();
    assert_eq!(stats.registrations, 4);
    assert_eq!(stats.handle_resolutions, 2);
}

#[tokio::test(start_paused = true)]
async fn rejected_registration_is_reported() {
    let (registrar, _outbound) = spawn(0x100);
    registrar.register(request(1, PPT_ROUNDROBIN)).await.unwrap();

    let err = registrar
        .register(request(2, PPT_WEIGHTED_RANDOM))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ServiceError::Registrar(RegistrarError::IncompatiblePoolPolicy)
    );
    assert_eq!(err.code(), Some(RegistrarError::IncompatiblePoolPolicy.code()));

    let err = registrar.handle_resolution(PoolHandle::try_from("Nothing").unwrap(), 1).await;
    assert_eq!(
        err.unwrap_err(),
        ServiceError::Registrar(RegistrarError::NotFound)
    );

    // the registrar keeps running after request errors
    assert!(registrar.is_alive());
    assert_eq!(registrar.stats().await.unwrap().registrations, 1);
}

#[tokio::test(start_paused = true)]
async fn unanswered_keepalive_removes_element() {
    let (registrar, mut outbound) = spawn(0x100);
    registrar.register(request(9, PPT_ROUNDROBIN)).await.unwrap();
    drain(&mut outbound);

    tokio::time::sleep(Duration::from_secs(6)).await;
    let messages = drain(&mut outbound);
    assert!(
        matches!(
            messages.as_slice(),
            [OutboundMessage::KeepAlive {
                identifier: 9,
                new_home: false,
                ..
            }]
        ),
        "{messages:?}"
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    let messages = drain(&mut outbound);
    assert!(
        matches!(
            messages.as_slice(),
            [OutboundMessage::HandleUpdate {
                action: UpdateAction::Delete,
                ..
            }]
        ),
        "{messages:?}"
    );
    assert_eq!(
        registrar.handle_resolution(pool(), 1).await.unwrap_err(),
        ServiceError::Registrar(RegistrarError::NotFound)
    );
}

#[tokio::test(start_paused = true)]
async fn acknowledged_keepalive_keeps_element() {
    let (registrar, mut outbound) = spawn(0x100);
    registrar.register(request(9, PPT_ROUNDROBIN)).await.unwrap();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(6)).await;
        let messages = drain(&mut outbound);
        assert!(messages
            .iter()
            .any(|message| matches!(message, OutboundMessage::KeepAlive { identifier: 9, .. })));
        registrar.keep_alive_ack(pool(), 9).await.unwrap();
    }

    let elements = registrar.handle_resolution(pool(), 1).await.unwrap();
    assert_eq!(elements[0].identifier, 9);
}

#[tokio::test(start_paused = true)]
async fn closed_association_removes_its_elements() {
    let (registrar, _outbound) = spawn(0x100);
    registrar.register(request(1, PPT_ROUNDROBIN)).await.unwrap();
    registrar.register(request(2, PPT_ROUNDROBIN)).await.unwrap();

    let removed = registrar.connection_lost(Connection::new(3, 1)).await.unwrap();
    assert_eq!(removed, 1);
    let elements = registrar.handle_resolution(pool(), 5).await.unwrap();
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].identifier, 2);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_is_sent_every_cycle() {
    let (registrar, mut outbound) = spawn(0x100);
    let cycle = RegistrarConfig::default().peer_heartbeat_cycle;

    tokio::time::sleep(cycle * 3 + Duration::from_millis(1)).await;
    let mut heartbeats = 0;
    while let Ok(message) = outbound.try_recv() {
        if let OutboundMessage::Presence {
            to: PeerDestination::All,
            reply_required: false,
            ..
        } = message
        {
            heartbeats += 1;
        }
    }
    assert_eq!(heartbeats, 4);
    registrar.stop().unwrap();
}

#[tokio::test(start_paused = true)]
async fn subscribers_see_changes() {
    let (registrar, _outbound) = spawn(0x100);
    let mut changes = registrar.subscribe_changes().await.unwrap();

    registrar.register(request(5, PPT_ROUNDROBIN)).await.unwrap();
    registrar.deregister(pool(), 5).await.unwrap();

    let created = changes.recv().await.unwrap();
    assert_eq!(created.action, UpdateAction::Create);
    assert_eq!(created.identifier, 5);
    let deleted = changes.recv().await.unwrap();
    assert_eq!(deleted.action, UpdateAction::Delete);
}

#[tokio::test(start_paused = true)]
async fn stop_ends_the_task() {
    let (registrar, mut outbound) = spawn(0x100);
    registrar.register(request(1, PPT_ROUNDROBIN)).await.unwrap();
    registrar.stop().unwrap();

    let err = registrar.stats().await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::RegistrarNotRunning | ServiceError::RegistrarStopped
    ));

    // the registrar, and with it the notifier, is dropped
    while outbound.recv().await.is_some() {}
    assert!(!registrar.is_alive());
    assert_eq!(format!("{registrar:?}"), "RegistrarRef { alive: false }");
    assert_eq!(registrar.stop(), Err(ServiceError::RegistrarNotRunning));
}

#[tokio::test(start_paused = true)]
async fn dropping_last_ref_ends_the_task() {
    let (registrar, mut outbound) = spawn(0x100);
    let other = registrar.clone();
    drop(registrar);
    assert_eq!(other.own_identifier().await.unwrap(), 0x100);
    drop(other);

    while outbound.recv().await.is_some() {}
}

#[tokio::test(start_paused = true)]
async fn describe_lists_pools() {
    let (registrar, _outbound) = spawn(0x100);
    registrar.register(request(3, PPT_ROUNDROBIN)).await.unwrap();
    let dump = registrar.describe().await.unwrap();
    assert!(dump.contains("EchoPool"), "{dump}");
}
