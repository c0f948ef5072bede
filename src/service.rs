//! Running a [`Registrar`] as a tokio task.
//!
//! The task owns the registrar exclusively and processes one request at a time, so every
//! operation sees a consistent handlespace. Between requests it sleeps until the earliest
//! element or peer timer is due and sends a presence to all peers every heartbeat cycle.
//!
//! The task stops when [`RegistrarRef::stop`] is called or when the last [`RegistrarRef`] is
//! dropped.
//!
//! ```no_run
//! use rserpool_registrar::{OutboundMessage, Registrar, RegistrarConfig, service};
//! use tokio::sync::mpsc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let (tx, mut outbound) = mpsc::unbounded_channel::<OutboundMessage>();
//! let registrar = service::spawn(Registrar::new(RegistrarConfig::default(), tx));
//! println!("running as ${:08x}", registrar.own_identifier().await.unwrap());
//! while let Some(message) = outbound.recv().await {
//!     // hand the message to the ASAP/ENRP transport
//! #   let _ = message;
//! }
//! # }
//! ```

use std::{fmt, future, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    time::MissedTickBehavior,
};
use tracing::{error, trace, warn};

use crate::{
    clock::{Clock, TimeStamp, TokioClock},
    element::{
        Connection, ElementRegistration, PoolElementIdentifier, PoolElementNode,
        RegistrarIdentifier,
    },
    error::{RegistrarError, ServiceError},
    handlespace::HandlespaceChange,
    management::HandleTableFlags,
    pool_handle::PoolHandle,
    registrar::{
        HandleTableResponse, PeerHandleUpdate, Presence, Registrar, RegistrarNotifier,
        RegistrarStats, RegistrationRequest,
    },
};

type Job<N> = Box<dyn FnOnce(&mut Registrar<N>, TimeStamp) -> Option<RegistrarError> + Send>;

enum Signal<N> {
    Job(Job<N>),
    Stop,
}

/// Why a registrar task stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Stopped on request or because all references were dropped.
    Normal,
    /// An internal consistency violation was detected.
    Failed(RegistrarError),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Normal => write!(f, "stopped normally"),
            StopReason::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// A handle to a running registrar task.
pub struct RegistrarRef<N> {
    mailbox: mpsc::UnboundedSender<Signal<N>>,
}

impl<N> Clone for RegistrarRef<N> {
    fn clone(&self) -> Self {
        RegistrarRef {
            mailbox: self.mailbox.clone(),
        }
    }
}

impl<N: RegistrarNotifier> fmt::Debug for RegistrarRef<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrarRef")
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Spawns a registrar task driven by tokio's clock.
pub fn spawn<N: RegistrarNotifier>(registrar: Registrar<N>) -> RegistrarRef<N> {
    spawn_with_clock(registrar, TokioClock::new())
}

/// Spawns a registrar task driven by the given clock.
pub fn spawn_with_clock<N, C>(registrar: Registrar<N>, clock: C) -> RegistrarRef<N>
where
    N: RegistrarNotifier,
    C: Clock,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_registrar(registrar, clock, rx));
    RegistrarRef { mailbox: tx }
}

async fn run_registrar<N, C>(
    mut registrar: Registrar<N>,
    clock: C,
    mut mailbox_rx: mpsc::UnboundedReceiver<Signal<N>>,
) where
    N: RegistrarNotifier,
    C: Clock,
{
    let identifier = registrar.own_identifier();
    trace!(identifier = format_args!("${identifier:08x}"), "registrar started");

    let mut heartbeat = tokio::time::interval(registrar.config().peer_heartbeat_cycle);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        let deadline = registrar.next_timer_timestamp();
        let now = clock.now();
        let timers_due = async move {
            match deadline {
                Some(ts) => tokio::time::sleep(Duration::from_micros(ts.saturating_sub(now))).await,
                None => future::pending().await,
            }
        };

        tokio::select! {
            signal = mailbox_rx.recv() => match signal {
                Some(Signal::Job(job)) => {
                    if let Some(err) = job(&mut registrar, clock.now()) {
                        break StopReason::Failed(err);
                    }
                }
                Some(Signal::Stop) | None => break StopReason::Normal,
            },
            _ = timers_due => {
                if let Err(err) = registrar.handle_timers(clock.now()) {
                    if err.is_fatal() {
                        break StopReason::Failed(err);
                    }
                    warn!(%err, "timer handling failed");
                }
            }
            _ = heartbeat.tick() => registrar.send_heartbeat(),
        }
    };

    match &reason {
        StopReason::Normal => {
            trace!(identifier = format_args!("${identifier:08x}"), %reason, "registrar stopped");
        }
        StopReason::Failed(_) => {
            error!(identifier = format_args!("${identifier:08x}"), %reason, "registrar stopped");
        }
    }
}

impl<N: RegistrarNotifier> RegistrarRef<N> {
    /// Returns `true` while the registrar task is running.
    pub fn is_alive(&self) -> bool {
        !self.mailbox.is_closed()
    }

    /// Runs `f` on the registrar inside its task and returns the result.
    ///
    /// A fatal error returned by `f` stops the registrar after it has been delivered.
    ///
    /// ```
    /// # use rserpool_registrar::{OutboundMessage, Registrar, RegistrarConfig};
    /// # tokio_test::block_on(async {
    /// let (tx, _outbound) = tokio::sync::mpsc::unbounded_channel::<OutboundMessage>();
    /// let config = RegistrarConfig::with_identifier(7);
    /// let registrar = rserpool_registrar::spawn(Registrar::new(config, tx));
    ///
    /// let peers = registrar.ask(|registrar, _now| Ok(registrar.peers().len())).await?;
    /// assert_eq!(peers, 0);
    /// # Ok::<(), rserpool_registrar::ServiceError>(())
    /// # }).unwrap();
    /// ```
    pub async fn ask<F, T>(&self, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce(&mut Registrar<N>, TimeStamp) -> Result<T, RegistrarError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job<N> = Box::new(move |registrar, now| {
            let res = f(registrar, now);
            let fatal = res.as_ref().err().filter(|err| err.is_fatal()).cloned();
            let _ = reply_tx.send(res);
            fatal
        });
        self.mailbox
            .send(Signal::Job(job))
            .map_err(|_| ServiceError::RegistrarNotRunning)?;
        let res = reply_rx.await.map_err(|_| ServiceError::RegistrarStopped)?;
        Ok(res?)
    }

    /// Stops the registrar task.
    pub fn stop(&self) -> Result<(), ServiceError> {
        self.mailbox
            .send(Signal::Stop)
            .map_err(|_| ServiceError::RegistrarNotRunning)
    }

    /// Own registrar identifier.
    pub async fn own_identifier(&self) -> Result<RegistrarIdentifier, ServiceError> {
        self.ask(|registrar, _| Ok(registrar.own_identifier())).await
    }

    /// Handles an ASAP registration.
    pub async fn register(&self, request: RegistrationRequest) -> Result<(), ServiceError> {
        self.ask(move |registrar, now| registrar.handle_registration(request, now).map(drop))
            .await
    }

    /// Handles an ASAP deregistration.
    pub async fn deregister(
        &self,
        handle: PoolHandle,
        identifier: PoolElementIdentifier,
    ) -> Result<(), ServiceError> {
        self.ask(move |registrar, _| registrar.handle_deregistration(&handle, identifier))
            .await
    }

    /// Handles an ASAP handle resolution, returning the selected elements.
    pub async fn handle_resolution(
        &self,
        handle: PoolHandle,
        items: usize,
    ) -> Result<Vec<ElementRegistration>, ServiceError> {
        self.ask(move |registrar, _| {
            let res = registrar.handle_resolution(&handle, items)?;
            Ok(res
                .elements
                .iter()
                .filter_map(|key| registrar.handlespace().element(*key))
                .map(PoolElementNode::to_registration)
                .collect())
        })
        .await
    }

    /// Handles a keepalive acknowledgement.
    pub async fn keep_alive_ack(
        &self,
        handle: PoolHandle,
        identifier: PoolElementIdentifier,
    ) -> Result<(), ServiceError> {
        self.ask(move |registrar, now| registrar.handle_keep_alive_ack(&handle, identifier, now))
            .await
    }

    /// Handles an endpoint unreachable report.
    pub async fn endpoint_unreachable(
        &self,
        handle: PoolHandle,
        identifier: PoolElementIdentifier,
    ) -> Result<(), ServiceError> {
        self.ask(move |registrar, _| registrar.handle_endpoint_unreachable(&handle, identifier))
            .await
    }

    /// Removes the elements of a closed association.
    pub async fn connection_lost(&self, connection: Connection) -> Result<usize, ServiceError> {
        self.ask(move |registrar, _| registrar.remove_elements_of_connection(connection))
            .await
    }

    /// Handles a peer's presence.
    pub async fn presence(&self, presence: Presence) -> Result<(), ServiceError> {
        self.ask(move |registrar, now| registrar.handle_presence(presence, now))
            .await
    }

    /// Applies a peer's handle update.
    pub async fn peer_handle_update(&self, update: PeerHandleUpdate) -> Result<(), ServiceError> {
        self.ask(move |registrar, now| registrar.handle_peer_handle_update(update, now))
            .await
    }

    /// Answers a peer's handle table request.
    pub async fn handle_table_request(
        &self,
        sender: RegistrarIdentifier,
        flags: HandleTableFlags,
    ) -> Result<HandleTableResponse, ServiceError> {
        self.ask(move |registrar, _| Ok(registrar.handle_handle_table_request(sender, flags)))
            .await
    }

    /// Applies a page of a peer's handle table.
    pub async fn handle_table_response(
        &self,
        sender: RegistrarIdentifier,
        response: HandleTableResponse,
    ) -> Result<(), ServiceError> {
        self.ask(move |registrar, now| {
            registrar.handle_handle_table_response(sender, response, now)
        })
        .await
    }

    /// Handles a peer's takeover announcement.
    pub async fn init_takeover(
        &self,
        sender: RegistrarIdentifier,
        target: RegistrarIdentifier,
    ) -> Result<(), ServiceError> {
        self.ask(move |registrar, now| registrar.handle_init_takeover(sender, target, now))
            .await
    }

    /// Handles a peer's takeover acknowledgement.
    pub async fn init_takeover_ack(
        &self,
        sender: RegistrarIdentifier,
        target: RegistrarIdentifier,
    ) -> Result<(), ServiceError> {
        self.ask(move |registrar, now| registrar.handle_init_takeover_ack(sender, target, now))
            .await
    }

    /// Handles a peer's takeover server announcement.
    pub async fn takeover_server(
        &self,
        sender: RegistrarIdentifier,
        target: RegistrarIdentifier,
    ) -> Result<usize, ServiceError> {
        self.ask(move |registrar, _| registrar.handle_takeover_server(sender, target))
            .await
    }

    /// Request counters.
    pub async fn stats(&self) -> Result<RegistrarStats, ServiceError> {
        self.ask(|registrar, _| Ok(registrar.stats())).await
    }

    /// Human readable dump of the handlespace and peer list.
    pub async fn describe(&self) -> Result<String, ServiceError> {
        self.ask(|registrar, _| {
            let mut out = String::new();
            registrar
                .describe(&mut out)
                .map_err(|_| RegistrarError::internal("failed to describe registrar"))?;
            Ok(out)
        })
        .await
    }

    /// Subscribes to handlespace changes, replacing any previous subscriber.
    pub async fn subscribe_changes(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<HandlespaceChange>, ServiceError> {
        self.ask(|registrar, _| {
            let (tx, rx) = mpsc::unbounded_channel();
            registrar.handlespace_mut().handlespace_mut().set_observer(tx);
            Ok(rx)
        })
        .await
    }
}
