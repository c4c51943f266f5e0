//! Host router — accepts client connections and dispatches their frames.
//!
//! DESIGN
//! ======
//! The router owns the accept side of a [`Hub`]. Every accepted transport
//! becomes a port with its own receive task. SEND and REQUEST frames are
//! ACKed immediately; the handler then runs on its own task so one slow
//! handler never blocks a port.
//!
//! LIFECYCLE
//! =========
//! 1. `open` installs a listener and spawns the supervisor.
//! 2. The supervisor accepts until the listener lifetime expires.
//! 3. On expiry: `refresh` every ONLINE port, wait (bounded) for in-flight
//!    handlers to drain, swap in a fresh listener, repeat.
//!
//! Clients that were told to refresh drop their transport and reconnect to
//! the fresh listener, so a lifetime-limited host hands work off without
//! losing queued messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use frames::{Body, ConnectionName, Frame, Message, NameError, decode_frame};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::HostConfig;
use crate::hub::Hub;
use crate::registry::{HandlerContext, HandlerRegistry};
use crate::transport::{Peer, PortReceiver, PortSender, Transport};

const PANIC_MESSAGE: &str = "handler panicked";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortState {
    /// Accepted, handshake not yet posted.
    Opened,
    /// Handshake posted; frames are dispatched.
    Online,
    /// The client can no longer be written to. Not refreshed again; the port
    /// is dropped once its receive loop ends.
    Disconnected,
}

/// Host-side record of one accepted connection.
struct Port {
    name: ConnectionName,
    state: PortState,
    sender: PortSender,
    task: Option<AbortHandle>,
}

struct RouterInner {
    hub: Hub,
    identity: Peer,
    registry: Arc<HandlerRegistry>,
    config: HostConfig,
    ports: Mutex<HashMap<u64, Port>>,
    next_port: AtomicU64,
    in_flight: Arc<watch::Sender<usize>>,
    rotations: AtomicU64,
}

/// Accepts client connections on a [`Hub`] and serves them from a registry.
#[derive(Clone)]
pub struct HostRouter {
    inner: Arc<RouterInner>,
}

/// Running router. Dropping it stops the supervisor and removes the listener.
pub struct RouterHandle {
    router: HostRouter,
    supervisor: JoinHandle<()>,
}

/// Holds one unit of the in-flight count until dropped.
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn enter(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

// =============================================================================
// PUBLIC API
// =============================================================================

impl HostRouter {
    /// `identity` is the host's own peer identity; privileged (`self`)
    /// connections must present the same one.
    #[must_use]
    pub fn new(hub: Hub, identity: Peer, registry: HandlerRegistry, config: HostConfig) -> Self {
        let (in_flight, _) = watch::channel(0_usize);
        Self {
            inner: Arc::new(RouterInner {
                hub,
                identity,
                registry: Arc::new(registry),
                config,
                ports: Mutex::new(HashMap::new()),
                next_port: AtomicU64::new(0),
                in_flight: Arc::new(in_flight),
                rotations: AtomicU64::new(0),
            }),
        }
    }

    /// Install the accept listener and start the lifetime supervisor.
    ///
    /// The listener is live when this returns.
    #[must_use]
    pub fn open(&self) -> RouterHandle {
        let incoming = self.inner.hub.listen();
        info!(
            lifetime = ?self.inner.config.lifetime,
            handlers = self.inner.registry.len(),
            "host: listening"
        );
        let supervisor = tokio::spawn(Arc::clone(&self.inner).supervise(incoming));
        RouterHandle { router: self.clone(), supervisor }
    }

    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Ports currently tracked, in any state.
    #[must_use]
    pub fn port_count(&self) -> usize {
        self.inner.ports().len()
    }

    #[must_use]
    pub fn online_ports(&self) -> usize {
        self.inner
            .ports()
            .values()
            .filter(|port| port.state == PortState::Online)
            .count()
    }

    /// Handlers currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    /// Completed listener rotations.
    #[must_use]
    pub fn rotations(&self) -> u64 {
        self.inner.rotations.load(Ordering::Relaxed)
    }
}

impl RouterHandle {
    #[must_use]
    pub fn router(&self) -> &HostRouter {
        &self.router
    }

    /// Stop the supervisor, remove the listener and drop every open port.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.supervisor.abort();
        let inner = &self.router.inner;
        inner.hub.unlisten();
        let closed = {
            let mut ports = inner.ports();
            for port in ports.values_mut() {
                if let Some(task) = port.task.take() {
                    task.abort();
                }
            }
            let closed = ports.len();
            ports.clear();
            closed
        };
        info!(closed, "host: closed");
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

impl RouterInner {
    fn ports(&self) -> MutexGuard<'_, HashMap<u64, Port>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn supervise(self: Arc<Self>, mut incoming: mpsc::UnboundedReceiver<Transport>) {
        loop {
            let expiry = tokio::time::sleep(self.config.lifetime);
            tokio::pin!(expiry);

            loop {
                tokio::select! {
                    () = &mut expiry => break,
                    transport = incoming.recv() => {
                        let Some(transport) = transport else {
                            warn!("host: listener removed, supervisor stopping");
                            return;
                        };
                        self.accept(transport);
                    }
                }
            }

            incoming = self.rotate(incoming).await;
        }
    }

    /// Refresh clients, drain, and swap in a fresh listener.
    async fn rotate(self: &Arc<Self>, mut incoming: mpsc::UnboundedReceiver<Transport>) -> mpsc::UnboundedReceiver<Transport> {
        let refreshed = self.broadcast_refresh();
        info!(refreshed, "host: listener expired, refreshing clients");

        let mut counter = self.in_flight.subscribe();
        let drained = async move { counter.wait_for(|n| *n == 0).await.is_ok() };
        let drain = tokio::time::timeout(self.config.drain_timeout, drained);
        tokio::pin!(drain);
        loop {
            tokio::select! {
                drained = &mut drain => {
                    if drained.is_err() {
                        warn!(in_flight = *self.in_flight.borrow(), "host: drain timed out, rotating anyway");
                    }
                    break;
                }
                Some(transport) = incoming.recv() => self.accept(transport),
            }
        }

        let fresh = self.hub.listen();
        while let Some(transport) = incoming.recv().await {
            self.accept(transport);
        }

        let rotations = self.rotations.fetch_add(1, Ordering::Relaxed) + 1;
        info!(rotations, "host: listener rotated");
        fresh
    }

    fn broadcast_refresh(&self) -> usize {
        let mut ports = self.ports();
        let mut refreshed = 0;
        for port in ports.values_mut().filter(|port| port.state == PortState::Online) {
            match port.sender.post(&Frame::refresh()) {
                Ok(()) => refreshed += 1,
                Err(_) => {
                    debug!(name = %port.name, "host: port closed before refresh");
                    port.state = PortState::Disconnected;
                }
            }
        }
        refreshed
    }
}

// =============================================================================
// PORTS
// =============================================================================

impl RouterInner {
    fn accept(self: &Arc<Self>, transport: Transport) {
        let name = match ConnectionName::parse(transport.name()) {
            Ok(name) => name,
            Err(NameError::ForeignProtocol(_)) => {
                debug!(name = transport.name(), "host: ignoring foreign connection");
                return;
            }
            Err(e) => {
                warn!(error = %e, "host: rejecting connection");
                return;
            }
        };

        if name.is_privileged() && !transport.peer().matches(&self.identity) {
            warn!(name = %name, peer = ?transport.peer(), "host: privileged connection from foreign peer");
            return;
        }

        let id = self.next_port.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = transport.split();
        {
            let mut ports = self.ports();
            let mut port = Port { name: name.clone(), state: PortState::Opened, sender: sender.clone(), task: None };
            if sender.post(&Frame::handshake()).is_err() {
                debug!(name = %name, "host: client left before handshake");
                return;
            }
            port.state = PortState::Online;
            ports.insert(id, port);
        }
        info!(name = %name, port = id, "host: connection online");

        let task = tokio::spawn(Arc::clone(self).serve(id, name, sender, receiver));
        if let Some(port) = self.ports().get_mut(&id) {
            port.task = Some(task.abort_handle());
        }
    }

    async fn serve(self: Arc<Self>, id: u64, name: ConnectionName, sender: PortSender, mut receiver: PortReceiver) {
        while let Some(text) = receiver.recv().await {
            match decode_frame(&text) {
                Ok(frame) => self.dispatch(&name, &sender, frame),
                Err(e) => warn!(name = %name, error = %e, "host: invalid inbound frame"),
            }
        }
        let state = self.ports().remove(&id).map(|port| port.state);
        debug!(name = %name, port = id, ?state, "host: connection closed");
    }

    fn dispatch(&self, name: &ConnectionName, sender: &PortSender, frame: Frame) {
        let frame_type = frame.frame_type();
        let (message, wants_response) = match frame.body {
            Body::Send(message) => (message, false),
            Body::Request(message) => (message, true),
            Body::Control(control) => {
                warn!(name = %name, purpose = control.as_str(), "host: unexpected control frame");
                return;
            }
            Body::Ack | Body::Response(_) => {
                warn!(name = %name, ?frame_type, "host: unroutable frame from client");
                return;
            }
        };
        let channel_id = frame.channel_id;

        if sender.post(&Frame::ack(channel_id.clone())).is_err() {
            debug!(name = %name, channel_id = %channel_id, "host: client left before ack");
            return;
        }

        let Message { kind, value } = message;
        let Some(handler) = self.registry.get(&kind) else {
            warn!(name = %name, kind = %kind, ?frame_type, "host: no handler registered");
            if wants_response && self.config.reject_unknown_types {
                let _ = sender.post(&Frame::response(channel_id, Err(format!("unknown message type: {kind}"))));
            }
            return;
        };

        let guard = InFlight::enter(&self.in_flight);
        let ctx = HandlerContext { connection: name.clone() };
        let sender = sender.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let result = match tokio::spawn(handler(value, ctx)).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => {
                    debug!(kind = %kind, error = %e, "host: handler failed");
                    Err(e.message().to_owned())
                }
                Err(e) => {
                    error!(kind = %kind, error = %e, "host: handler panicked");
                    Err(PANIC_MESSAGE.to_owned())
                }
            };
            if wants_response && sender.post(&Frame::response(channel_id, result)).is_err() {
                debug!(kind = %kind, "host: client left before response");
            }
        });
    }
}

#[cfg(test)]
#[path = "host_test.rs"]
mod tests;
