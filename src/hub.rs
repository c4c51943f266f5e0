//! Hub — the accept-listener slot that connections are delivered through.
//!
//! The hub stands in for the runtime's "on connect" event. A host router
//! installs a listener with [`Hub::listen`], and connectors hand it the host
//! end of each new transport. Only one listener is installed at a time;
//! installing a new one retires the old receiver, which still drains whatever
//! was already delivered to it.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use frames::ConnectionName;
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{Connector, Peer, Transport, TransportError};

type Listener = mpsc::UnboundedSender<Transport>;

#[derive(Clone, Default)]
pub struct Hub {
    listener: Arc<Mutex<Option<Listener>>>,
}

impl Hub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh listener, replacing any previous one.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<Transport> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.slot() = Some(tx);
        rx
    }

    /// Remove the current listener. Later connections fail with
    /// [`TransportError::NoListener`] until the next [`Hub::listen`].
    pub fn unlisten(&self) {
        self.slot().take();
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.slot().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Hand the host end of a transport to the installed listener.
    ///
    /// # Errors
    ///
    /// [`TransportError::NoListener`] when no live listener is installed. The
    /// transport is dropped, so its other end observes a disconnect.
    pub fn deliver(&self, transport: Transport) -> Result<(), TransportError> {
        let slot = self.slot();
        let Some(listener) = slot.as_ref() else {
            debug!(name = transport.name(), "hub: no listener, dropping connection");
            return Err(TransportError::NoListener);
        };
        listener.send(transport).map_err(|_| TransportError::NoListener)
    }

    /// Connector that opens in-process transports as `peer`.
    #[must_use]
    pub fn connector(&self, peer: Peer) -> HubConnector {
        HubConnector { hub: self.clone(), peer }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Listener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process [`Connector`] bound to a [`Hub`] and a fixed peer identity.
#[derive(Clone)]
pub struct HubConnector {
    hub: Hub,
    peer: Peer,
}

#[async_trait]
impl Connector for HubConnector {
    async fn open(&self, name: &ConnectionName) -> Result<Transport, TransportError> {
        let (host_end, client_end) = Transport::pair(name.to_string(), self.peer.clone());
        self.hub.deliver(host_end)?;
        Ok(client_end)
    }
}
