//! Transport — the ordered, reliable pipe between one client and the host.
//!
//! DESIGN
//! ======
//! A transport is a pair of unbounded mpsc queues carrying encoded frames.
//! Each end owns a cloneable `PortSender` and a single `PortReceiver`.
//! Dropping every sender of one end closes the other end's receiver; that is
//! the only disconnect signal either party ever observes. The WebSocket
//! adapter in `ws.rs` bridges sockets onto this same shape.

use async_trait::async_trait;
use frames::{ConnectionName, Frame, encode_frame};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;

/// Failure opening or writing a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Nothing is accepting connections right now.
    #[error("no listener installed")]
    NoListener,
    /// The other end is gone.
    #[error("transport closed")]
    Closed,
    #[error("websocket failed: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("invalid websocket request: {0}")]
    InvalidRequest(String),
}

/// Identity the runtime attaches to the connecting side of a transport.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Peer {
    pub id: Option<String>,
    pub origin: Option<String>,
}

impl Peer {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: Some(id.into()), origin: None }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Whether this peer carries the same identity as `host`.
    ///
    /// The id must be present on both sides and equal; it acts as a shared
    /// secret, so the comparison runs in constant time. The origin is compared
    /// only when the host declares one.
    #[must_use]
    pub fn matches(&self, host: &Peer) -> bool {
        let (Some(id), Some(expected)) = (&self.id, &host.id) else {
            return false;
        };
        if !bool::from(id.as_bytes().ct_eq(expected.as_bytes())) {
            return false;
        }
        host.origin.is_none() || self.origin == host.origin
    }
}

/// Writing half of a transport end.
#[derive(Clone, Debug)]
pub struct PortSender {
    tx: mpsc::UnboundedSender<String>,
}

impl PortSender {
    /// Encode and post one frame.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the other end has gone away.
    pub fn post(&self, frame: &Frame) -> Result<(), TransportError> {
        self.post_text(encode_frame(frame))
    }

    /// Post already-encoded frame text.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the other end has gone away.
    pub fn post_text(&self, text: String) -> Result<(), TransportError> {
        self.tx.send(text).map_err(|_| TransportError::Closed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Reading half of a transport end.
#[derive(Debug)]
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<String>,
}

impl PortReceiver {
    /// Next encoded frame, or `None` once the other end disconnected.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// One end of a named, bidirectional transport.
#[derive(Debug)]
pub struct Transport {
    name: String,
    peer: Peer,
    sender: PortSender,
    receiver: PortReceiver,
}

impl Transport {
    /// Create both ends of a transport.
    ///
    /// `peer` is the identity of the connecting side; both ends carry it so
    /// the host can authenticate what it accepts.
    pub fn pair(name: impl Into<String>, peer: Peer) -> (Self, Self) {
        let name = name.into();
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();

        let a = Self {
            name: name.clone(),
            peer: peer.clone(),
            sender: PortSender { tx: a_tx },
            receiver: PortReceiver { rx: a_rx },
        };
        let b = Self {
            name,
            peer,
            sender: PortSender { tx: b_tx },
            receiver: PortReceiver { rx: b_rx },
        };
        (a, b)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Post one frame to the other end.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the other end has gone away.
    pub fn post(&self, frame: &Frame) -> Result<(), TransportError> {
        self.sender.post(frame)
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    #[must_use]
    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}

/// Opens client-side transports to a host.
///
/// Implemented by the in-process [`crate::hub::HubConnector`] and the
/// WebSocket [`crate::ws::WsConnector`].
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport under `name`.
    ///
    /// # Errors
    ///
    /// Any [`TransportError`]; the client channel reports all of them as the
    /// service being unreachable.
    async fn open(&self, name: &ConnectionName) -> Result<Transport, TransportError>;
}
