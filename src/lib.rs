//! Resilient host–client message channel.
//!
//! SYSTEM CONTEXT
//! ==============
//! A long-lived host serves many short-lived client contexts over named,
//! ordered transports. Clients multiplex SEND and REQUEST exchanges over one
//! transport; the host ACKs every exchange, dispatches it to a registered
//! handler, and answers REQUESTs with a RESPONSE.
//!
//! The host may be recycled at any time. Before its listener expires it asks
//! every client to `refresh`; clients pause, buffer new work, and reconnect to
//! the fresh listener without losing anything they queued.
//!
//! Wire framing and connection names live in the `frames` crate.

pub mod client;
pub mod config;
pub mod host;
pub mod hub;
pub mod registry;
pub mod transport;
pub mod ws;

pub use client::{ClientChannel, ClientError, ConnectionState};
pub use config::{ClientConfig, HostConfig};
pub use host::{HostRouter, PortState, RouterHandle};
pub use hub::{Hub, HubConnector};
pub use registry::{Handler, HandlerContext, HandlerError, HandlerRegistry, HandlerResult};
pub use transport::{Connector, Peer, PortReceiver, PortSender, Transport, TransportError};
pub use ws::WsConnector;
