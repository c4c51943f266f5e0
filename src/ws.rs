//! WebSocket transport — carries frames between processes.
//!
//! DESIGN
//! ======
//! Both sides bridge a socket onto an in-process [`Transport`] pair, so the
//! router and the client channel never know a network is involved. Each text
//! message carries exactly one encoded frame.
//!
//! Host side: `GET /comms?name=<connection name>` upgrades and delivers the
//! host end to the [`Hub`]. The peer identity is the `Origin` header plus the
//! optional `x-comms-sender` header.
//!
//! Client side: [`WsConnector`] dials the same endpoint and presents its
//! [`Peer`] through those headers.
//!
//! TRUST MODEL
//! ===========
//! Both headers are chosen by whoever opens the socket, so nothing here
//! authenticates a peer. A `self` connection is admitted only when
//! `x-comms-sender` equals the host's `COMMS_HOST_ID`, which makes that id a
//! shared secret: keep it out of logs and URLs. The host binary listens on
//! loopback unless `COMMS_BIND` says otherwise; widening the bind exposes the
//! endpoint to anyone who can reach the port.

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use frames::ConnectionName;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::hub::Hub;
use crate::transport::{Connector, Peer, Transport, TransportError};

/// Header carrying the connecting context's sender id.
pub const SENDER_HEADER: &str = "x-comms-sender";

// =============================================================================
// HOST SIDE
// =============================================================================

/// Router exposing the `/comms` upgrade endpoint for `hub`.
pub fn app(hub: Hub) -> Router {
    Router::new()
        .route("/comms", get(handle_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub name: Option<String>,
}

pub async fn handle_ws(
    State(hub): State<Hub>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(name) = params.name else {
        return (StatusCode::BAD_REQUEST, "name required").into_response();
    };
    if !hub.is_listening() {
        return (StatusCode::SERVICE_UNAVAILABLE, "host not listening").into_response();
    }

    let peer = peer_from_headers(&headers);
    ws.on_upgrade(move |socket| bridge_socket(socket, hub, name, peer))
}

fn peer_from_headers(headers: &HeaderMap) -> Peer {
    let text = |value: Option<&HeaderValue>| value.and_then(|v| v.to_str().ok()).map(str::to_owned);
    Peer {
        id: text(headers.get(SENDER_HEADER)),
        origin: text(headers.get(header::ORIGIN)),
    }
}

async fn bridge_socket(mut socket: WebSocket, hub: Hub, name: String, peer: Peer) {
    let (host_end, local) = Transport::pair(name.clone(), peer);
    if let Err(e) = hub.deliver(host_end) {
        warn!(name = %name, error = %e, "ws: host refused connection");
        return;
    }
    let (sender, mut receiver) = local.split();
    info!(name = %name, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        if sender.post_text(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            outbound = receiver.recv() => {
                let Some(text) = outbound else { break };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    info!(name = %name, "ws: client disconnected");
}

// =============================================================================
// CLIENT SIDE
// =============================================================================

/// [`Connector`] that dials a host's `/comms` endpoint.
#[derive(Clone, Debug)]
pub struct WsConnector {
    url: String,
    peer: Peer,
}

impl WsConnector {
    /// `url` is the endpoint without query, e.g. `ws://127.0.0.1:3000/comms`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), peer: Peer::default() }
    }

    #[must_use]
    pub fn with_peer(mut self, peer: Peer) -> Self {
        self.peer = peer;
        self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, name: &ConnectionName) -> Result<Transport, TransportError> {
        let url = format!("{}?name={name}", self.url);
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::WebSocket(Box::new(e)))?;

        let headers = request.headers_mut();
        if let Some(origin) = &self.peer.origin {
            headers.insert(header::ORIGIN, header_value(origin)?);
        }
        if let Some(id) = &self.peer.id {
            headers.insert(SENDER_HEADER, header_value(id)?);
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| TransportError::WebSocket(Box::new(e)))?;
        debug!(%name, status = %response.status(), "ws: dialed host");

        let (client_end, local) = Transport::pair(name.to_string(), self.peer.clone());
        tokio::spawn(pump(stream, local, name.to_string()));
        Ok(client_end)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value).map_err(|e| TransportError::InvalidRequest(e.to_string()))
}

async fn pump(stream: WebSocketStream<MaybeTlsStream<TcpStream>>, local: Transport, name: String) {
    let (mut sink, mut source) = stream.split();
    let (sender, mut receiver) = local.split();

    loop {
        tokio::select! {
            inbound = source.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    if sender.post_text(text.as_str().to_owned()).is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            outbound = receiver.recv() => {
                let Some(text) = outbound else { break };
                if sink.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    debug!(name = %name, "ws: socket closed");
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
