//! Client channel — one context's connection to the host.
//!
//! DESIGN
//! ======
//! A `ClientChannel` multiplexes concurrent sends and requests over a single
//! transport. Each exchange gets a random channel id and a bookkeeping entry
//! holding a oneshot reply slot. SEND completes on its ACK; REQUEST ignores
//! its ACK and completes only on RESPONSE.
//!
//! All mutable state sits behind one mutex that is never held across an
//! await. Posting, routing, pausing and flushing each take the lock once,
//! which is what keeps the pause queue strictly FIFO.
//!
//! LIFECYCLE
//! =========
//! 1. `connect` opens a transport and waits for the host's `ack`.
//! 2. A receive task routes ACK/RESPONSE frames to channels by id.
//! 3. `refresh` → drop the transport, PAUSED, buffer posts, reconnect after
//!    `refresh_delay`, flush the buffer, CONNECTED.
//! 4. Unexpected disconnect → DISCONNECTED, open channels rejected.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use frames::{Body, ConnectionName, ConnectionType, Control, Frame, FrameType, Message, decode_frame, encode_frame};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::transport::{Connector, PortReceiver, PortSender};

const CHANNEL_ID_LEN: usize = 16;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The host never acknowledged the handshake, or went away during it.
    #[error("service unreachable")]
    ServiceUnreachable,
    /// The call was made before connecting or after disconnecting.
    #[error("not connected")]
    NotConnected,
    /// The host handler failed; carries the RESPONSE error string.
    #[error("host error: {0}")]
    Remote(String),
    /// The transport closed while the exchange was open.
    #[error("transport disconnected")]
    Disconnected,
    #[error("timed out waiting for response")]
    Timeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    /// Host asked for a refresh; posts are buffered until reconnected.
    Paused,
    Disconnected,
}

type Reply = oneshot::Sender<Result<Value, ClientError>>;
type ReplyRx = oneshot::Receiver<Result<Value, ClientError>>;

/// Bookkeeping for one open exchange.
struct Channel {
    frame_type: FrameType,
    acked: bool,
    /// Issue order, used to replay interrupted exchanges in sequence.
    seq: u64,
    /// Encoded frame, kept so the exchange can be replayed after a refresh.
    text: String,
    reply: Reply,
}

/// Encoded frame waiting for the transport to come back.
struct Queued {
    channel_id: String,
    text: String,
}

/// Forgets an exchange once its caller stops waiting for it, so an abandoned
/// exchange is never replayed after a refresh.
struct Pending {
    inner: Weak<Inner>,
    channel_id: String,
}

impl Drop for Pending {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.forget(&self.channel_id);
        }
    }
}

struct State {
    connection: ConnectionState,
    sender: Option<PortSender>,
    /// Bumped on every transport change so stale receive tasks stand down.
    generation: u64,
    channels: HashMap<String, Channel>,
    queue: VecDeque<Queued>,
    next_seq: u64,
}

impl State {
    fn new() -> Self {
        Self {
            connection: ConnectionState::Unconnected,
            sender: None,
            generation: 0,
            channels: HashMap::new(),
            queue: VecDeque::new(),
            next_seq: 0,
        }
    }

    fn fresh_channel_id(&self) -> String {
        loop {
            let id: String = rand::rng()
                .sample_iter(Alphanumeric)
                .take(CHANNEL_ID_LEN)
                .map(char::from)
                .collect();
            if !self.channels.contains_key(&id) {
                return id;
            }
        }
    }

    /// Reject every open exchange with `err` and drop anything queued.
    fn reject_all(&mut self, err: &ClientError) -> usize {
        let open = self.channels.len();
        for (_, channel) in self.channels.drain() {
            let _ = channel.reply.send(Err(err.clone()));
        }
        self.queue.clear();
        open
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    name: ConnectionName,
    config: ClientConfig,
    state: Mutex<State>,
}

/// Handle to one client connection. Cheap to clone; clones share the channel.
#[derive(Clone)]
pub struct ClientChannel {
    inner: Arc<Inner>,
}

// =============================================================================
// PUBLIC API
// =============================================================================

impl ClientChannel {
    /// Open a transport to the host and wait for its handshake `ack`.
    ///
    /// # Errors
    ///
    /// [`ClientError::ServiceUnreachable`] if the transport cannot be opened,
    /// closes before the `ack`, or no `ack` arrives within
    /// [`ClientConfig::connect_timeout`].
    pub async fn connect(
        connector: Arc<dyn Connector>,
        connection_type: ConnectionType,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let name = ConnectionName::new(connection_type, Uuid::new_v4().to_string());
        let inner = Arc::new(Inner { connector, name, config, state: Mutex::new(State::new()) });
        inner.lock().connection = ConnectionState::Connecting;
        Inner::establish(&inner).await?;
        Ok(Self { inner })
    }

    /// Post a SEND; resolves once the host ACKs this exchange.
    ///
    /// The frame is posted (or queued while paused) when this is called, not
    /// when the returned future is first polled. Dropping the future abandons
    /// the exchange.
    pub fn send(&self, message: Message) -> impl Future<Output = Result<(), ClientError>> + Send + 'static {
        let posted = Inner::post(&self.inner, FrameType::Send, message);
        async move {
            let (_pending, reply) = posted?;
            reply.await.map_err(|_| ClientError::Disconnected)?.map(|_| ())
        }
    }

    /// Post a REQUEST; resolves with the RESPONSE payload.
    ///
    /// An ACK for the same exchange does not complete it. Like [`Self::send`],
    /// posting happens at call time.
    pub fn request(&self, message: Message) -> impl Future<Output = Result<Value, ClientError>> + Send + 'static {
        let posted = Inner::post(&self.inner, FrameType::Request, message);
        async move {
            let (_pending, reply) = posted?;
            reply.await.map_err(|_| ClientError::Disconnected)?
        }
    }

    /// [`Self::request`] raced against `deadline`.
    ///
    /// A request that times out is forgotten: a late RESPONSE is ignored and
    /// the request is not replayed after a refresh.
    ///
    /// # Errors
    ///
    /// [`ClientError::Timeout`] when the deadline elapses first, otherwise
    /// whatever the request itself resolves to.
    pub async fn request_timeout(&self, message: Message, deadline: Duration) -> Result<Value, ClientError> {
        tokio::time::timeout(deadline, self.request(message))
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    /// Close the transport. Open exchanges fail with [`ClientError::Disconnected`]
    /// and later calls with [`ClientError::NotConnected`].
    pub fn disconnect(&self) {
        let mut state = self.inner.lock();
        if state.connection == ConnectionState::Disconnected {
            return;
        }
        state.connection = ConnectionState::Disconnected;
        state.sender = None;
        state.generation += 1;
        let open = state.reject_all(&ClientError::Disconnected);
        info!(name = %self.inner.name, open, "client: disconnected");
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().connection
    }

    #[must_use]
    pub fn connection_name(&self) -> &ConnectionName {
        &self.inner.name
    }

    /// Exchanges still waiting for their ACK or RESPONSE.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.inner.lock().channels.len()
    }

    /// Frames buffered while paused.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handshake, then go CONNECTED, flush the queue and start routing.
    async fn establish(inner: &Arc<Self>) -> Result<(), ClientError> {
        let handshake = tokio::time::timeout(inner.config.connect_timeout, inner.handshake()).await;
        let (sender, receiver) = match handshake {
            Ok(Ok(halves)) => halves,
            Ok(Err(err)) => {
                inner.fail(&err);
                return Err(err);
            }
            Err(_) => {
                warn!(name = %inner.name, "client: handshake timed out");
                inner.fail(&ClientError::ServiceUnreachable);
                return Err(ClientError::ServiceUnreachable);
            }
        };

        let (generation, flushed) = {
            let mut state = inner.lock();
            if state.connection == ConnectionState::Disconnected {
                return Err(ClientError::NotConnected);
            }
            state.generation += 1;
            state.connection = ConnectionState::Connected;
            let flushed = state.queue.len();
            while let Some(queued) = state.queue.pop_front() {
                if sender.post_text(queued.text).is_err() {
                    // The receive task sees the close and rejects the channels.
                    state.queue.clear();
                    break;
                }
            }
            state.sender = Some(sender);
            (state.generation, flushed)
        };

        info!(name = %inner.name, flushed, "client: connected");
        tokio::spawn(Self::receive_loop(Arc::downgrade(inner), receiver, generation));
        Ok(())
    }

    async fn handshake(&self) -> Result<(PortSender, PortReceiver), ClientError> {
        let transport = self.connector.open(&self.name).await.map_err(|e| {
            warn!(name = %self.name, error = %e, "client: failed to open transport");
            ClientError::ServiceUnreachable
        })?;
        let (sender, mut receiver) = transport.split();

        loop {
            let Some(text) = receiver.recv().await else {
                warn!(name = %self.name, "client: transport closed during handshake");
                return Err(ClientError::ServiceUnreachable);
            };
            match decode_frame(&text) {
                Ok(Frame { body: Body::Control(Control::Ack), .. }) => return Ok((sender, receiver)),
                Ok(frame) => {
                    warn!(channel_id = %frame.channel_id, frame_type = ?frame.frame_type(), "client: unroutable frame during handshake");
                }
                Err(e) => warn!(error = %e, "client: invalid frame during handshake"),
            }
        }
    }

    fn fail(&self, err: &ClientError) {
        let mut state = self.lock();
        state.connection = ConnectionState::Disconnected;
        state.sender = None;
        state.generation += 1;
        let open = state.reject_all(err);
        if open > 0 {
            warn!(name = %self.name, open, error = %err, "client: rejected open channels");
        }
    }

    async fn receive_loop(inner: Weak<Self>, mut receiver: PortReceiver, generation: u64) {
        while let Some(text) = receiver.recv().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let frame = match decode_frame(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(name = %inner.name, error = %e, "client: invalid inbound frame");
                    continue;
                }
            };

            if frame.body == Body::Control(Control::Refresh) {
                if inner.pause(generation) {
                    Self::schedule_reconnect(inner);
                }
                return;
            }
            inner.route(frame);
        }

        if let Some(inner) = inner.upgrade() {
            inner.closed(generation);
        }
    }

    /// Drop the transport for a host refresh. Returns false if `generation`
    /// is no longer the live transport.
    fn pause(&self, generation: u64) -> bool {
        let mut state = self.lock();
        if state.generation != generation || state.connection != ConnectionState::Connected {
            return false;
        }

        let tracked = state.channels.len();
        state.channels.retain(|_, channel| !channel.reply.is_closed());
        let abandoned = tracked - state.channels.len();
        if abandoned > 0 {
            debug!(name = %self.name, abandoned, "client: dropped abandoned channels");
        }

        if !state.channels.is_empty() {
            error!(name = %self.name, open = state.channels.len(), "client: refresh received with open channels");
            let mut open: Vec<(u64, Queued)> = state
                .channels
                .iter()
                .map(|(channel_id, channel)| {
                    (channel.seq, Queued { channel_id: channel_id.clone(), text: channel.text.clone() })
                })
                .collect();
            open.sort_unstable_by_key(|(seq, _)| *seq);
            for (_, queued) in open.into_iter().rev() {
                state.queue.push_front(queued);
            }
        }

        state.sender = None;
        state.connection = ConnectionState::Paused;
        info!(name = %self.name, "client: paused for host refresh");
        true
    }

    fn schedule_reconnect(inner: Arc<Self>) {
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.refresh_delay).await;
            if inner.lock().connection != ConnectionState::Paused {
                return;
            }
            if let Err(e) = Self::establish(&inner).await {
                warn!(name = %inner.name, error = %e, "client: reconnect failed");
            }
        });
    }

    fn closed(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation || state.connection != ConnectionState::Connected {
            return;
        }
        state.connection = ConnectionState::Disconnected;
        state.sender = None;
        let open = state.reject_all(&ClientError::Disconnected);
        warn!(name = %self.name, open, "client: host disconnected");
    }
}

// =============================================================================
// EXCHANGES
// =============================================================================

impl Inner {
    fn post(inner: &Arc<Self>, frame_type: FrameType, message: Message) -> Result<(Pending, ReplyRx), ClientError> {
        let mut state = inner.lock();
        if !matches!(state.connection, ConnectionState::Connected | ConnectionState::Paused) {
            return Err(ClientError::NotConnected);
        }

        let channel_id = state.fresh_channel_id();
        let frame = if frame_type == FrameType::Request {
            Frame::request(channel_id.clone(), message)
        } else {
            Frame::send(channel_id.clone(), message)
        };
        let text = encode_frame(&frame);

        if state.connection == ConnectionState::Paused {
            state.queue.push_back(Queued { channel_id: channel_id.clone(), text: text.clone() });
        } else {
            let Some(sender) = state.sender.as_ref() else {
                return Err(ClientError::NotConnected);
            };
            sender.post_text(text.clone()).map_err(|_| ClientError::Disconnected)?;
        }

        let (reply, rx) = oneshot::channel();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.channels.insert(channel_id.clone(), Channel { frame_type, acked: false, seq, text, reply });
        Ok((Pending { inner: Arc::downgrade(inner), channel_id }, rx))
    }

    fn forget(&self, channel_id: &str) {
        let mut state = self.lock();
        if state.channels.remove(channel_id).is_some() {
            state.queue.retain(|queued| queued.channel_id != channel_id);
            debug!(name = %self.name, channel_id, "client: caller abandoned channel");
        }
    }

    fn route(&self, frame: Frame) {
        let frame_type = frame.frame_type();
        match frame.body {
            Body::Ack => self.on_ack(&frame.channel_id),
            Body::Response(result) => self.on_response(&frame.channel_id, result),
            Body::Control(control) => {
                warn!(name = %self.name, purpose = control.as_str(), "client: unroutable control frame");
            }
            Body::Send(_) | Body::Request(_) => {
                warn!(name = %self.name, channel_id = %frame.channel_id, ?frame_type, "client: unroutable frame from host");
            }
        }
    }

    fn on_ack(&self, channel_id: &str) {
        let mut state = self.lock();
        match state.channels.get(channel_id).map(|channel| channel.frame_type) {
            None => warn!(name = %self.name, channel_id, "client: ack for unknown channel"),
            Some(FrameType::Request) => {
                if let Some(channel) = state.channels.get_mut(channel_id) {
                    channel.acked = true;
                }
            }
            Some(_) => {
                if let Some(channel) = state.channels.remove(channel_id) {
                    let _ = channel.reply.send(Ok(Value::Null));
                }
            }
        }
    }

    fn on_response(&self, channel_id: &str, result: Result<Value, String>) {
        let mut state = self.lock();
        match state.channels.get(channel_id).map(|channel| (channel.frame_type, channel.acked)) {
            None => warn!(name = %self.name, channel_id, "client: response for unknown channel"),
            Some((FrameType::Request, acked)) => {
                if !acked {
                    warn!(name = %self.name, channel_id, "client: response arrived before ack");
                }
                if let Some(channel) = state.channels.remove(channel_id) {
                    let _ = channel.reply.send(result.map_err(ClientError::Remote));
                }
            }
            Some(_) => warn!(name = %self.name, channel_id, "client: response for a send channel"),
        }
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
