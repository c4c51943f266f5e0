use std::io::Write;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use super::*;
use crate::client::{ClientChannel, ClientError, ConnectionState};
use crate::config::ClientConfig;
use crate::registry::{HandlerError, HandlerResult};
use frames::{ConnectionType, FrameType};
use serde_json::{Value, json};
use tokio::time::{sleep, timeout};

const HOST_ID: &str = "host-ext";

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

async fn explode(_value: Value, _ctx: HandlerContext) -> HandlerResult {
    panic!("handler blew up")
}

fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register("echo", |value, _ctx| async move { Ok(value) })
        .register("fail", |_value, _ctx| async { Err(HandlerError::new("boom")) })
        .register("slow", |value: Value, _ctx| async move {
            let wait = value.as_u64().unwrap_or(200);
            sleep(ms(wait)).await;
            Ok(json!(wait))
        })
        .register("panic", explode);
    registry
}

fn start(registry: HandlerRegistry, config: HostConfig) -> (Hub, RouterHandle) {
    let hub = Hub::new();
    let router = HostRouter::new(hub.clone(), Peer::new(HOST_ID), registry, config);
    let handle = router.open();
    (hub, handle)
}

fn client_config() -> ClientConfig {
    ClientConfig::default().with_connect_timeout(ms(500)).with_refresh_delay(ms(20))
}

async fn client(hub: &Hub, peer: Peer, connection_type: ConnectionType) -> Result<ClientChannel, ClientError> {
    ClientChannel::connect(Arc::new(hub.connector(peer)), connection_type, client_config()).await
}

fn open_raw(hub: &Hub, peer: Peer, name: &str) -> Transport {
    let (host_end, client_end) = Transport::pair(name, peer);
    hub.deliver(host_end).expect("deliver");
    client_end
}

async fn next_frame(transport: &mut Transport) -> Option<Frame> {
    timeout(ms(1000), transport.recv())
        .await
        .expect("timed out waiting for frame")
        .map(|text| decode_frame(&text).expect("decode"))
}

async fn is_quiet(transport: &mut Transport, window: Duration) -> bool {
    timeout(window, transport.recv()).await.is_err()
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    timeout(ms(2000), async {
        while !check() {
            sleep(ms(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Captures formatted log output for the current thread's subscriber.
#[derive(Clone, Default)]
struct SharedLogBuffer {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl SharedLogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }
}

struct SharedLogWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedLogBuffer {
    type Writer = SharedLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SharedLogWriter { buffer: Arc::clone(&self.buffer) }
    }
}

impl Write for SharedLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// ACCEPT
// =============================================================================

#[tokio::test]
async fn each_connection_gets_its_own_handshake() {
    let (hub, handle) = start(registry(), HostConfig::default());
    let mut a = open_raw(&hub, Peer::default(), "comms:app:a");
    let mut b = open_raw(&hub, Peer::default(), "comms:app:b");

    assert_eq!(next_frame(&mut a).await, Some(Frame::handshake()));
    assert_eq!(next_frame(&mut b).await, Some(Frame::handshake()));
    assert!(is_quiet(&mut a, ms(50)).await);
    assert!(is_quiet(&mut b, ms(50)).await);

    assert_eq!(handle.router().port_count(), 2);
    assert_eq!(handle.router().online_ports(), 2);
}

#[tokio::test]
async fn closed_connection_is_forgotten() {
    let (hub, handle) = start(registry(), HostConfig::default());
    let mut raw = open_raw(&hub, Peer::default(), "comms:app:gone");
    assert_eq!(next_frame(&mut raw).await, Some(Frame::handshake()));
    assert_eq!(handle.router().port_count(), 1);

    drop(raw);
    wait_until("port removal", || handle.router().port_count() == 0).await;
    assert_eq!(handle.router().online_ports(), 0);
}

#[tokio::test]
async fn privileged_connection_from_foreign_peer_processes_nothing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = registry();
    let counted = Arc::clone(&calls);
    registry.register("count", move |_value, _ctx| {
        let counted = Arc::clone(&counted);
        async move {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    });
    let (hub, handle) = start(registry, HostConfig::default());

    let mut raw = open_raw(&hub, Peer::new("intruder"), "comms:self:x");
    let _ = raw.post(&Frame::send("c1", Message::new("count", Value::Null)));
    assert_eq!(next_frame(&mut raw).await, None, "closed without handshake or ack");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(handle.router().port_count(), 0);

    let err = client(&hub, Peer::new("intruder"), ConnectionType::Privileged).await.err();
    assert_eq!(err, Some(ClientError::ServiceUnreachable));
}

#[tokio::test]
async fn privileged_connection_from_own_peer_is_served() {
    let (hub, _handle) = start(registry(), HostConfig::default());
    let own = client(&hub, Peer::new(HOST_ID), ConnectionType::Privileged).await.ok().expect("own peer connects");
    let value = own.request(Message::new("echo", json!("hi"))).await.expect("echo");
    assert_eq!(value, json!("hi"));
}

#[tokio::test]
async fn foreign_protocol_and_malformed_names_are_dropped() {
    let (hub, handle) = start(registry(), HostConfig::default());

    let mut foreign = open_raw(&hub, Peer::default(), "devtools:page:1");
    assert_eq!(next_frame(&mut foreign).await, None);

    let mut malformed = open_raw(&hub, Peer::default(), "comms:root:1");
    assert_eq!(next_frame(&mut malformed).await, None);

    assert_eq!(handle.router().port_count(), 0);
}

// =============================================================================
// DISPATCH
// =============================================================================

#[tokio::test]
async fn echo_round_trip() {
    let (hub, _handle) = start(registry(), HostConfig::default());
    let app = client(&hub, Peer::default(), ConnectionType::App).await.ok().expect("connect");

    let value = app.request(Message::new("echo", json!({"a": 1}))).await.expect("request");
    assert_eq!(value, json!({"a": 1}));
    app.send(Message::new("echo", json!("fire"))).await.expect("send acked");
}

#[tokio::test]
async fn send_is_acked_before_handler_completes() {
    let (hub, handle) = start(registry(), HostConfig::default());
    let mut raw = open_raw(&hub, Peer::default(), "comms:app:s");
    assert_eq!(next_frame(&mut raw).await, Some(Frame::handshake()));

    raw.post(&Frame::send("c1", Message::new("slow", json!(300)))).expect("post");
    let ack = timeout(ms(100), raw.recv()).await.expect("ack is immediate").expect("open");
    assert_eq!(decode_frame(&ack).expect("decode"), Frame::ack("c1"));
    assert_eq!(handle.router().in_flight(), 1);

    wait_until("handler completion", || handle.router().in_flight() == 0).await;
    assert!(is_quiet(&mut raw, ms(50)).await, "SEND never gets a RESPONSE");
}

#[tokio::test]
async fn request_gets_ack_then_response() {
    let (hub, _handle) = start(registry(), HostConfig::default());
    let mut raw = open_raw(&hub, Peer::default(), "comms:app:r");
    assert_eq!(next_frame(&mut raw).await, Some(Frame::handshake()));

    raw.post(&Frame::request("c9", Message::new("echo", json!([1, 2])))).expect("post");
    assert_eq!(next_frame(&mut raw).await, Some(Frame::ack("c9")));
    assert_eq!(next_frame(&mut raw).await, Some(Frame::response("c9", Ok(json!([1, 2])))));
}

#[tokio::test]
async fn missing_handler_acks_and_drops_by_default() {
    let (hub, _handle) = start(registry(), HostConfig::default());
    let mut raw = open_raw(&hub, Peer::default(), "comms:app:m");
    assert_eq!(next_frame(&mut raw).await, Some(Frame::handshake()));

    raw.post(&Frame::request("c1", Message::new("nope", Value::Null))).expect("post");
    assert_eq!(next_frame(&mut raw).await, Some(Frame::ack("c1")));
    assert!(is_quiet(&mut raw, ms(100)).await, "no response for unknown type");
}

#[tokio::test]
async fn missing_handler_rejected_when_configured() {
    let (hub, _handle) = start(registry(), HostConfig::default().with_reject_unknown_types(true));
    let app = client(&hub, Peer::default(), ConnectionType::App).await.ok().expect("connect");

    let err = app.request(Message::new("nope", Value::Null)).await.expect_err("unknown");
    assert_eq!(err, ClientError::Remote("unknown message type: nope".into()));
    app.send(Message::new("nope", Value::Null)).await.expect("send still acked");
}

#[tokio::test]
async fn handler_error_becomes_response_error() {
    let (hub, _handle) = start(registry(), HostConfig::default());
    let app = client(&hub, Peer::default(), ConnectionType::App).await.ok().expect("connect");

    let err = app.request(Message::new("fail", Value::Null)).await.expect_err("handler failed");
    assert_eq!(err, ClientError::Remote("boom".into()));
}

#[tokio::test]
async fn panicking_handler_does_not_take_down_the_router() {
    let (hub, handle) = start(registry(), HostConfig::default());
    let app = client(&hub, Peer::default(), ConnectionType::App).await.ok().expect("connect");

    let err = app.request(Message::new("panic", Value::Null)).await.expect_err("panicked");
    assert_eq!(err, ClientError::Remote(PANIC_MESSAGE.into()));
    assert_eq!(handle.router().in_flight(), 0);

    let value = app.request(Message::new("echo", json!(7))).await.expect("still serving");
    assert_eq!(value, json!(7));
}

#[tokio::test]
async fn unroutable_client_frames_are_ignored() {
    let (hub, _handle) = start(registry(), HostConfig::default());
    let mut raw = open_raw(&hub, Peer::default(), "comms:app:u");
    assert_eq!(next_frame(&mut raw).await, Some(Frame::handshake()));

    raw.post(&Frame::ack("c1")).expect("post");
    raw.post(&Frame::response("c2", Ok(Value::Null))).expect("post");
    raw.post(&Frame::refresh()).expect("post");
    raw.post(&Frame::request("c3", Message::new("echo", json!(3)))).expect("post");

    let ack = next_frame(&mut raw).await.expect("ack");
    assert_eq!(ack.frame_type(), FrameType::Ack);
    assert_eq!(ack.channel_id, "c3");
}

// =============================================================================
// ROTATION
// =============================================================================

#[tokio::test(start_paused = true)]
async fn expiry_refreshes_each_online_port_once() {
    let config = HostConfig::default().with_lifetime(ms(150)).with_drain_timeout(ms(100));
    let (hub, handle) = start(registry(), config);
    let mut a = open_raw(&hub, Peer::default(), "comms:app:a");
    let mut b = open_raw(&hub, Peer::default(), "comms:app:b");
    assert_eq!(next_frame(&mut a).await, Some(Frame::handshake()));
    assert_eq!(next_frame(&mut b).await, Some(Frame::handshake()));

    assert_eq!(next_frame(&mut a).await, Some(Frame::refresh()));
    assert_eq!(next_frame(&mut b).await, Some(Frame::refresh()));
    assert!(is_quiet(&mut a, ms(50)).await, "exactly one refresh per expiry");

    drop(a);
    drop(b);
    wait_until("first rotation", || handle.router().rotations() >= 1).await;

    let mut c = open_raw(&hub, Peer::default(), "comms:app:c");
    assert_eq!(next_frame(&mut c).await, Some(Frame::handshake()), "fresh listener accepts");
}

#[tokio::test(start_paused = true)]
async fn clients_survive_rotation_with_handlers_intact() {
    let config = HostConfig::default().with_lifetime(ms(100)).with_drain_timeout(ms(50));
    let (hub, handle) = start(registry(), config);
    let app = client(&hub, Peer::default(), ConnectionType::App).await.ok().expect("connect");

    wait_until("two rotations", || handle.router().rotations() >= 2).await;
    wait_until("client reconnect", || app.state() == ConnectionState::Connected).await;

    let value = app.request(Message::new("echo", json!("after"))).await.expect("echo");
    assert_eq!(value, json!("after"));
    assert_eq!(handle.router().registry().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn drain_waits_for_in_flight_handlers() {
    let config = HostConfig::default().with_lifetime(ms(100)).with_drain_timeout(ms(1000));
    let (hub, handle) = start(registry(), config);
    let mut raw = open_raw(&hub, Peer::default(), "comms:app:d");
    assert_eq!(next_frame(&mut raw).await, Some(Frame::handshake()));

    raw.post(&Frame::request("c1", Message::new("slow", json!(250)))).expect("post");
    assert_eq!(next_frame(&mut raw).await, Some(Frame::ack("c1")));
    assert_eq!(next_frame(&mut raw).await, Some(Frame::refresh()));
    assert_eq!(handle.router().rotations(), 0, "rotation waits for the handler");

    assert_eq!(next_frame(&mut raw).await, Some(Frame::response("c1", Ok(json!(250)))));
    wait_until("rotation", || handle.router().rotations() >= 1).await;
}

#[tokio::test(start_paused = true)]
async fn drain_bound_is_honoured() {
    let config = HostConfig::default().with_lifetime(ms(100)).with_drain_timeout(ms(100));
    let (hub, handle) = start(registry(), config);
    let mut raw = open_raw(&hub, Peer::default(), "comms:app:d");
    assert_eq!(next_frame(&mut raw).await, Some(Frame::handshake()));

    raw.post(&Frame::request("c1", Message::new("slow", json!(800)))).expect("post");
    assert_eq!(next_frame(&mut raw).await, Some(Frame::ack("c1")));
    assert_eq!(next_frame(&mut raw).await, Some(Frame::refresh()));

    wait_until("rotation", || handle.router().rotations() >= 1).await;
    assert_eq!(handle.router().in_flight(), 1, "rotated while the handler still ran");

    let response = timeout(ms(2000), async {
        loop {
            match next_frame(&mut raw).await {
                Some(frame) if frame.frame_type() == FrameType::Response => return frame,
                Some(_) => {}
                None => panic!("port closed before response"),
            }
        }
    })
    .await
    .expect("late response");
    assert_eq!(response, Frame::response("c1", Ok(json!(800))));
}

#[tokio::test(start_paused = true)]
async fn drain_timeout_is_logged() {
    let logs = SharedLogBuffer::default();
    let subscriber = tracing_subscriber::fmt().with_ansi(false).with_writer(logs.clone()).finish();
    let _default = tracing::subscriber::set_default(subscriber);

    let config = HostConfig::default().with_lifetime(ms(100)).with_drain_timeout(ms(100));
    let (hub, handle) = start(registry(), config);
    let mut raw = open_raw(&hub, Peer::default(), "comms:app:d");
    assert_eq!(next_frame(&mut raw).await, Some(Frame::handshake()));

    raw.post(&Frame::request("c1", Message::new("slow", json!(800)))).expect("post");
    assert_eq!(next_frame(&mut raw).await, Some(Frame::ack("c1")));
    wait_until("rotation", || handle.router().rotations() >= 1).await;

    let output = logs.contents();
    assert!(output.contains("drain timed out, rotating anyway"), "missing warning in:\n{output}");
    assert!(output.contains("in_flight=1"), "missing in-flight count in:\n{output}");
}

#[tokio::test(start_paused = true)]
async fn drain_within_bound_logs_no_warning() {
    let logs = SharedLogBuffer::default();
    let subscriber = tracing_subscriber::fmt().with_ansi(false).with_writer(logs.clone()).finish();
    let _default = tracing::subscriber::set_default(subscriber);

    let config = HostConfig::default().with_lifetime(ms(100)).with_drain_timeout(ms(1000));
    let (hub, handle) = start(registry(), config);
    let mut raw = open_raw(&hub, Peer::default(), "comms:app:d");
    assert_eq!(next_frame(&mut raw).await, Some(Frame::handshake()));

    raw.post(&Frame::request("c1", Message::new("slow", json!(250)))).expect("post");
    wait_until("rotation", || handle.router().rotations() >= 1).await;

    let output = logs.contents();
    assert!(output.contains("host: listener rotated"), "rotation not logged in:\n{output}");
    assert!(!output.contains("drain timed out"), "unexpected warning in:\n{output}");
}

#[tokio::test(start_paused = true)]
async fn port_that_cannot_take_a_refresh_is_marked_disconnected() {
    let config = HostConfig::default().with_lifetime(ms(100)).with_drain_timeout(ms(50));
    let (hub, handle) = start(registry(), config);
    let (tx, mut rx) = open_raw(&hub, Peer::default(), "comms:app:deaf").split();
    let handshake = rx.recv().await.map(|text| decode_frame(&text).expect("decode"));
    assert_eq!(handshake, Some(Frame::handshake()));
    assert_eq!(handle.router().online_ports(), 1);
    drop(rx);

    wait_until("rotation", || handle.router().rotations() >= 1).await;
    assert_eq!(handle.router().port_count(), 1, "receive side is still open");
    assert_eq!(handle.router().online_ports(), 0);

    drop(tx);
    wait_until("port removal", || handle.router().port_count() == 0).await;
}

#[tokio::test]
async fn close_removes_listener_and_ports() {
    let (hub, handle) = start(registry(), HostConfig::default());
    let mut raw = open_raw(&hub, Peer::default(), "comms:app:z");
    assert_eq!(next_frame(&mut raw).await, Some(Frame::handshake()));

    let router = handle.router().clone();
    handle.close();

    assert!(!hub.is_listening());
    assert_eq!(router.port_count(), 0);
    assert_eq!(next_frame(&mut raw).await, None);
    let err = client(&hub, Peer::default(), ConnectionType::App).await.err();
    assert_eq!(err, Some(ClientError::ServiceUnreachable));
}
