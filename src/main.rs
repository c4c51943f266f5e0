use comms::{HandlerContext, HandlerRegistry, HandlerResult, Hub, HostConfig, HostRouter, Peer, ws};
use serde_json::{Value, json};

async fn echo(value: Value, _ctx: HandlerContext) -> HandlerResult {
    Ok(value)
}

/// Listen address for the websocket endpoint. `COMMS_BIND` widens it; the
/// default stays on loopback because peer headers are self-asserted.
fn bind_addr(host: Option<String>, port: u16) -> String {
    let host = host.unwrap_or_else(|| "127.0.0.1".into());
    format!("{host}:{port}")
}

async fn ping(_value: Value, ctx: HandlerContext) -> HandlerResult {
    Ok(json!({ "pong": ctx.connection.to_string() }))
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");

    let identity = Peer {
        id: std::env::var("COMMS_HOST_ID").ok(),
        origin: std::env::var("COMMS_HOST_ORIGIN").ok(),
    };
    if identity.id.is_none() {
        tracing::warn!("COMMS_HOST_ID not set, privileged connections will be refused");
    }

    let mut registry = HandlerRegistry::new();
    registry.register("echo", echo).register("ping", ping);

    let hub = Hub::new();
    let router = HostRouter::new(hub.clone(), identity, registry, HostConfig::from_env());
    let _handle = router.open();

    let addr = bind_addr(std::env::var("COMMS_BIND").ok(), port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind");

    tracing::info!(%addr, "comms host listening");
    axum::serve(listener, ws::app(hub)).await.expect("server failed");
}
