use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use comms::{ClientChannel, ClientConfig, ClientError, Peer, WsConnector};
use frames::{ConnectionType, Message};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("channel failed: {0}")]
    Channel(#[from] ClientError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "comms-cli", about = "Send messages to a comms host over websocket")]
struct Cli {
    #[arg(long, env = "COMMS_URL", default_value = "ws://127.0.0.1:3000/comms")]
    url: String,

    /// `Origin` header to present to the host.
    #[arg(long, env = "COMMS_ORIGIN")]
    origin: Option<String>,

    /// Sender id to present to the host.
    #[arg(long, env = "COMMS_SENDER_ID")]
    sender_id: Option<String>,

    /// Connect as a privileged (`self`) context.
    #[arg(long)]
    privileged: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fire a SEND and wait for its ACK.
    Send(MessageArgs),
    /// Issue a REQUEST and print the RESPONSE.
    Request {
        #[command(flatten)]
        message: MessageArgs,
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
}

#[derive(Args, Debug)]
struct MessageArgs {
    /// Message type the host dispatches on.
    kind: String,

    /// JSON value carried with the message.
    #[arg(long)]
    value: Option<String>,
}

impl MessageArgs {
    fn into_message(self) -> Result<Message, CliError> {
        let value = match self.value {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Value::Null,
        };
        Ok(Message::new(self.kind, value))
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();

    let peer = Peer { id: cli.sender_id, origin: cli.origin };
    let connector = Arc::new(WsConnector::new(cli.url).with_peer(peer));
    let connection_type = if cli.privileged { ConnectionType::Privileged } else { ConnectionType::App };
    let channel = ClientChannel::connect(connector, connection_type, ClientConfig::from_env()).await?;
    eprintln!("connected as {}", channel.connection_name());

    let result = match cli.command {
        Command::Send(args) => run_send(&channel, args).await,
        Command::Request { message, timeout_ms } => run_request(&channel, message, timeout_ms).await,
    };
    channel.disconnect();
    result
}

async fn run_send(channel: &ClientChannel, args: MessageArgs) -> Result<(), CliError> {
    channel.send(args.into_message()?).await?;
    println!("ok");
    Ok(())
}

async fn run_request(channel: &ClientChannel, args: MessageArgs, timeout_ms: u64) -> Result<(), CliError> {
    let value = channel
        .request_timeout(args.into_message()?, Duration::from_millis(timeout_ms))
        .await?;
    print_json(&value)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
