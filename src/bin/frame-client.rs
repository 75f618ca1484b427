//! frame-client: send requests to a frame-mux server and print the replies.
//!
//! With `--pipeline`, every message is written before the first response is
//! read; otherwise each request waits for its response.

use clap::Parser;
use frame_mux::client::{Client, ClientError};
use frame_mux::runtime::{ByteOrder, FrameCodec};
use std::time::Duration;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "frame-client")]
#[command(version)]
#[command(about = "Send length-prefixed requests to a frame-mux server", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:1234")]
    server: String,

    /// Byte order of the frame length header
    #[arg(long, value_enum, default_value_t = ByteOrder::Little)]
    byte_order: ByteOrder,

    /// Send all messages before reading any response
    #[arg(long)]
    pipeline: bool,

    /// Give up on a response after this many seconds
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Messages to send
    #[arg(default_values = ["hello1", "hello2", "hello3"])]
    messages: Vec<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut client = Client::connect(&args.server, FrameCodec::new(args.byte_order))?;
    client.set_timeout(Some(Duration::from_secs(args.timeout_secs)))?;
    debug!(server = %args.server, count = args.messages.len(), "Connected");

    if let Err(e) = exchange(&mut client, &args) {
        error!(error = %e, "Request failed");
        return Err(e.into());
    }
    Ok(())
}

fn exchange(client: &mut Client, args: &Args) -> Result<(), ClientError> {
    if args.pipeline {
        let payloads: Vec<&[u8]> = args.messages.iter().map(|m| m.as_bytes()).collect();
        client.send_all(&payloads)?;
        for _ in &args.messages {
            print_response(&client.recv()?);
        }
    } else {
        for message in &args.messages {
            print_response(&client.request(message.as_bytes())?);
        }
    }
    Ok(())
}

fn print_response(payload: &[u8]) {
    println!("server says: {}", String::from_utf8_lossy(payload));
}
