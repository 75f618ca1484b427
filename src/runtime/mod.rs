//! Single-threaded readiness runtime.
//!
//! Built from a few layers, leaves first:
//! - `codec`: length-prefixed frame encoding and decoding
//! - `buffer`: bounded read buffer and response write cursor
//! - `connection`: per-connection state machine and the bounded table
//! - `event_loop`: mio poll driver (epoll on Linux, kqueue on macOS)

pub mod buffer;
pub mod codec;
pub mod connection;
pub mod event_loop;

#[cfg(test)]
pub(crate) mod testing;

pub use codec::{ByteOrder, CodecError, Decoded, FrameCodec, MAX_PAYLOAD};
pub use connection::{CloseReason, Connection, ConnectionTable, Drive, Phase, DRIVE_BUDGET};
pub use event_loop::{EventLoop, ShutdownHandle};

use crate::config::Config;
use crate::service::Echo;

/// Run the echo server until the process exits.
pub fn run(config: Config) -> std::io::Result<()> {
    let mut event_loop = EventLoop::bind(&config, Echo)?;
    event_loop.run()
}
