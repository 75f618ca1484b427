//! Request processing hook.
//!
//! The event loop hands every fully decoded request payload to a [`Service`]
//! and frames whatever it returns as the response. The multiplexer knows
//! nothing else about the application, so a richer protocol plugs in here.

use bytes::Bytes;
use tracing::debug;

/// Turns one request payload into one response payload.
///
/// Called once per frame, in arrival order for each connection. Responses
/// longer than [`MAX_PAYLOAD`](crate::runtime::codec::MAX_PAYLOAD) cannot be
/// framed and close the connection.
pub trait Service {
    fn process(&mut self, request: Bytes) -> Bytes;
}

/// Reference service: logs the request and returns it unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

impl Service for Echo {
    fn process(&mut self, request: Bytes) -> Bytes {
        debug!(
            len = request.len(),
            "client says: {}",
            String::from_utf8_lossy(&request)
        );
        request
    }
}
