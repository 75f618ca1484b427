//! Blocking client for the framed protocol.
//!
//! Requests can be pipelined: `send` several payloads, then `recv` the
//! responses in the same order.

use crate::runtime::codec::{CodecError, FrameCodec, HEADER_LEN, MAX_PAYLOAD};
use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("server announced a {declared} byte response, limit is {max}")]
    Oversized { declared: usize, max: usize },
    #[error("connection closed by server")]
    Closed,
}

#[derive(Debug)]
pub struct Client {
    stream: TcpStream,
    codec: FrameCodec,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A, codec: FrameCodec) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, codec))
    }

    pub fn from_stream(stream: TcpStream, codec: FrameCodec) -> Self {
        Self { stream, codec }
    }

    /// Limit how long `recv` and `send` may block. `None` blocks forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)
    }

    /// Send one request without waiting for the response.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        let frame = self.codec.encode(payload)?;
        self.stream.write_all(&frame)?;
        Ok(())
    }

    /// Send several requests back to back in a single write.
    pub fn send_all(&mut self, payloads: &[&[u8]]) -> Result<(), ClientError> {
        let mut buf = BytesMut::new();
        for payload in payloads {
            self.codec.encode_into(payload, &mut buf)?;
        }
        self.stream.write_all(&buf)?;
        Ok(())
    }

    /// Block until one response frame has arrived.
    pub fn recv(&mut self) -> Result<Bytes, ClientError> {
        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ClientError::Closed
            } else {
                ClientError::Io(e)
            }
        })?;

        let declared = self.codec.declared_len(header);
        if declared > MAX_PAYLOAD {
            return Err(ClientError::Oversized {
                declared,
                max: MAX_PAYLOAD,
            });
        }

        let mut payload = vec![0u8; declared];
        self.stream.read_exact(&mut payload)?;
        Ok(Bytes::from(payload))
    }

    /// Send one request and wait for its response.
    pub fn request(&mut self, payload: &[u8]) -> Result<Bytes, ClientError> {
        self.send(payload)?;
        self.recv()
    }
}
