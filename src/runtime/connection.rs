//! Connection state machine for managing client streams.
//!
//! A connection alternates between reading requests and writing responses:
//!
//! ```text
//! Reading -> Writing -> Reading -> ... -> Closing
//! ```
//!
//! In `Reading`, bytes are drained from the socket into the read buffer and
//! every complete frame is decoded into a FIFO of pending requests. The first
//! one is turned into a response and the connection switches to `Writing`.
//! Once the response is flushed, the next pending request (if any) is served
//! immediately, so pipelined requests never wait on another readiness event.
//!
//! A bad frame header stops decoding but does not close right away: requests
//! decoded before it are still answered, then the connection closes.
//!
//! `Closing` is terminal. The owning table removes such records on its next
//! sweep.

use crate::runtime::buffer::{ReadBuffer, WriteBuffer};
use crate::runtime::codec::{Decoded, FrameCodec, MAX_FRAME};
use crate::service::Service;
use bytes::Bytes;
use mio::Interest;
use slab::Slab;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer shut down its side (zero-length read).
    PeerClosed,
    /// The peer announced a frame larger than the limit.
    Protocol { declared: usize },
    /// The service returned a response that cannot be framed.
    ResponseTooLarge { len: usize },
    /// Non-transient socket error.
    Io(io::ErrorKind),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::Protocol { declared } => {
                write!(f, "request too long ({declared} bytes)")
            }
            CloseReason::ResponseTooLarge { len } => {
                write!(f, "response too long ({len} bytes)")
            }
            CloseReason::Io(kind) => write!(f, "i/o error: {kind}"),
        }
    }
}

/// Current phase of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for request bytes.
    Reading,
    /// Flushing a response.
    Writing(WriteBuffer),
    /// Done; waiting to be reaped.
    Closing(CloseReason),
}

/// Socket operations one call to [`Connection::drive`] may perform.
pub const DRIVE_BUDGET: usize = 64;

/// How a call to [`Connection::drive`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drive {
    /// Waiting for readiness, or closing.
    Parked,
    /// Budget spent; there may be more to do without a new readiness event.
    Yielded,
}

/// Whether a phase step can continue or must wait for readiness.
enum Step {
    Continue,
    Blocked,
}

/// A single client connection.
pub struct Connection<S> {
    stream: S,
    phase: Phase,
    read_buf: ReadBuffer,
    /// Requests already decoded but not yet answered, oldest first.
    pending: VecDeque<Bytes>,
    /// Set once a bad header is seen; applied when `pending` runs dry.
    close_after: Option<CloseReason>,
    codec: FrameCodec,
}

impl<S: Read + Write> Connection<S> {
    /// Create a new connection in the reading phase with empty buffers.
    pub fn new(stream: S, codec: FrameCodec) -> Self {
        Self {
            stream,
            phase: Phase::Reading,
            read_buf: ReadBuffer::new(MAX_FRAME),
            pending: VecDeque::new(),
            close_after: None,
            codec,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.phase, Phase::Closing(_))
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.phase {
            Phase::Closing(reason) => Some(reason),
            _ => None,
        }
    }

    /// Readiness the event loop should watch for in the current phase.
    pub fn interest(&self) -> Option<Interest> {
        match self.phase {
            Phase::Reading => Some(Interest::READABLE),
            Phase::Writing(_) => Some(Interest::WRITABLE),
            Phase::Closing(_) => None,
        }
    }

    /// Bytes received but not yet decoded into a request.
    pub fn buffered(&self) -> usize {
        self.read_buf.len()
    }

    /// Decoded requests still waiting for their response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Mark the connection for closing. The first reason sticks.
    pub fn close(&mut self, reason: CloseReason) {
        if !self.is_closing() {
            self.phase = Phase::Closing(reason);
            self.pending.clear();
        }
    }

    /// Make progress until the socket would block, the connection is
    /// closing, or [`DRIVE_BUDGET`] socket operations have been spent.
    ///
    /// On [`Drive::Yielded`] the caller must drive again without waiting for
    /// readiness; the socket has not reported `WouldBlock`.
    pub fn drive<H: Service + ?Sized>(&mut self, service: &mut H) -> Drive {
        for _ in 0..DRIVE_BUDGET {
            let step = match self.phase {
                Phase::Reading => self.fill(service),
                Phase::Writing(_) => self.flush(service),
                Phase::Closing(_) => return Drive::Parked,
            };
            if let Step::Blocked = step {
                return Drive::Parked;
            }
        }

        if self.is_closing() {
            Drive::Parked
        } else {
            Drive::Yielded
        }
    }

    fn fill<H: Service + ?Sized>(&mut self, service: &mut H) -> Step {
        let spare = self.read_buf.spare_mut();
        // Leftovers are always a partial frame, shorter than the buffer.
        debug_assert!(!spare.is_empty(), "read buffer full of undecoded bytes");

        match self.stream.read(spare) {
            Ok(0) => {
                self.close(CloseReason::PeerClosed);
                return Step::Continue;
            }
            Ok(n) => self.read_buf.commit(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Blocked,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Step::Continue,
            Err(e) => {
                self.close(CloseReason::Io(e.kind()));
                return Step::Continue;
            }
        }

        self.decode_all();
        self.respond_next(service);
        Step::Continue
    }

    fn flush<H: Service + ?Sized>(&mut self, service: &mut H) -> Step {
        let Phase::Writing(out) = &mut self.phase else {
            return Step::Continue;
        };

        match self.stream.write(out.pending()) {
            Ok(0) => {
                self.close(CloseReason::Io(io::ErrorKind::WriteZero));
                return Step::Continue;
            }
            Ok(n) => out.advance(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Blocked,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Step::Continue,
            Err(e) => {
                self.close(CloseReason::Io(e.kind()));
                return Step::Continue;
            }
        }

        if out.is_flushed() {
            self.phase = Phase::Reading;
            self.respond_next(service);
        }
        Step::Continue
    }

    /// Move every complete frame from the read buffer to the pending queue,
    /// stopping at the first bad header.
    fn decode_all(&mut self) {
        loop {
            match self.codec.try_decode(self.read_buf.data()) {
                Decoded::Frame { payload, consumed } => {
                    self.pending.push_back(Bytes::copy_from_slice(payload));
                    self.read_buf.consume(consumed);
                }
                Decoded::Incomplete => return,
                Decoded::Invalid { declared } => {
                    self.close_after = Some(CloseReason::Protocol { declared });
                    return;
                }
            }
        }
    }

    /// Stage the response to the oldest pending request, if there is one.
    ///
    /// With nothing left to answer, a deferred close takes effect.
    fn respond_next<H: Service + ?Sized>(&mut self, service: &mut H) {
        let Some(request) = self.pending.pop_front() else {
            if let Some(reason) = self.close_after.take() {
                self.close(reason);
            }
            return;
        };

        let response = service.process(request);
        match self.codec.encode(&response) {
            Ok(frame) => self.phase = Phase::Writing(WriteBuffer::new(frame)),
            Err(_) => self.close(CloseReason::ResponseTooLarge {
                len: response.len(),
            }),
        }
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("phase", &self.phase)
            .field("buffered", &self.read_buf.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Bounded table of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove, and never holds more than
/// `max_connections` records.
pub struct ConnectionTable<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S: Read + Write> ConnectionTable<S> {
    /// Create a new table with the given hard capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection.
    ///
    /// Returns the connection back if the table is at capacity, so the caller
    /// decides how to dispose of it.
    pub fn insert(&mut self, conn: Connection<S>) -> Result<usize, Connection<S>> {
        if self.is_full() {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get(&self, id: usize) -> Option<&Connection<S>> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Iterate over all connections in table order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection<S>)> {
        self.connections.iter()
    }

    /// Remove every closing connection, returning them in table order.
    pub fn sweep(&mut self) -> Vec<(usize, Connection<S>)> {
        let closing: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_closing())
            .map(|(id, _)| id)
            .collect();

        closing
            .into_iter()
            .map(|id| (id, self.connections.remove(id)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::codec::{ByteOrder, MAX_PAYLOAD};
    use crate::runtime::testing::ScriptedStream;
    use crate::service::Echo;

    fn frames(payloads: &[&[u8]]) -> Vec<u8> {
        let codec = FrameCodec::default();
        payloads
            .iter()
            .flat_map(|p| codec.encode(p).unwrap().to_vec())
            .collect()
    }

    fn connection(stream: ScriptedStream) -> Connection<ScriptedStream> {
        Connection::new(stream, FrameCodec::default())
    }

    #[test]
    fn test_single_request_round_trip() {
        let mut stream = ScriptedStream::new();
        stream.push_read(frames(&[b"hello1"]));
        let mut conn = connection(stream);

        conn.drive(&mut Echo);

        assert_eq!(conn.stream().written(), &frames(&[b"hello1"])[..]);
        assert_eq!(conn.phase(), &Phase::Reading);
        assert_eq!(conn.interest(), Some(Interest::READABLE));
    }

    #[test]
    fn test_pipelined_requests_answered_in_order() {
        let mut stream = ScriptedStream::new();
        stream.push_read(frames(&[b"first", b"second", b"third"]));
        let mut conn = connection(stream);

        conn.drive(&mut Echo);

        assert_eq!(
            conn.stream().written(),
            &frames(&[b"first", b"second", b"third"])[..]
        );
        assert_eq!(conn.phase(), &Phase::Reading);
        assert_eq!(conn.buffered(), 0);
        assert_eq!(conn.pending_requests(), 0);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let bytes = frames(&[b"hello1", b"hello2"]);
        let mut stream = ScriptedStream::new();
        // Split inside the first header and inside the second payload.
        stream.push_read(bytes[..2].to_vec());
        stream.push_would_block();
        stream.push_read(bytes[2..14].to_vec());
        stream.push_would_block();
        stream.push_read(bytes[14..].to_vec());
        let mut conn = connection(stream);

        conn.drive(&mut Echo);
        assert!(conn.stream().written().is_empty());
        assert_eq!(conn.buffered(), 2);

        conn.drive(&mut Echo);
        assert_eq!(conn.stream().written(), &frames(&[b"hello1"])[..]);
        assert_eq!(conn.buffered(), 4);

        conn.drive(&mut Echo);
        assert_eq!(conn.stream().written(), &bytes[..]);
        assert_eq!(conn.buffered(), 0);
    }

    #[test]
    fn test_partial_writes_resume() {
        let mut stream = ScriptedStream::new();
        stream.push_read(frames(&[b"abcdef", b"ghi"]));
        stream.set_write_limit(3);
        stream.block_writes_after(2);
        let mut conn = connection(stream);

        conn.drive(&mut Echo);
        // Two 3-byte writes went through before the socket filled up.
        assert_eq!(conn.stream().written().len(), 6);
        match conn.phase() {
            Phase::Writing(out) => assert_eq!(out.written(), 6),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(conn.interest(), Some(Interest::WRITABLE));
        assert_eq!(conn.pending_requests(), 1);

        conn.stream_mut().unblock_writes();
        conn.drive(&mut Echo);
        assert_eq!(conn.stream().written(), &frames(&[b"abcdef", b"ghi"])[..]);
        assert_eq!(conn.phase(), &Phase::Reading);
    }

    #[test]
    fn test_peer_close_on_idle_connection() {
        let mut stream = ScriptedStream::new();
        stream.push_eof();
        let mut conn = connection(stream);

        assert_eq!(conn.drive(&mut Echo), Drive::Parked);
        assert_eq!(conn.close_reason(), Some(CloseReason::PeerClosed));
        assert_eq!(conn.interest(), None);
    }

    #[test]
    fn test_peer_close_discards_pending_output() {
        let mut stream = ScriptedStream::new();
        stream.push_read(frames(&[b"first", b"second", b"third"]));
        stream.set_write_limit(3);
        stream.block_writes_after(1);
        let mut conn = connection(stream);

        // First response partly written, two requests still queued.
        conn.drive(&mut Echo);
        assert!(matches!(conn.phase(), Phase::Writing(out) if out.written() == 3));
        assert_eq!(conn.pending_requests(), 2);

        conn.stream_mut().fail_writes(io::ErrorKind::BrokenPipe);
        assert_eq!(conn.drive(&mut Echo), Drive::Parked);
        assert_eq!(
            conn.close_reason(),
            Some(CloseReason::Io(io::ErrorKind::BrokenPipe))
        );
        assert_eq!(conn.pending_requests(), 0);
        assert_eq!(conn.interest(), None);
        assert_eq!(conn.stream().written().len(), 3);
    }

    #[test]
    fn test_oversize_header_closes() {
        let mut stream = ScriptedStream::new();
        let mut bytes = ((MAX_PAYLOAD + 1) as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(b"junk");
        stream.push_read(bytes);
        let mut conn = connection(stream);

        conn.drive(&mut Echo);
        assert_eq!(
            conn.close_reason(),
            Some(CloseReason::Protocol {
                declared: MAX_PAYLOAD + 1
            })
        );
        assert!(conn.stream().written().is_empty());
    }

    #[test]
    fn test_valid_frames_before_invalid_are_answered() {
        let mut bytes = frames(&[b"ok", b"also ok"]);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut stream = ScriptedStream::new();
        stream.push_read(bytes);
        // Never read: the bad header ends the session.
        stream.push_read(frames(&[b"late"]));
        stream.block_writes_after(0);
        let mut conn = connection(stream);

        // Responses still owed, so the connection stays open.
        conn.drive(&mut Echo);
        assert!(!conn.is_closing());
        assert_eq!(conn.interest(), Some(Interest::WRITABLE));
        assert_eq!(conn.pending_requests(), 1);

        conn.stream_mut().unblock_writes();
        conn.drive(&mut Echo);
        assert_eq!(conn.stream().written(), &frames(&[b"ok", b"also ok"])[..]);
        assert_eq!(
            conn.close_reason(),
            Some(CloseReason::Protocol {
                declared: u32::MAX as usize
            })
        );
    }

    #[test]
    fn test_drive_stops_at_budget() {
        let requests: Vec<&[u8]> = vec![&b"spam"[..]; 1000];
        let mut stream = ScriptedStream::new();
        stream.push_read(frames(&requests));
        let mut conn = connection(stream);

        assert_eq!(conn.drive(&mut Echo), Drive::Yielded);
        let first_pass = conn.stream().written().len();
        assert!(first_pass > 0);
        assert!(first_pass <= DRIVE_BUDGET * 8);
        assert!(!conn.is_closing());

        let mut drives = 1;
        while conn.drive(&mut Echo) == Drive::Yielded {
            drives += 1;
            assert!(drives < 100, "drive never parked");
        }
        assert_eq!(conn.stream().written(), &frames(&requests)[..]);
        assert_eq!(conn.phase(), &Phase::Reading);
    }

    #[test]
    fn test_read_error_closes() {
        let mut stream = ScriptedStream::new();
        stream.push_error(io::ErrorKind::ConnectionReset);
        let mut conn = connection(stream);

        conn.drive(&mut Echo);
        assert_eq!(
            conn.close_reason(),
            Some(CloseReason::Io(io::ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn test_interrupted_read_is_retried() {
        let mut stream = ScriptedStream::new();
        stream.push_error(io::ErrorKind::Interrupted);
        stream.push_read(frames(&[b"again"]));
        let mut conn = connection(stream);

        conn.drive(&mut Echo);
        assert_eq!(conn.stream().written(), &frames(&[b"again"])[..]);
        assert!(!conn.is_closing());
    }

    #[test]
    fn test_oversize_response_closes() {
        struct Inflate;
        impl Service for Inflate {
            fn process(&mut self, _request: Bytes) -> Bytes {
                Bytes::from(vec![b'x'; MAX_PAYLOAD + 1])
            }
        }

        let mut stream = ScriptedStream::new();
        stream.push_read(frames(&[b"boom"]));
        let mut conn = connection(stream);

        conn.drive(&mut Inflate);
        assert_eq!(
            conn.close_reason(),
            Some(CloseReason::ResponseTooLarge {
                len: MAX_PAYLOAD + 1
            })
        );
    }

    #[test]
    fn test_max_size_frame_fits_buffer() {
        let payload = vec![b'z'; MAX_PAYLOAD];
        let mut stream = ScriptedStream::new();
        stream.push_read(frames(&[&payload]));
        let mut conn = connection(stream);

        conn.drive(&mut Echo);
        assert_eq!(conn.stream().written(), &frames(&[&payload])[..]);
    }

    #[test]
    fn test_big_endian_connection() {
        let codec = FrameCodec::new(ByteOrder::Big);
        let request = codec.encode(b"be").unwrap().to_vec();
        let mut stream = ScriptedStream::new();
        stream.push_read(request.clone());
        let mut conn = Connection::new(stream, codec);

        conn.drive(&mut Echo);
        assert_eq!(conn.stream().written(), &request[..]);
    }

    #[test]
    fn test_close_keeps_first_reason() {
        let mut conn = connection(ScriptedStream::new());
        conn.close(CloseReason::PeerClosed);
        conn.close(CloseReason::Io(io::ErrorKind::BrokenPipe));
        assert_eq!(conn.close_reason(), Some(CloseReason::PeerClosed));
    }

    #[test]
    fn test_connection_table_capacity() {
        let mut table = ConnectionTable::new(2);

        let id1 = table.insert(connection(ScriptedStream::new())).unwrap();
        let id2 = table.insert(connection(ScriptedStream::new())).unwrap();
        assert_ne!(id1, id2);
        assert!(table.is_full());

        // At capacity: rejected and handed back, count unchanged.
        assert!(table.insert(connection(ScriptedStream::new())).is_err());
        assert_eq!(table.len(), 2);

        table.remove(id1);
        assert!(!table.contains(id1));
        assert_eq!(table.len(), 1);
        assert!(table.insert(connection(ScriptedStream::new())).is_ok());
    }

    #[test]
    fn test_sweep_removes_only_closing() {
        let mut table = ConnectionTable::new(4);

        let mut eof = ScriptedStream::new();
        eof.push_eof();
        let closed = table.insert(connection(eof)).unwrap();
        let open = table.insert(connection(ScriptedStream::new())).unwrap();

        for id in [closed, open] {
            table.get_mut(id).unwrap().drive(&mut Echo);
        }

        let swept = table.sweep();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].0, closed);
        assert_eq!(swept[0].1.close_reason(), Some(CloseReason::PeerClosed));

        assert!(!table.contains(closed));
        assert!(table.contains(open));
        assert!(table.sweep().is_empty());
    }
}
