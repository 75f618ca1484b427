//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! One thread drives everything. Each call to [`EventLoop::turn`]:
//!
//! 1. blocks in `poll` for at most the configured timeout,
//! 2. accepts at most one pending connection,
//! 3. drives every ready connection, in table order,
//! 4. sweeps connections that ended up closing.
//!
//! Each dispatch is bounded by the connection's drive budget. A connection
//! that spends it is carried into the next iteration, which then polls
//! without blocking, so one busy peer cannot hold up the others.
//!
//! Connections are registered for the readiness their current phase needs
//! (readable while reading, writable while writing) and re-registered when
//! the phase changes. Since a connection is always driven until the socket
//! reports `WouldBlock`, edge-triggered notifications are never lost.

use crate::config::Config;
use crate::runtime::codec::FrameCodec;
use crate::runtime::connection::{CloseReason, Connection, ConnectionTable, Drive};
use crate::service::Service;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

const EVENTS_CAPACITY: usize = 1024;

/// Stops a running [`EventLoop`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the loop to stop after its current iteration.
    pub fn shutdown(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::Release);
        self.waker.wake()
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Single-threaded connection multiplexer.
pub struct EventLoop<H> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionTable<TcpStream>,
    service: H,
    codec: FrameCodec,
    poll_timeout: Duration,
    /// The listener reported readiness and has not yet returned `WouldBlock`.
    accept_pending: bool,
    /// Scratch list of ready connection ids, reused across iterations.
    ready: Vec<usize>,
    /// Connections that yielded with work left; driven again next iteration.
    carried: Vec<usize>,
    shutdown: ShutdownHandle,
}

impl<H: Service> EventLoop<H> {
    /// Bind the listening socket and set up the poller.
    pub fn bind(config: &Config, service: H) -> io::Result<Self> {
        let poll = Poll::new()?;

        let mut listener = TcpListener::from_std(create_listener(config.listen, config.backlog)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        info!(
            addr = %listener.local_addr()?,
            max_connections = config.max_connections,
            poll_timeout_ms = config.poll_timeout.as_millis() as u64,
            byte_order = ?config.byte_order,
            "Listening"
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            connections: ConnectionTable::new(config.max_connections),
            service,
            codec: FrameCodec::new(config.byte_order),
            poll_timeout: config.poll_timeout,
            accept_pending: false,
            ready: Vec::new(),
            carried: Vec::new(),
            shutdown: ShutdownHandle {
                requested: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn connections(&self) -> &ConnectionTable<TcpStream> {
        &self.connections
    }

    /// Run until shutdown is requested.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.shutdown.is_requested() {
            self.turn()?;
        }
        info!(active = self.connections.len(), "Event loop stopped");
        Ok(())
    }

    /// Run a single iteration.
    ///
    /// Only fails if the poller itself fails; client misbehavior never
    /// surfaces here.
    pub fn turn(&mut self) -> io::Result<()> {
        // Don't sleep while connections are queued on the listener or
        // carried connections have work left.
        let timeout = if self.accept_pending || !self.carried.is_empty() {
            Duration::ZERO
        } else {
            self.poll_timeout
        };

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        ready.append(&mut self.carried);

        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => self.accept_pending = true,
                WAKER_TOKEN => {}
                Token(conn_id) => ready.push(conn_id),
            }
        }

        if self.events.is_empty() {
            trace!(active = self.connections.len(), "Idle tick");
        }

        if self.accept_pending {
            self.accept_one();
        }

        // Slab keys are the table order.
        ready.sort_unstable();
        ready.dedup();
        for &conn_id in &ready {
            if self.dispatch(conn_id) == Drive::Yielded {
                self.carried.push(conn_id);
            }
        }
        self.ready = ready;

        self.sweep();
        Ok(())
    }

    fn accept_one(&mut self) {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.accept_pending = false;
                return;
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                ) =>
            {
                return;
            }
            Err(e) => {
                // Stop spinning; the next listener event resumes accepting.
                error!(error = %e, "Accept error");
                self.accept_pending = false;
                return;
            }
        };

        if self.connections.is_full() {
            warn!(
                peer = %peer,
                max_connections = self.connections.capacity(),
                "Connection limit reached, rejecting"
            );
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            warn!(peer = %peer, error = %e, "Failed to configure socket, rejecting");
            return;
        }

        let Ok(conn_id) = self.connections.insert(Connection::new(stream, self.codec)) else {
            return;
        };

        let registered = match self.connections.get_mut(conn_id) {
            Some(conn) => {
                self.poll
                    .registry()
                    .register(conn.stream_mut(), Token(conn_id), Interest::READABLE)
            }
            None => return,
        };

        if let Err(e) = registered {
            warn!(peer = %peer, error = %e, "Failed to register connection, rejecting");
            self.connections.remove(conn_id);
            return;
        }

        debug!(conn_id, peer = %peer, "Accepted connection");
    }

    fn dispatch(&mut self, conn_id: usize) -> Drive {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Drive::Parked;
        };

        let before = conn.interest();
        let outcome = conn.drive(&mut self.service);

        let Some(interest) = conn.interest() else {
            return Drive::Parked;
        };
        if Some(interest) != before {
            if let Err(e) =
                self.poll
                    .registry()
                    .reregister(conn.stream_mut(), Token(conn_id), interest)
            {
                conn.close(CloseReason::Io(e.kind()));
                return Drive::Parked;
            }
        }

        if outcome == Drive::Yielded {
            trace!(conn_id, "Drive budget spent, carrying over");
        }
        outcome
    }

    fn sweep(&mut self) {
        for (conn_id, mut conn) in self.connections.sweep() {
            let _ = self.poll.registry().deregister(conn.stream_mut());
            if let Some(reason) = conn.close_reason() {
                debug!(conn_id, %reason, "Connection closed");
            }
        }
    }
}

/// Create a non-blocking TCP listener with `SO_REUSEADDR`.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
