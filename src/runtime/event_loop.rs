//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS. Both are driven edge-triggered,
//! so every accept and every read is repeated until it would block.

use crate::config::Config;
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::error::ServerError;
use crate::runtime::frame::FrameOutcome;
use crate::runtime::shutdown::ShutdownHandle;
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Single-threaded reactor owning the poll, the listener and all clients.
pub struct Reactor {
    poll: Poll,
    events: Events,
    /// `None` once shutdown has started.
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    connections: ConnectionRegistry,
    frame_length: usize,
    drain_timeout: Duration,
    shutdown: ShutdownHandle,
}

impl Reactor {
    /// Create the poll and register `listener` as the accept source.
    pub fn new(config: &Config, listener: std::net::TcpListener) -> Result<Self, ServerError> {
        let poll = Poll::new().map_err(ServerError::Poll)?;

        listener
            .set_nonblocking(true)
            .map_err(ServerError::Register)?;
        let local_addr = listener.local_addr().map_err(ServerError::Register)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Register)?;

        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(ServerError::Register)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.batch_size),
            listener: Some(listener),
            local_addr,
            connections: ConnectionRegistry::new(config.max_connections),
            frame_length: config.frame_length,
            drain_timeout: config.drain_timeout,
            shutdown: ShutdownHandle::new(waker),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops this reactor from another thread or a signal.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run until shutdown is requested.
    ///
    /// Only a failed readiness wait is fatal here. Connection errors close
    /// the affected connection and the loop carries on.
    pub fn run(mut self) -> Result<(), ServerError> {
        info!(
            addr = %self.local_addr,
            frame_length = self.frame_length,
            batch_size = self.events.capacity(),
            "Reactor started"
        );

        while !self.shutdown.is_triggered() {
            if let Err(e) = self.poll.poll(&mut self.events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed");
                return Err(ServerError::Wait(e));
            }

            for event in self.events.iter() {
                match event.token() {
                    // The loop condition re-checks the flag.
                    WAKER_TOKEN => {}
                    LISTENER_TOKEN => {
                        if let Some(listener) = &self.listener {
                            accept_connections(
                                listener,
                                &self.poll,
                                &mut self.connections,
                                self.frame_length,
                            );
                        }
                    }
                    Token(conn_id) => {
                        handle_connection_event(
                            conn_id,
                            event,
                            &self.poll,
                            &mut self.connections,
                            false,
                        );
                    }
                }
            }
        }

        self.drain();
        Ok(())
    }

    /// Stop accepting, let in-flight frames finish, then close everything.
    fn drain(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
            info!(addr = %self.local_addr, "Shutdown requested, listener closed");
        }

        for conn_id in self.connections.idle_ids() {
            close_connection(&self.poll, &mut self.connections, conn_id);
        }

        let deadline = Instant::now() + self.drain_timeout;
        while !self.connections.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.poll.poll(&mut self.events, Some(deadline - now)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Poll failed while draining");
                    break;
                }
            }

            for event in self.events.iter() {
                match event.token() {
                    WAKER_TOKEN | LISTENER_TOKEN => {}
                    Token(conn_id) => {
                        handle_connection_event(
                            conn_id,
                            event,
                            &self.poll,
                            &mut self.connections,
                            true,
                        );
                    }
                }
            }
        }

        if !self.connections.is_empty() {
            warn!(count = self.connections.len(), "Force-closing connections");
        }
        for conn_id in self.connections.ids() {
            close_connection(&self.poll, &mut self.connections, conn_id);
        }

        info!("Reactor stopped");
    }
}

/// Accept until the listener reports `WouldBlock`.
fn accept_connections(
    listener: &TcpListener,
    poll: &Poll,
    connections: &mut ConnectionRegistry,
    frame_length: usize,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let conn_id = match connections.insert(Connection::new(stream, peer, frame_length))
                {
                    Ok(id) => id,
                    Err(_rejected) => {
                        warn!(peer = %peer, "Connection limit reached, rejecting");
                        continue;
                    }
                };

                let Some(conn) = connections.get_mut(conn_id) else {
                    continue;
                };
                // Writable interest lets a deferred echo resume.
                if let Err(e) = poll.registry().register(
                    &mut conn.stream,
                    Token(conn_id),
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    warn!(conn_id, peer = %peer, error = %e, "Failed to register connection");
                    connections.remove(conn_id);
                    continue;
                }

                info!(conn_id, peer = %peer, "Accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if is_resource_exhaustion(&e) => {
                // Deviates from accepting until WouldBlock: retrying now would
                // spin, and queued clients wait for the next listener edge.
                error!(error = %e, "Accept failed, out of resources");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Accept error");
            }
        }
    }
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

fn handle_connection_event(
    conn_id: usize,
    event: &Event,
    poll: &Poll,
    connections: &mut ConnectionRegistry,
    draining: bool,
) {
    let Some(conn) = connections.get_mut(conn_id) else {
        return;
    };
    let peer = conn.peer;

    if event.is_error() {
        let cause = conn.stream.take_error().ok().flatten();
        debug!(conn_id, peer = %peer, error = ?cause, "Socket error");
        close_connection(poll, connections, conn_id);
        return;
    }

    let outcome = conn.drive();
    let idle = conn.is_idle();

    match &outcome {
        FrameOutcome::NeedMoreData => trace!(conn_id, "Waiting for more data"),
        FrameOutcome::FrameCompleted { frames } => trace!(conn_id, frames, "Echoed frames"),
        FrameOutcome::PeerClosed => debug!(conn_id, peer = %peer, "Peer closed"),
        FrameOutcome::IoError(e) => debug!(conn_id, peer = %peer, error = %e, "Connection error"),
    }

    let hangup = event.is_read_closed() && event.is_write_closed();
    if outcome.is_terminal() || hangup || (draining && idle) {
        close_connection(poll, connections, conn_id);
    }
}

fn close_connection(poll: &Poll, connections: &mut ConnectionRegistry, conn_id: usize) {
    if let Some(mut conn) = connections.remove(conn_id) {
        let _ = poll.registry().deregister(&mut conn.stream);
        debug!(
            conn_id,
            peer = %conn.peer,
            state = ?conn.frame_state(),
            "Connection closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::listener;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::thread::{self, JoinHandle};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct TestServer {
        addr: SocketAddr,
        shutdown: ShutdownHandle,
        thread: JoinHandle<Result<(), ServerError>>,
    }

    impl TestServer {
        fn start(config: Config) -> Self {
            let listener = listener::obtain(Some("127.0.0.1"), 0, 512).unwrap();
            let reactor = Reactor::new(&config, listener).unwrap();
            let addr = reactor.local_addr();
            let shutdown = reactor.shutdown_handle();
            let thread = thread::spawn(move || reactor.run());
            Self {
                addr,
                shutdown,
                thread,
            }
        }

        fn with_frame(frame_length: usize) -> Self {
            Self::start(Config {
                frame_length,
                ..Config::default()
            })
        }

        fn connect(&self) -> TcpStream {
            let stream = TcpStream::connect(self.addr).unwrap();
            stream.set_read_timeout(Some(TIMEOUT)).unwrap();
            stream
        }

        fn stop(self) {
            self.shutdown.trigger();
            self.thread.join().unwrap().unwrap();
        }
    }

    fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    /// Assert nothing arrives within a short window.
    fn assert_silent(stream: &mut TcpStream) {
        stream
            .set_read_timeout(Some(Duration::from_millis(150)))
            .unwrap();
        let mut buf = [0u8; 16];
        let err = stream.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    }

    #[test]
    fn test_exact_frame_echo() {
        let server = TestServer::with_frame(5);
        let mut client = server.connect();

        client.write_all(b"hello").unwrap();
        assert_eq!(read_n(&mut client, 5), b"hello");

        server.stop();
    }

    #[test]
    fn test_split_frame_replies_once() {
        let server = TestServer::with_frame(5);
        let mut client = server.connect();

        client.write_all(b"hi").unwrap();
        assert_silent(&mut client);

        client.write_all(b"!!!").unwrap();
        assert_eq!(read_n(&mut client, 5), b"hi!!!");
        assert_silent(&mut client);

        server.stop();
    }

    #[test]
    fn test_close_without_data() {
        let server = TestServer::with_frame(5);
        let mut client = server.connect();

        client.shutdown(Shutdown::Write).unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        server.stop();
    }

    #[test]
    fn test_partial_frame_then_close_gets_no_reply() {
        let server = TestServer::with_frame(5);
        let mut client = server.connect();

        client.write_all(b"abc").unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        server.stop();
    }

    #[test]
    fn test_pipelined_frames() {
        let server = TestServer::with_frame(5);
        let mut client = server.connect();

        client.write_all(b"abcdeFGHIJ").unwrap();
        assert_eq!(read_n(&mut client, 5), b"abcde");
        assert_eq!(read_n(&mut client, 5), b"FGHIJ");

        server.stop();
    }

    #[test]
    fn test_complete_frame_then_half_close_is_echoed() {
        let server = TestServer::with_frame(4);
        let mut client = server.connect();

        client.write_all(b"pingxx").unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"ping");

        server.stop();
    }

    #[test]
    fn test_large_frame_survives_partial_writes() {
        let len = 4 * 1024 * 1024;
        let server = TestServer::with_frame(len);
        let mut client = server.connect();

        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut writer = client.try_clone().unwrap();
        let sent = payload.clone();
        let sender = thread::spawn(move || writer.write_all(&sent).unwrap());

        assert_eq!(read_n(&mut client, len), payload);
        sender.join().unwrap();

        server.stop();
    }

    #[test]
    fn test_concurrent_clients_are_isolated() {
        let server = TestServer::with_frame(8);
        let addr = server.addr;

        let clients: Vec<_> = (0..16u8)
            .map(|id| {
                thread::spawn(move || {
                    let mut stream = TcpStream::connect(addr).unwrap();
                    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
                    for round in 0..20u8 {
                        let frame = [id, round, id, round, id, round, id, round];
                        // Split each frame to interleave partial state across clients.
                        stream.write_all(&frame[..3]).unwrap();
                        stream.write_all(&frame[3..]).unwrap();
                        assert_eq!(read_n(&mut stream, 8), frame);
                    }
                })
            })
            .collect();

        for client in clients {
            client.join().unwrap();
        }
        server.stop();
    }

    #[test]
    fn test_connect_burst_larger_than_batch() {
        let config = Config {
            frame_length: 3,
            batch_size: 4,
            ..Config::default()
        };
        let listener = listener::obtain(Some("127.0.0.1"), 0, 512).unwrap();
        let reactor = Reactor::new(&config, listener).unwrap();
        let addr = reactor.local_addr();

        // Queue the whole burst in the backlog before the loop starts, so a
        // single listener readiness has to drain all of it.
        let mut clients: Vec<TcpStream> = (0..100)
            .map(|_| {
                let stream = TcpStream::connect(addr).unwrap();
                stream.set_read_timeout(Some(TIMEOUT)).unwrap();
                stream
            })
            .collect();

        let shutdown = reactor.shutdown_handle();
        let thread = thread::spawn(move || reactor.run());

        for (i, client) in clients.iter_mut().enumerate() {
            client.write_all(&[i as u8, b'-', b'x']).unwrap();
        }
        for (i, client) in clients.iter_mut().enumerate() {
            assert_eq!(read_n(client, 3), [i as u8, b'-', b'x']);
        }

        shutdown.trigger();
        thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_closed_connections_are_released() {
        let mut poll = Poll::new().unwrap();
        let std_listener = listener::obtain(Some("127.0.0.1"), 0, 16).unwrap();
        let addr = std_listener.local_addr().unwrap();
        let mut listener = TcpListener::from_std(std_listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .unwrap();
        let mut connections = ConnectionRegistry::new(8);
        let mut events = Events::with_capacity(16);

        let reset = TcpStream::connect(addr).unwrap();
        let mut half_closed = TcpStream::connect(addr).unwrap();

        let deadline = Instant::now() + TIMEOUT;
        while connections.len() < 2 && Instant::now() < deadline {
            accept_connections(&listener, &poll, &mut connections, 5);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(connections.len(), 2);

        (&reset).write_all(b"ab").unwrap();
        socket2::SockRef::from(&reset)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(reset);
        half_closed.write_all(b"xyz").unwrap();
        half_closed.shutdown(Shutdown::Write).unwrap();

        while !connections.is_empty() && Instant::now() < deadline {
            poll.poll(&mut events, Some(Duration::from_millis(50)))
                .unwrap();
            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => {}
                    Token(conn_id) => {
                        handle_connection_event(conn_id, event, &poll, &mut connections, false)
                    }
                }
            }
        }
        assert_eq!(connections.len(), 0);

        // The server side is gone: the half-closed client sees EOF, no echo.
        half_closed.set_read_timeout(Some(TIMEOUT)).unwrap();
        let mut rest = Vec::new();
        let _ = half_closed.read_to_end(&mut rest);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_reset_connection_does_not_stop_others() {
        let server = TestServer::with_frame(5);
        let mut healthy = server.connect();

        let doomed = server.connect();
        (&doomed).write_all(b"ab").unwrap();
        // Zero linger turns close into a reset.
        socket2::SockRef::from(&doomed)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(doomed);

        healthy.write_all(b"12345").unwrap();
        assert_eq!(read_n(&mut healthy, 5), b"12345");

        let mut late = server.connect();
        late.write_all(b"later").unwrap();
        assert_eq!(read_n(&mut late, 5), b"later");

        server.stop();
    }

    #[test]
    fn test_connection_limit_rejects_extra_clients() {
        let server = TestServer::start(Config {
            frame_length: 2,
            max_connections: 1,
            ..Config::default()
        });

        let mut first = server.connect();
        first.write_all(b"ok").unwrap();
        assert_eq!(read_n(&mut first, 2), b"ok");

        let mut second = server.connect();
        let mut rest = Vec::new();
        // Either a clean EOF or a reset, but never an echo.
        let _ = second.read_to_end(&mut rest);
        assert!(rest.is_empty());

        server.stop();
    }

    #[test]
    fn test_shutdown_closes_clients() {
        let server = TestServer::with_frame(5);
        let mut client = server.connect();
        client.write_all(b"hello").unwrap();
        assert_eq!(read_n(&mut client, 5), b"hello");

        let addr = server.addr;
        server.stop();

        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest);
        assert!(rest.is_empty());
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_drain_finishes_in_flight_frame() {
        let server = TestServer::start(Config {
            frame_length: 5,
            drain_timeout: Duration::from_secs(5),
            ..Config::default()
        });
        let mut idle = server.connect();
        let mut busy = server.connect();

        busy.write_all(b"ab").unwrap();
        // Let the reactor buffer the partial frame before stopping.
        thread::sleep(Duration::from_millis(100));
        server.shutdown.trigger();

        let mut rest = Vec::new();
        let _ = idle.read_to_end(&mut rest);
        assert!(rest.is_empty());

        busy.write_all(b"cde").unwrap();
        assert_eq!(read_n(&mut busy, 5), b"abcde");

        server.thread.join().unwrap().unwrap();
    }
}
