//! Listening socket construction.
//!
//! Resolves a host/port into candidate addresses and binds the first one
//! that works. The returned socket is already non-blocking and listening.

use super::error::ListenerError;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, ToSocketAddrs};
use tracing::debug;

/// Obtain a bound, non-blocking, listening socket for `port`.
///
/// With no `host`, the IPv6 wildcard is tried before the IPv4 one, which
/// mirrors passive resolution on most systems.
pub fn obtain(host: Option<&str>, port: u16, backlog: i32) -> Result<TcpListener, ListenerError> {
    let candidates = candidates(host, port)?;
    if candidates.is_empty() {
        return Err(ListenerError::NoCandidates);
    }

    let mut last = None;
    for addr in &candidates {
        match bind_one(*addr, backlog) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!(addr = %addr, error = %e, "Bind candidate failed");
                last = Some(e);
            }
        }
    }

    Err(ListenerError::Exhausted {
        tried: candidates,
        last: last.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)),
    })
}

fn candidates(host: Option<&str>, port: u16) -> Result<Vec<SocketAddr>, ListenerError> {
    match host {
        Some(host) => (host, port)
            .to_socket_addrs()
            .map(Iterator::collect)
            .map_err(ListenerError::Resolve),
        None => Ok(vec![
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        ]),
    }
}

fn bind_one(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    if addr.is_ipv6() {
        // Accept IPv4-mapped peers on the wildcard where the OS permits it.
        let _ = socket.set_only_v6(false);
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
