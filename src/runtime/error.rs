//! Fatal server errors.
//!
//! Only setup and wait failures live here. Per-connection failures are
//! reported as [`FrameOutcome::IoError`](super::FrameOutcome) and never
//! leave the reactor.

use std::io;
use std::net::SocketAddr;

/// Failure to produce a listening socket.
#[derive(Debug)]
pub enum ListenerError {
    /// Address resolution failed outright.
    Resolve(io::Error),
    /// Resolution succeeded but produced no addresses.
    NoCandidates,
    /// Every candidate failed; carries what was tried and the last error.
    Exhausted {
        tried: Vec<SocketAddr>,
        last: io::Error,
    },
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Resolve(e) => write!(f, "address resolution failed: {e}"),
            ListenerError::NoCandidates => write!(f, "no addresses to bind"),
            ListenerError::Exhausted { tried, last } => {
                write!(f, "failed to bind any of [")?;
                for (i, addr) in tried.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{addr}")?;
                }
                write!(f, "]: {last}")
            }
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Resolve(e) => Some(e),
            ListenerError::Exhausted { last, .. } => Some(last),
            ListenerError::NoCandidates => None,
        }
    }
}

/// Process-terminating server error.
#[derive(Debug)]
pub enum ServerError {
    Listener(ListenerError),
    /// Creating the readiness-notification handle failed.
    Poll(io::Error),
    /// Registering the listener (or the wake source) failed.
    Register(io::Error),
    /// Waiting for readiness failed for a reason other than a signal.
    Wait(io::Error),
    /// Installing the termination signal handlers failed.
    Signal(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Listener(e) => write!(f, "listener: {e}"),
            ServerError::Poll(e) => write!(f, "poll create: {e}"),
            ServerError::Register(e) => write!(f, "poll register: {e}"),
            ServerError::Wait(e) => write!(f, "poll wait: {e}"),
            ServerError::Signal(e) => write!(f, "sigaction: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Listener(e) => Some(e),
            ServerError::Poll(e)
            | ServerError::Register(e)
            | ServerError::Wait(e)
            | ServerError::Signal(e) => Some(e),
        }
    }
}

impl From<ListenerError> for ServerError {
    fn from(e: ListenerError) -> Self {
        ServerError::Listener(e)
    }
}
