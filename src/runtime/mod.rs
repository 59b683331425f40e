//! Readiness-driven runtime for the frame echo server.
//!
//! - `listener`: binds the accept socket
//! - `event_loop`: the single-threaded reactor
//! - `connection`: per-client state keyed by poll token
//! - `frame`: the fixed-length fill/echo state machine
//! - `shutdown`: cooperative stop via flag, waker and signals

mod connection;
mod error;
mod event_loop;
mod frame;
mod listener;
mod shutdown;

pub use error::ServerError;
pub use event_loop::Reactor;
pub use shutdown::install_signal_handlers;

use crate::config::Config;

/// Bind the listener, install signal handlers and run until shut down.
pub fn run(config: Config) -> Result<(), ServerError> {
    let listener = listener::obtain(config.host.as_deref(), config.port, config.backlog)?;
    let reactor = Reactor::new(&config, listener)?;
    install_signal_handlers(&reactor.shutdown_handle()).map_err(ServerError::Signal)?;
    reactor.run()
}
