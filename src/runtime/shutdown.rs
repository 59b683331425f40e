//! Cooperative shutdown for the reactor.
//!
//! A [`ShutdownHandle`] sets a flag and wakes the poll so the loop notices
//! promptly. SIGTERM/SIGINT feed the same path through a process-wide flag
//! and a published waker.

use mio::Waker;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Set from the signal handler. Monotonic: never cleared.
static SIGNALED: AtomicBool = AtomicBool::new(false);

/// Waker the signal handler pokes after setting [`SIGNALED`].
static SIGNAL_WAKER: OnceLock<Arc<Waker>> = OnceLock::new();

/// Cloneable trigger for a running reactor.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub(crate) fn new(waker: Waker) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(waker),
        }
    }

    /// Request shutdown and wake the reactor.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, "Failed to wake reactor");
        }
    }

    /// Whether shutdown was requested here or by a termination signal.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire) || SIGNALED.load(Ordering::Relaxed)
    }
}

/// Install SIGTERM and SIGINT handlers that stop the reactor owning `handle`.
///
/// `SA_RESTART` is deliberately left unset so a blocked poll returns
/// `Interrupted` and re-checks the flag.
pub fn install_signal_handlers(handle: &ShutdownHandle) -> io::Result<()> {
    let _ = SIGNAL_WAKER.set(Arc::clone(&handle.waker));

    // SAFETY: the handler only performs an atomic store and an eventfd
    // write, both async-signal-safe. `sa` is fully initialised before use.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_signal as usize;
        sa.sa_flags = 0;
        libc::sigemptyset(&mut sa.sa_mask);

        for signal in [libc::SIGTERM, libc::SIGINT] {
            if libc::sigaction(signal, &sa, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

extern "C" fn on_signal(_sig: libc::c_int) {
    SIGNALED.store(true, Ordering::Relaxed);
    if let Some(waker) = SIGNAL_WAKER.get() {
        let _ = waker.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll, Token};
    use std::time::Duration;

    #[test]
    fn test_trigger_sets_flag_and_wakes() {
        let mut poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), Token(7)).unwrap();
        let handle = ShutdownHandle::new(waker);
        let clone = handle.clone();

        assert!(!handle.is_triggered());
        clone.trigger();
        assert!(handle.is_triggered());

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(events.iter().any(|e| e.token() == Token(7)));
    }
}
