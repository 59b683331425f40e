//! Fixed-length frame state machine.
//!
//! Every message is exactly `len` bytes with no header or delimiter. Bytes
//! accumulate in a per-connection buffer until a frame is full, then the
//! frame is written back unchanged.
//!
//! Readiness notifications are edge-triggered, so [`FrameBuffer::drive`]
//! keeps reading until the socket reports `WouldBlock`. Partial frames stay
//! in the buffer across calls because the next notification only arrives
//! when new bytes do.

use std::io::{self, Read, Write};

/// Where the current frame is in its fill/echo cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Accumulating bytes of the current frame.
    Filling {
        /// Bytes already received, `0..len`.
        filled: usize,
    },
    /// Frame complete, echoing it back.
    Echoing {
        /// Bytes of the frame already written.
        written: usize,
    },
}

/// Result of driving a connection after a readiness notification.
#[derive(Debug)]
pub enum FrameOutcome {
    /// Nothing completed; waiting for more bytes or write space.
    NeedMoreData,
    /// At least one frame was fully received and echoed.
    FrameCompleted {
        /// Frames echoed during this call.
        frames: usize,
    },
    /// Peer performed an orderly shutdown.
    PeerClosed,
    /// Read or write failed.
    IoError(io::Error),
}

impl FrameOutcome {
    /// Whether the connection must be closed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FrameOutcome::PeerClosed | FrameOutcome::IoError(_))
    }
}

/// Per-connection frame buffer, sized once at accept time.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Box<[u8]>,
    state: FrameState,
}

impl FrameBuffer {
    /// Create an empty buffer for frames of `len` bytes.
    pub fn new(len: usize) -> Self {
        debug_assert!(len > 0, "frame length must be positive");
        Self {
            buf: vec![0u8; len].into_boxed_slice(),
            state: FrameState::Filling { filled: 0 },
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// True when no bytes of a frame are held and nothing is pending write.
    pub fn is_idle(&self) -> bool {
        self.state == FrameState::Filling { filled: 0 }
    }

    /// Read and echo until the stream would block or a terminal outcome.
    ///
    /// Reads never cross a frame boundary, so pipelined input is handled as
    /// consecutive fill/echo cycles within a single call. While an echo is
    /// pending no further bytes are read; they stay queued in the socket.
    pub fn drive<S: Read + Write>(&mut self, stream: &mut S) -> FrameOutcome {
        let mut frames = 0;

        loop {
            match self.state {
                FrameState::Filling { filled } => match stream.read(&mut self.buf[filled..]) {
                    Ok(0) => {
                        self.state = FrameState::Filling { filled: 0 };
                        return FrameOutcome::PeerClosed;
                    }
                    Ok(n) => {
                        let filled = filled + n;
                        self.state = if filled == self.buf.len() {
                            FrameState::Echoing { written: 0 }
                        } else {
                            FrameState::Filling { filled }
                        };
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Self::pending(frames);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return FrameOutcome::IoError(e),
                },
                FrameState::Echoing { written } => match stream.write(&self.buf[written..]) {
                    Ok(0) => {
                        return FrameOutcome::IoError(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write returned 0",
                        ));
                    }
                    Ok(n) => {
                        let written = written + n;
                        if written == self.buf.len() {
                            self.state = FrameState::Filling { filled: 0 };
                            frames += 1;
                        } else {
                            self.state = FrameState::Echoing { written };
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Self::pending(frames);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return FrameOutcome::IoError(e),
                },
            }
        }
    }

    fn pending(frames: usize) -> FrameOutcome {
        if frames > 0 {
            FrameOutcome::FrameCompleted { frames }
        } else {
            FrameOutcome::NeedMoreData
        }
    }
}
