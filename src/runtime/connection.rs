//! Connection table for accepted clients.
//!
//! Each connection owns its socket and its frame buffer, so partial frames
//! live exactly as long as the connection does.

use crate::runtime::frame::{FrameBuffer, FrameOutcome, FrameState};
use mio::net::TcpStream;
use slab::Slab;
use std::net::SocketAddr;

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    /// Non-blocking client socket.
    pub stream: TcpStream,
    /// Peer address, kept for logging.
    pub peer: SocketAddr,
    frame: FrameBuffer,
}

impl Connection {
    /// Create a connection with an empty frame of `frame_length` bytes.
    pub fn new(stream: TcpStream, peer: SocketAddr, frame_length: usize) -> Self {
        Self {
            stream,
            peer,
            frame: FrameBuffer::new(frame_length),
        }
    }

    /// Run the frame state machine against this connection's socket.
    pub fn drive(&mut self) -> FrameOutcome {
        self.frame.drive(&mut self.stream)
    }

    pub fn frame_state(&self) -> FrameState {
        self.frame.state()
    }

    /// True when no partial frame or pending echo is held.
    pub fn is_idle(&self) -> bool {
        self.frame.is_idle()
    }
}

/// Registry of active connections using slab allocation.
///
/// Slab keys double as poll tokens, giving O(1) dispatch from an event to
/// its connection.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Result<usize, Connection> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids of connections holding no partial frame.
    pub fn idle_ids(&self) -> Vec<usize> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.is_idle())
            .map(|(id, _)| id)
            .collect()
    }

    /// Ids of every open connection.
    pub fn ids(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }
}
