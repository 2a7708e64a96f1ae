//! Connection state machine for managing TCP connections.
//!
//! Each connection owns its socket, an incoming and an outgoing buffer, and
//! three intents that tell the event loop what it is waiting for:
//!
//! - `want_read`: outgoing buffer is empty, poll for readability.
//! - `want_write`: responses are pending, poll for writability.
//! - `want_close`: terminal; the event loop reaps it at the end of the iteration.
//!
//! The read and write handlers keep the invariant that a non-empty outgoing
//! buffer means write interest and an empty one means read interest.

use crate::protocol::{self, FrameLimits};
use crate::runtime::buffer::ByteBuffer;
use crate::runtime::request;
use crate::storage::Storage;
use mio::Interest;
use slab::Slab;
use std::io::{self, Read, Write};
use tracing::{debug, trace};

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    /// Handle in the registry, used for logging.
    id: usize,
    stream: S,
    incoming: ByteBuffer,
    outgoing: ByteBuffer,
    limits: FrameLimits,
    want_read: bool,
    want_write: bool,
    want_close: bool,
    /// Interest currently registered with the poller.
    registered: Interest,
}

impl<S: Read + Write> Connection<S> {
    /// Create a new connection waiting for its first request.
    pub fn new(id: usize, stream: S, limits: FrameLimits) -> Self {
        Self {
            id,
            stream,
            incoming: ByteBuffer::new(),
            outgoing: ByteBuffer::new(),
            limits,
            want_read: true,
            want_write: false,
            want_close: false,
            registered: Interest::READABLE,
        }
    }

    /// Handle readiness for reading.
    ///
    /// Reads until the socket would block, running every complete request as it
    /// arrives. Stops early once responses back up, leaving the rest of the
    /// input in the socket until the peer drains its side.
    pub fn on_readable(&mut self, storage: &mut Storage, scratch: &mut [u8]) {
        while self.want_read && !self.want_close {
            match self.stream.read(scratch) {
                Ok(0) => {
                    debug!(conn_id = self.id, "Peer closed connection");
                    self.want_close = true;
                }
                Ok(n) => {
                    self.incoming.append(&scratch[..n]);
                    let processed = self.process_incoming(storage);
                    trace!(conn_id = self.id, bytes = n, processed, "Read");

                    if !self.outgoing.is_empty() {
                        // Most sockets are writable right now; skip a poll round trip.
                        self.on_writable();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn_id = self.id, error = %e, "Read error");
                    self.want_close = true;
                }
            }
        }
    }

    /// Handle readiness for writing.
    ///
    /// Writes until the outgoing buffer is empty or the socket would block,
    /// then updates the intents.
    pub fn on_writable(&mut self) {
        while !self.outgoing.is_empty() {
            match self.stream.write(self.outgoing.data()) {
                Ok(0) => {
                    debug!(conn_id = self.id, "Write returned 0");
                    self.want_close = true;
                    return;
                }
                Ok(n) => self.outgoing.consume(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn_id = self.id, error = %e, "Write error");
                    self.want_close = true;
                    return;
                }
            }
        }

        let pending = !self.outgoing.is_empty();
        self.want_write = pending;
        self.want_read = !pending;
    }

    /// Run every complete request in the incoming buffer, in arrival order.
    ///
    /// Returns the number of requests processed. A framing error marks the
    /// connection for closing; already queued responses are kept.
    fn process_incoming(&mut self, storage: &mut Storage) -> usize {
        let mut processed = 0;
        loop {
            match protocol::try_parse_one(&mut self.incoming, &self.limits) {
                Ok(Some(req)) => {
                    let response = request::execute(req, storage);
                    protocol::encode_response(&response, &mut self.outgoing);
                    processed += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(conn_id = self.id, error = %e, "Protocol error");
                    self.want_close = true;
                    break;
                }
            }
        }
        processed
    }
}

impl<S> Connection<S> {
    /// Registry handle.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn want_read(&self) -> bool {
        self.want_read
    }

    pub fn want_write(&self) -> bool {
        self.want_write
    }

    pub fn want_close(&self) -> bool {
        self.want_close
    }

    /// Mark connection for closing.
    pub fn close(&mut self) {
        self.want_close = true;
    }

    /// Interest the poller should hold for this connection, `None` once closing.
    pub fn interest(&self) -> Option<Interest> {
        if self.want_close {
            None
        } else if self.want_write {
            Some(Interest::WRITABLE)
        } else {
            Some(Interest::READABLE)
        }
    }

    /// Interest last registered with the poller.
    pub fn registered(&self) -> Interest {
        self.registered
    }

    /// Record a new registration.
    pub fn set_registered(&mut self, interest: Interest) {
        self.registered = interest;
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn incoming(&self) -> &ByteBuffer {
        &self.incoming
    }

    pub fn outgoing(&self) -> &ByteBuffer {
        &self.outgoing
    }
}

/// Registry of active connections using slab allocation.
///
/// Handles are slab keys. A handle is only reused after `remove`, which the
/// event loop defers to the end of an iteration.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a connection built from its future handle.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert_with(&mut self, build: impl FnOnce(usize) -> Connection<S>) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        let entry = self.connections.vacant_entry();
        let id = entry.key();
        entry.insert(build(id));
        Some(id)
    }

    pub fn get(&self, id: usize) -> Option<&Connection<S>> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Remove and yield every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = Connection<S>> + '_ {
        self.connections.drain()
    }
}
