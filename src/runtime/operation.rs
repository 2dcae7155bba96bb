//! Asynchronous I/O operations submitted to the reactor.
//!
//! An `Operation` owns its buffer and a caller-defined tag for the whole
//! time it is in flight. The tag is how a completion finds its way back to
//! the endpoint that issued it; nothing is recovered from raw pointers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Handle for a socket owned by the reactor.
///
/// The generation makes a handle to a closed socket unusable even after its
/// slot has been handed to a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId {
    index: usize,
    generation: u64,
}

impl SocketId {
    pub(crate) fn new(index: usize, generation: u64) -> Self {
        Self { index, generation }
    }

    pub(crate) fn next_generation() -> u64 {
        NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Direction of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Recv,
    Send,
}

/// One outstanding receive or send.
pub struct Operation<T> {
    kind: OpKind,
    socket: SocketId,
    buf: Vec<u8>,
    /// Bytes of `buf` already written (send only).
    offset: usize,
    /// Upper bound on bytes handed to a single send.
    chunk: usize,
    tag: T,
}

impl<T> Operation<T> {
    /// Receive of up to `capacity` bytes.
    pub fn recv(socket: SocketId, capacity: usize, tag: T) -> Self {
        let capacity = capacity.max(1);
        Self {
            kind: OpKind::Recv,
            socket,
            buf: vec![0u8; capacity],
            offset: 0,
            chunk: capacity,
            tag,
        }
    }

    /// Send of `data`, at most `chunk` bytes per I/O.
    pub fn send(socket: SocketId, data: Vec<u8>, chunk: usize, tag: T) -> Self {
        Self {
            kind: OpKind::Send,
            socket,
            buf: data,
            offset: 0,
            chunk: chunk.max(1),
            tag,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn socket(&self) -> SocketId {
        self.socket
    }

    pub fn tag(&self) -> &T {
        &self.tag
    }

    /// Destination of the next receive.
    pub(crate) fn recv_buf(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    /// Bytes the next send should write.
    pub(crate) fn send_buf(&self) -> &[u8] {
        let end = self.offset.saturating_add(self.chunk).min(self.buf.len());
        &self.buf[self.offset..end]
    }

    /// Record `n` bytes written by a send completion.
    pub fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.buf.len());
    }

    /// Bytes still to be written.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn is_flushed(&self) -> bool {
        self.remaining() == 0
    }

    /// Consume a receive completion of `n` bytes.
    pub fn into_received(mut self, n: usize) -> (Vec<u8>, T) {
        self.buf.truncate(n);
        (self.buf, self.tag)
    }
}

impl<T> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("socket", &self.socket)
            .field("len", &self.buf.len())
            .field("offset", &self.offset)
            .finish()
    }
}
