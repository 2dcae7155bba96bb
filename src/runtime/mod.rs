//! Completion-driven runtime.
//!
//! Platform-specific backends behind one facade:
//! - mio: readiness (epoll/kqueue) turned into completions by a driver thread
//! - io_uring (Linux): native completions from a shared ring
//!
//! Both share common abstractions:
//! - `Operation`: a receive or send that owns its buffer and tag
//! - `SocketId`: generation-checked handle to a reactor-owned socket
//! - `Handler`: what the acceptor and the workers call into

mod acceptor;
mod connection;
mod mio;
mod operation;
mod worker;

#[cfg(target_os = "linux")]
mod token;
#[cfg(target_os = "linux")]
mod uring;

pub use acceptor::Acceptor;
pub use connection::{ConnState, Outbound, TeardownGate};
pub use operation::{OpKind, Operation, SocketId};
pub use worker::WorkerPool;

use crate::config::RuntimeType;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Result of one finished operation.
pub struct Completion<T> {
    pub op: Operation<T>,
    /// Bytes transferred, or the I/O error.
    pub result: io::Result<usize>,
}

/// What a worker gets back from `Reactor::poll`.
pub enum Event<T> {
    Completed(Completion<T>),
    /// A wake-up token posted by `Reactor::wake`.
    Wake,
}

/// The completion port. Shared by the acceptor and every worker.
pub enum Reactor<T> {
    Mio(mio::MioReactor<T>),
    #[cfg(target_os = "linux")]
    Uring(uring::UringReactor<T>),
}

impl<T: Send + 'static> Reactor<T> {
    pub fn new(runtime: RuntimeType, ring_size: u32) -> io::Result<Self> {
        match runtime {
            RuntimeType::Mio => Ok(Reactor::Mio(mio::MioReactor::new(ring_size as usize)?)),
            #[cfg(target_os = "linux")]
            RuntimeType::IoUring => Ok(Reactor::Uring(uring::UringReactor::new(ring_size)?)),
            #[cfg(not(target_os = "linux"))]
            RuntimeType::IoUring => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "io_uring is only available on Linux",
            )),
        }
    }
}

impl<T> Reactor<T> {
    /// Hand a connected socket to the reactor.
    pub fn register(&self, stream: TcpStream) -> io::Result<SocketId> {
        match self {
            Reactor::Mio(r) => r.register(stream),
            #[cfg(target_os = "linux")]
            Reactor::Uring(r) => r.register(stream),
        }
    }

    /// Start an operation. Exactly one completion follows unless this
    /// returns an error.
    pub fn submit(&self, op: Operation<T>) -> io::Result<()> {
        match self {
            Reactor::Mio(r) => r.submit(op),
            #[cfg(target_os = "linux")]
            Reactor::Uring(r) => r.submit(op),
        }
    }

    /// Shut a socket down and release it. Idempotent.
    pub fn close(&self, socket: SocketId) {
        match self {
            Reactor::Mio(r) => r.close(socket),
            #[cfg(target_os = "linux")]
            Reactor::Uring(r) => r.close(socket),
        }
    }

    /// Wait for the next event. `Ok(None)` on timeout.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Option<Event<T>>> {
        match self {
            Reactor::Mio(r) => r.poll(timeout),
            #[cfg(target_os = "linux")]
            Reactor::Uring(r) => r.poll(timeout),
        }
    }

    /// Post one wake-up token; exactly one poller receives it.
    pub fn wake(&self) {
        match self {
            Reactor::Mio(r) => r.wake(),
            #[cfg(target_os = "linux")]
            Reactor::Uring(r) => r.wake(),
        }
    }
}

/// Operation submission, as seen by protocol state machines.
pub trait Submit<T> {
    fn submit(&self, op: Operation<T>) -> io::Result<()>;

    fn close(&self, socket: SocketId);

    fn submit_recv(&self, socket: SocketId, capacity: usize, tag: T) -> io::Result<()> {
        self.submit(Operation::recv(socket, capacity, tag))
    }

    fn submit_send(&self, socket: SocketId, data: Vec<u8>, chunk: usize, tag: T) -> io::Result<()> {
        self.submit(Operation::send(socket, data, chunk, tag))
    }
}

impl<T> Submit<T> for Reactor<T> {
    fn submit(&self, op: Operation<T>) -> io::Result<()> {
        Reactor::submit(self, op)
    }

    fn close(&self, socket: SocketId) {
        Reactor::close(self, socket)
    }
}

/// Protocol logic driven by the runtime.
pub trait Handler: Send + Sync + 'static {
    /// Per-operation tag carried through the reactor.
    type Tag: Send + 'static;

    /// Called on the acceptor thread for every accepted client.
    fn on_accept(&self, reactor: &Reactor<Self::Tag>, stream: TcpStream, peer: SocketAddr);

    /// Called on a worker thread for every completion.
    fn on_complete(&self, reactor: &Reactor<Self::Tag>, completion: Completion<Self::Tag>);
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
