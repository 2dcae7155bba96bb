//! Duplex relay session.
//!
//! A session pairs the client-facing socket with the backend-facing one.
//! Each half keeps one receive armed; received bytes are queued as a send on
//! the peer half. Any terminal completion on either half tears the whole
//! session down, and the `TeardownGate` makes sure that happens once.
//!
//! Operations carry a `HalfRef` as their tag. The session is kept alive by
//! the operations in flight and is freed when the last of them completes.

use crate::runtime::{
    Completion, ConnState, OpKind, Operation, Outbound, SocketId, Submit, TeardownGate,
};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, trace};

/// Which end of the session a half faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Backend,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Backend,
            Side::Backend => Side::Client,
        }
    }

    fn index(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Backend => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Backend => write!(f, "backend"),
        }
    }
}

/// One endpoint of a session.
struct Half {
    socket: SocketId,
    outbound: Mutex<Outbound>,
    /// Bytes received on this half and relayed to the peer.
    received: AtomicU64,
}

impl Half {
    fn new(socket: SocketId) -> Self {
        Self {
            socket,
            outbound: Mutex::new(Outbound::new()),
            received: AtomicU64::new(0),
        }
    }

    fn outbound(&self) -> std::sync::MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Operation tag: the owning session and the half the operation runs on.
#[derive(Clone)]
pub struct HalfRef {
    pub session: Arc<Session>,
    pub side: Side,
}

impl fmt::Debug for HalfRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HalfRef({}, {})", self.session.id, self.side)
    }
}

pub struct Session {
    id: u64,
    gate: TeardownGate,
    halves: [Half; 2],
    buffer_size: usize,
}

impl Session {
    pub fn new(id: u64, client: SocketId, backend: SocketId, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            gate: TeardownGate::new(),
            halves: [Half::new(client), Half::new(backend)],
            buffer_size,
        })
    }

    pub fn is_live(&self) -> bool {
        self.gate.is_live()
    }

    pub fn socket(&self, side: Side) -> SocketId {
        self.half(side).socket
    }

    /// Whether `side` currently has a send in flight.
    pub fn state(&self, side: Side) -> ConnState {
        self.half(side).outbound().state()
    }

    fn half(&self, side: Side) -> &Half {
        &self.halves[side.index()]
    }

    fn tag(self: &Arc<Self>, side: Side) -> HalfRef {
        HalfRef {
            session: Arc::clone(self),
            side,
        }
    }

    /// Arm the first receive on both halves.
    pub fn start<S: Submit<HalfRef>>(self: &Arc<Self>, io: &S) {
        for side in [Side::Client, Side::Backend] {
            if let Err(e) = self.arm_recv(io, side) {
                self.fail(io, side, "seed receive failed", &e);
                return;
            }
        }
        trace!(session = self.id, "Session started");
    }

    /// Advance the session for one completed operation.
    pub fn complete<S: Submit<HalfRef>>(io: &S, completion: Completion<HalfRef>) {
        let Completion { op, result } = completion;
        let tag = op.tag().clone();
        let session = &tag.session;
        let side = tag.side;

        // Late completions after a teardown only release their buffers
        if !session.is_live() {
            trace!(session = session.id, side = %side, "Discarding completion");
            return;
        }

        match (op.kind(), result) {
            (OpKind::Recv, Ok(0)) => {
                session.teardown(io, &format!("{} closed", side));
            }
            (OpKind::Recv, Ok(n)) => {
                let (data, _) = op.into_received(n);
                session.relay(io, side, data);
            }
            (OpKind::Send, Ok(0)) => {
                let e = io::Error::new(io::ErrorKind::WriteZero, "send wrote zero bytes");
                session.fail(io, side, "send failed", &e);
            }
            (OpKind::Send, Ok(n)) => {
                let mut op = op;
                op.advance(n);
                session.continue_send(io, side, op);
            }
            (kind, Err(e)) => {
                let what = match kind {
                    OpKind::Recv => "receive failed",
                    OpKind::Send => "send failed",
                };
                session.fail(io, side, what, &e);
            }
        }
    }

    /// Queue `data` received on `from` for the peer, then re-arm `from`.
    fn relay<S: Submit<HalfRef>>(self: &Arc<Self>, io: &S, from: Side, data: Vec<u8>) {
        let n = data.len() as u64;
        self.half(from).received.fetch_add(n, Ordering::Relaxed);

        let to = from.peer();
        // Queue before re-arming so relayed chunks keep their order
        let ready = self.half(to).outbound().push(data);
        trace!(session = self.id, from = %from, bytes = n, peer = ?self.state(to), "Relaying");
        if let Some(data) = ready {
            if let Err(e) = self.send_now(io, to, data) {
                self.fail(io, to, "send failed", &e);
                return;
            }
        }

        if let Err(e) = self.arm_recv(io, from) {
            self.fail(io, from, "receive failed", &e);
        }
    }

    /// Resubmit the remainder of a partial send, or start the next queued one.
    fn continue_send<S: Submit<HalfRef>>(self: &Arc<Self>, io: &S, side: Side, op: Operation<HalfRef>) {
        let submitted = if op.is_flushed() {
            drop(op);
            let next = self.half(side).outbound().complete();
            match next {
                Some(data) => self.send_now(io, side, data),
                None => Ok(()),
            }
        } else {
            trace!(session = self.id, side = %side, remaining = op.remaining(), "Partial send");
            io.submit(op)
        };

        if let Err(e) = submitted {
            self.fail(io, side, "send failed", &e);
        }
    }

    fn arm_recv<S: Submit<HalfRef>>(self: &Arc<Self>, io: &S, side: Side) -> io::Result<()> {
        io.submit_recv(self.socket(side), self.buffer_size, self.tag(side))
    }

    fn send_now<S: Submit<HalfRef>>(self: &Arc<Self>, io: &S, side: Side, data: Vec<u8>) -> io::Result<()> {
        io.submit_send(self.socket(side), data, self.buffer_size, self.tag(side))
    }

    fn fail<S: Submit<HalfRef>>(&self, io: &S, side: Side, what: &str, error: &io::Error) {
        debug!(session = self.id, side = %side, error = %error, "{}", what);
        self.teardown(io, &format!("{} {}: {}", side, what, error));
    }

    /// Close both sockets. Only the first caller does anything; returns
    /// whether this call performed the teardown.
    pub fn teardown<S: Submit<HalfRef>>(&self, io: &S, cause: &str) -> bool {
        if !self.gate.claim() {
            return false;
        }

        for half in &self.halves {
            half.outbound().clear();
            io.close(half.socket);
        }

        info!(
            session = self.id,
            cause,
            client_bytes = self.half(Side::Client).received.load(Ordering::Relaxed),
            backend_bytes = self.half(Side::Backend).received.load(Ordering::Relaxed),
            "Session closed"
        );
        true
    }
}
