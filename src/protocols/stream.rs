//! Request/response connections over the completion reactor.
//!
//! A `Service` turns received bytes into replies; `Connection` drives one
//! client socket through receive → service → send, keeping a receive armed
//! while replies drain through the socket's `Outbound` queue.

use crate::runtime::{
    lock, Completion, ConnState, Handler, OpKind, Operation, Outbound, Reactor, SocketId, Submit,
    TeardownGate,
};
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace};

/// What a connection does after handling received data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep receiving.
    Continue,
    /// Stop receiving; close once queued replies are sent.
    Close,
}

/// Protocol logic for a request/response connection.
pub trait Service: Send + Sync + 'static {
    /// Per-connection protocol state.
    type State: Send + 'static;

    fn name(&self) -> &'static str;

    fn open(&self) -> Self::State;

    /// Consume `data` and append any replies to `replies`.
    fn on_data(&self, state: &mut Self::State, data: &[u8], replies: &mut Vec<Vec<u8>>) -> Flow;
}

pub struct Connection<S: Service> {
    id: u64,
    socket: SocketId,
    service: Arc<S>,
    gate: TeardownGate,
    closing: AtomicBool,
    state: Mutex<S::State>,
    outbound: Mutex<Outbound>,
    buffer_size: usize,
}

pub type ConnRef<S> = Arc<Connection<S>>;

impl<S: Service> Connection<S> {
    pub fn new(id: u64, socket: SocketId, service: Arc<S>, buffer_size: usize) -> Arc<Self> {
        let state = service.open();
        Arc::new(Self {
            id,
            socket,
            service,
            gate: TeardownGate::new(),
            closing: AtomicBool::new(false),
            state: Mutex::new(state),
            outbound: Mutex::new(Outbound::new()),
            buffer_size,
        })
    }

    pub fn is_live(&self) -> bool {
        self.gate.is_live()
    }

    pub fn start<I: Submit<ConnRef<S>>>(self: &Arc<Self>, io: &I) {
        if let Err(e) = self.arm_recv(io) {
            self.fail(io, "seed receive failed", &e);
        }
    }

    /// Advance the connection for one completed operation.
    pub fn complete<I: Submit<ConnRef<S>>>(io: &I, completion: Completion<ConnRef<S>>) {
        let Completion { op, result } = completion;
        let conn = Arc::clone(op.tag());

        if !conn.is_live() {
            return;
        }

        match (op.kind(), result) {
            (OpKind::Recv, Ok(0)) => {
                conn.teardown(io, "peer closed");
            }
            (OpKind::Recv, Ok(n)) => {
                let (data, _) = op.into_received(n);
                conn.on_data(io, &data);
            }
            (OpKind::Send, Ok(0)) => {
                let e = io::Error::new(io::ErrorKind::WriteZero, "send wrote zero bytes");
                conn.fail(io, "send failed", &e);
            }
            (OpKind::Send, Ok(n)) => {
                let mut op = op;
                op.advance(n);
                conn.continue_send(io, op);
            }
            (OpKind::Recv, Err(e)) => conn.fail(io, "receive failed", &e),
            (OpKind::Send, Err(e)) => conn.fail(io, "send failed", &e),
        }
    }

    fn on_data<I: Submit<ConnRef<S>>>(self: &Arc<Self>, io: &I, data: &[u8]) {
        trace!(conn = self.id, bytes = data.len(), "Received");

        let mut replies = Vec::new();
        let flow = {
            let mut state = lock(&self.state);
            self.service.on_data(&mut state, data, &mut replies)
        };

        let mut ready = None;
        {
            let mut outbound = lock(&self.outbound);
            for reply in replies {
                if let Some(data) = outbound.push(reply) {
                    ready = Some(data);
                }
            }
        }
        if let Some(data) = ready {
            if let Err(e) = self.send_now(io, data) {
                self.fail(io, "send failed", &e);
                return;
            }
        }

        match flow {
            Flow::Continue => {
                if let Err(e) = self.arm_recv(io) {
                    self.fail(io, "receive failed", &e);
                }
            }
            Flow::Close => {
                self.closing.store(true, Ordering::Release);
                if lock(&self.outbound).state() == ConnState::Receiving {
                    self.teardown(io, "closed by server");
                }
            }
        }
    }

    fn continue_send<I: Submit<ConnRef<S>>>(self: &Arc<Self>, io: &I, op: Operation<ConnRef<S>>) {
        if !op.is_flushed() {
            if let Err(e) = io.submit(op) {
                self.fail(io, "send failed", &e);
            }
            return;
        }
        drop(op);

        let next = lock(&self.outbound).complete();
        match next {
            Some(data) => {
                if let Err(e) = self.send_now(io, data) {
                    self.fail(io, "send failed", &e);
                }
            }
            None => {
                if self.closing.load(Ordering::Acquire) {
                    self.teardown(io, "closed by server");
                }
            }
        }
    }

    fn arm_recv<I: Submit<ConnRef<S>>>(self: &Arc<Self>, io: &I) -> io::Result<()> {
        io.submit_recv(self.socket, self.buffer_size, Arc::clone(self))
    }

    fn send_now<I: Submit<ConnRef<S>>>(self: &Arc<Self>, io: &I, data: Vec<u8>) -> io::Result<()> {
        io.submit_send(self.socket, data, self.buffer_size, Arc::clone(self))
    }

    fn fail<I: Submit<ConnRef<S>>>(&self, io: &I, what: &str, error: &io::Error) {
        debug!(conn = self.id, error = %error, "{}", what);
        self.teardown(io, what);
    }

    pub fn teardown<I: Submit<ConnRef<S>>>(&self, io: &I, cause: &str) -> bool {
        if !self.gate.claim() {
            return false;
        }
        lock(&self.outbound).clear();
        io.close(self.socket);
        info!(conn = self.id, service = self.service.name(), cause, "Connection closed");
        true
    }
}

/// Runtime handler serving a `Service` on every accepted client.
pub struct ServiceHandler<S> {
    service: Arc<S>,
    buffer_size: usize,
    next_conn: AtomicU64,
}

impl<S: Service> ServiceHandler<S> {
    pub fn new(service: S, buffer_size: usize) -> Self {
        Self {
            service: Arc::new(service),
            buffer_size,
            next_conn: AtomicU64::new(1),
        }
    }
}

impl<S: Service> Handler for ServiceHandler<S> {
    type Tag = ConnRef<S>;

    fn on_accept(&self, reactor: &Reactor<ConnRef<S>>, stream: TcpStream, peer: SocketAddr) {
        let socket = match reactor.register(stream) {
            Ok(socket) => socket,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Failed to register socket");
                return;
            }
        };
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        info!(conn = id, peer = %peer, service = self.service.name(), "Connection opened");
        Connection::new(id, socket, Arc::clone(&self.service), self.buffer_size).start(reactor);
    }

    fn on_complete(&self, reactor: &Reactor<ConnRef<S>>, completion: Completion<ConnRef<S>>) {
        Connection::complete(reactor, completion);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records submissions instead of performing them.
    pub(crate) struct Recording<T> {
        pub submitted: Mutex<Vec<Operation<T>>>,
        pub closed: Mutex<Vec<SocketId>>,
    }

    impl<T> Default for Recording<T> {
        fn default() -> Self {
            Self {
                submitted: Mutex::new(Vec::new()),
                closed: Mutex::new(Vec::new()),
            }
        }
    }

    impl<T> Recording<T> {
        pub fn take(&self) -> Vec<Operation<T>> {
            std::mem::take(&mut *self.submitted.lock().unwrap())
        }

        pub fn closed(&self) -> usize {
            self.closed.lock().unwrap().len()
        }
    }

    impl<T> Submit<T> for Recording<T> {
        fn submit(&self, op: Operation<T>) -> io::Result<()> {
            self.submitted.lock().unwrap().push(op);
            Ok(())
        }

        fn close(&self, socket: SocketId) {
            self.closed.lock().unwrap().push(socket);
        }
    }

    pub(crate) fn received<T>(mut op: Operation<T>, data: &[u8]) -> Completion<T> {
        op.recv_buf()[..data.len()].copy_from_slice(data);
        Completion {
            op,
            result: Ok(data.len()),
        }
    }

    /// Replies with the received bytes upper-cased; "quit" closes.
    struct Upper;

    impl Service for Upper {
        type State = usize;

        fn name(&self) -> &'static str {
            "upper"
        }

        fn open(&self) -> usize {
            0
        }

        fn on_data(&self, seen: &mut usize, data: &[u8], replies: &mut Vec<Vec<u8>>) -> Flow {
            *seen += data.len();
            replies.push(data.to_ascii_uppercase());
            if data == b"quit" {
                Flow::Close
            } else {
                Flow::Continue
            }
        }
    }

    fn connection() -> ConnRef<Upper> {
        Connection::new(1, SocketId::new(0, 42), Arc::new(Upper), 8)
    }

    #[test]
    fn test_reply_and_rearm() {
        let io = Recording::default();
        let conn = connection();
        conn.start(&io);
        let mut ops = io.take();
        assert_eq!(ops.len(), 1);

        Connection::complete(&io, received(ops.remove(0), b"abc"));
        let ops = io.take();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind(), OpKind::Send);
        assert_eq!(ops[0].send_buf(), b"ABC");
        assert_eq!(ops[1].kind(), OpKind::Recv);
    }

    #[test]
    fn test_close_after_flush() {
        let io = Recording::default();
        let conn = connection();
        conn.start(&io);
        let mut ops = io.take();

        Connection::complete(&io, received(ops.remove(0), b"quit"));
        let mut ops = io.take();
        // Reply queued, no receive re-armed
        assert_eq!(ops.len(), 1);
        assert!(conn.is_live());

        let send = ops.remove(0);
        Connection::complete(&io, Completion { op: send, result: Ok(4) });
        assert!(!conn.is_live());
        assert_eq!(io.closed(), 1);
    }

    #[test]
    fn test_long_reply_is_chunked() {
        let io = Recording::default();
        let conn = connection();
        conn.start(&io);
        let mut ops = io.take();

        Connection::complete(&io, received(ops.remove(0), b"abcdefgh"));
        let mut ops = io.take();
        let send = ops.remove(0);
        assert_eq!(send.send_buf(), b"ABCDEFGH");

        // Kernel took only part of the chunk
        Connection::complete(&io, Completion { op: send, result: Ok(5) });
        let ops = io.take();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].send_buf(), b"FGH");
    }

    #[test]
    fn test_error_tears_down_once() {
        let io = Recording::default();
        let conn = connection();
        conn.start(&io);
        let mut ops = io.take();

        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        Connection::complete(&io, Completion { op: ops.remove(0), result: Err(err) });
        assert!(!conn.is_live());
        assert!(!conn.teardown(&io, "again"));
        assert_eq!(io.closed(), 1);
        assert!(io.take().is_empty());
    }
}
