//! io_uring event loop for Linux.
//!
//! Completion-based model: one ring is shared by every worker. Submissions
//! push an SQE under the submission lock and enter the kernel; workers block
//! in `io_uring_enter` and each takes one CQE at a time under the completion
//! lock, so a completion is handed to exactly one worker.

use crate::runtime::token::{TokenTable, WAKE_TOKEN};
use crate::runtime::{lock, Completion, Event, OpKind, Operation, SocketId};
use io_uring::{opcode, squeue, types, IoUring};
use slab::Slab;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct Source {
    stream: TcpStream,
    generation: u64,
    recv_pending: bool,
    send_pending: bool,
}

impl Source {
    fn pending(&mut self, kind: OpKind) -> &mut bool {
        match kind {
            OpKind::Recv => &mut self.recv_pending,
            OpKind::Send => &mut self.send_pending,
        }
    }
}

/// Completion reactor over a shared io_uring instance.
pub struct UringReactor<T> {
    // Dropped first: the kernel must be done with the buffers in `ops`.
    ring: IoUring,
    sq_lock: Mutex<()>,
    cq_lock: Mutex<()>,
    sources: Mutex<Slab<Source>>,
    ops: Mutex<TokenTable<T>>,
}

impl<T> UringReactor<T> {
    pub fn new(ring_size: u32) -> io::Result<Self> {
        let ring = IoUring::new(ring_size)?;
        // Timed waits need IORING_FEAT_EXT_ARG (Linux 5.11+)
        if !ring.params().is_feature_ext_arg() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "io_uring lacks timed waits (IORING_FEAT_EXT_ARG)",
            ));
        }
        debug!(ring_size, "io_uring instance created");

        Ok(Self {
            ring,
            sq_lock: Mutex::new(()),
            cq_lock: Mutex::new(()),
            sources: Mutex::new(Slab::new()),
            ops: Mutex::new(TokenTable::new(ring_size as usize)),
        })
    }

    pub fn register(&self, stream: TcpStream) -> io::Result<SocketId> {
        // The ring performs blocking-style I/O; readiness is its problem.
        stream.set_nonblocking(false)?;
        let generation = SocketId::next_generation();
        let index = lock(&self.sources).insert(Source {
            stream,
            generation,
            recv_pending: false,
            send_pending: false,
        });
        Ok(SocketId::new(index, generation))
    }

    pub fn submit(&self, mut op: Operation<T>) -> io::Result<()> {
        let socket = op.socket();
        let kind = op.kind();

        let mut sources = lock(&self.sources);
        let source = match sources.get_mut(socket.index()) {
            Some(source) if source.generation == socket.generation() => source,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "socket is not registered",
                ))
            }
        };
        if *source.pending(kind) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "operation already pending on socket",
            ));
        }

        let fd = types::Fd(source.stream.as_raw_fd());
        // The heap buffer stays put when the operation moves into the table.
        let (ptr, len) = match kind {
            OpKind::Recv => {
                let buf = op.recv_buf();
                (buf.as_mut_ptr(), buf.len())
            }
            OpKind::Send => {
                let buf = op.send_buf();
                (buf.as_ptr() as *mut u8, buf.len())
            }
        };
        let len = u32::try_from(len).unwrap_or(u32::MAX);

        let mut ops = lock(&self.ops);
        let token = ops.insert(op);
        let entry = match kind {
            OpKind::Recv => opcode::Recv::new(fd, ptr, len).build(),
            OpKind::Send => opcode::Send::new(fd, ptr as *const u8, len)
                .flags(libc::MSG_NOSIGNAL)
                .build(),
        }
        .user_data(token);

        if let Err(e) = self.push(&entry) {
            ops.remove(token);
            return Err(e);
        }
        *source.pending(kind) = true;
        Ok(())
    }

    /// Shut the socket down and release it. In-flight operations complete
    /// with end-of-stream or an error.
    pub fn close(&self, socket: SocketId) {
        let mut sources = lock(&self.sources);
        let live = matches!(
            sources.get(socket.index()),
            Some(source) if source.generation == socket.generation()
        );
        if !live {
            return;
        }
        let source = sources.remove(socket.index());
        let _ = source.stream.shutdown(Shutdown::Both);
        debug!(socket = %socket, "Socket closed");
    }

    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Option<Event<T>>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(event) = self.reap() {
                return Ok(Some(event));
            }

            let waited = match deadline {
                None => self.ring.submit_and_wait(1),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    let wait = deadline - now;
                    let ts = types::Timespec::new()
                        .sec(wait.as_secs())
                        .nsec(wait.subsec_nanos());
                    let args = types::SubmitArgs::new().timespec(&ts);
                    self.ring.submitter().submit_with_args(1, &args)
                }
            };

            match waited {
                Ok(_) => {}
                Err(e) => match e.raw_os_error() {
                    Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) => {}
                    _ => return Err(e),
                },
            }
        }
    }

    pub fn wake(&self) {
        let entry = opcode::Nop::new().build().user_data(WAKE_TOKEN);
        if let Err(e) = self.push(&entry) {
            warn!(error = %e, "Failed to post wake-up");
        }
    }

    /// Take one completion off the ring.
    fn reap(&self) -> Option<Event<T>> {
        loop {
            let cqe = {
                let _guard = lock(&self.cq_lock);
                // SAFETY: completion queue access is serialized by `cq_lock`.
                let mut cq = unsafe { self.ring.completion_shared() };
                cq.next()
            }?;

            let token = cqe.user_data();
            if token == WAKE_TOKEN {
                return Some(Event::Wake);
            }

            let Some(op) = lock(&self.ops).remove(token) else {
                warn!(token, "Unknown token in completion");
                continue;
            };

            let socket = op.socket();
            if let Some(source) = lock(&self.sources).get_mut(socket.index()) {
                if source.generation == socket.generation() {
                    *source.pending(op.kind()) = false;
                }
            }

            let result = match cqe.result() {
                r if r < 0 => Err(io::Error::from_raw_os_error(-r)),
                r => Ok(r as usize),
            };
            return Some(Event::Completed(Completion { op, result }));
        }
    }

    fn push(&self, entry: &squeue::Entry) -> io::Result<()> {
        {
            let _guard = lock(&self.sq_lock);
            loop {
                // SAFETY: submission queue access is serialized by `sq_lock`,
                // and the entry's buffer is owned by the token table until
                // its completion is reaped.
                let pushed = unsafe { self.ring.submission_shared().push(entry) };
                if pushed.is_ok() {
                    break;
                }
                // Queue full; hand what we have to the kernel and retry
                self.ring.submit()?;
            }
        }
        self.ring.submit()?;
        Ok(())
    }
}

impl<T> Drop for UringReactor<T> {
    fn drop(&mut self) {
        for (_, source) in lock(&self.sources).iter() {
            let _ = source.stream.shutdown(Shutdown::Both);
        }
        let in_flight = lock(&self.ops).len();
        if in_flight > 0 {
            debug!(in_flight, "Dropping ring with operations in flight");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn reactor() -> Option<UringReactor<u32>> {
        match UringReactor::new(64) {
            Ok(reactor) => Some(reactor),
            Err(e) => {
                eprintln!("io_uring unavailable, skipping: {}", e);
                None
            }
        }
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn next_completion(reactor: &UringReactor<u32>) -> Completion<u32> {
        match reactor.poll(Some(Duration::from_secs(5))) {
            Ok(Some(Event::Completed(completion))) => completion,
            Ok(_) => panic!("expected a completion"),
            Err(e) => panic!("poll failed: {}", e),
        }
    }

    #[test]
    fn test_recv_and_send() {
        let Some(reactor) = reactor() else { return };
        let (mut peer, local) = socket_pair();
        let socket = reactor.register(local).unwrap();

        reactor.submit(Operation::recv(socket, 64, 1)).unwrap();
        peer.write_all(b"ping").unwrap();
        let completion = next_completion(&reactor);
        assert_eq!(*completion.op.tag(), 1);
        let n = completion.result.unwrap();
        let (data, _) = completion.op.into_received(n);
        assert_eq!(data, b"ping");

        reactor
            .submit(Operation::send(socket, b"pong".to_vec(), 4096, 2))
            .unwrap();
        let completion = next_completion(&reactor);
        assert_eq!(completion.result.unwrap(), 4);
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_close_completes_pending_recv() {
        let Some(reactor) = reactor() else { return };
        let (_peer, local) = socket_pair();
        let socket = reactor.register(local).unwrap();

        reactor.submit(Operation::recv(socket, 64, 5)).unwrap();
        let err = reactor.submit(Operation::recv(socket, 64, 6)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        reactor.close(socket);
        let completion = next_completion(&reactor);
        assert_eq!(*completion.op.tag(), 5);
        // End of stream or cancellation, never data
        assert!(!matches!(completion.result, Ok(n) if n > 0));

        let err = reactor.submit(Operation::recv(socket, 64, 7)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_new_requires_timed_waits() {
        // Either the ring supports timed waits or creation is refused
        match IoUring::new(8) {
            Ok(ring) if !ring.params().is_feature_ext_arg() => {
                let err = UringReactor::<u32>::new(8).err().unwrap();
                assert_eq!(err.kind(), io::ErrorKind::Unsupported);
            }
            Ok(_) => assert!(UringReactor::<u32>::new(8).is_ok()),
            Err(e) => eprintln!("io_uring unavailable, skipping: {}", e),
        }
    }

    #[test]
    fn test_wake() {
        let Some(reactor) = reactor() else { return };
        reactor.wake();
        match reactor.poll(Some(Duration::from_secs(5))) {
            Ok(Some(Event::Wake)) => {}
            other => panic!("expected wake, got {:?}", other.map(|e| e.is_some())),
        }
    }
}
