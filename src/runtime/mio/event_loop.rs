//! mio event loop implementation.
//!
//! Readiness-based model turned into completions: a driver thread owns the
//! `Poll` (epoll on Linux, kqueue on macOS) and, when a socket becomes ready,
//! performs the operation parked on it and queues the result. Submissions are
//! attempted immediately and only parked if they would block.
//!
//! Every worker blocks on the same completion queue, so any worker can be
//! handed any completion.

use crate::runtime::{lock, Completion, Event, OpKind, Operation, SocketId};
use ::mio::net::TcpStream;
use ::mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// A registered socket and the operations parked on it.
struct Source<T> {
    stream: TcpStream,
    generation: u64,
    recv: Option<Operation<T>>,
    send: Option<Operation<T>>,
}

impl<T> Source<T> {
    fn slot(&mut self, kind: OpKind) -> &mut Option<Operation<T>> {
        match kind {
            OpKind::Recv => &mut self.recv,
            OpKind::Send => &mut self.send,
        }
    }

    /// Retry the parked operation of `kind`, moving it to `completed` once
    /// the syscall no longer would block.
    fn retry(&mut self, kind: OpKind, completed: &mut Vec<Event<T>>) {
        let Some(mut op) = self.slot(kind).take() else {
            return;
        };
        match perform(&mut self.stream, &mut op) {
            Some(result) => completed.push(Event::Completed(Completion { op, result })),
            None => *self.slot(kind) = Some(op),
        }
    }
}

/// State shared between the driver thread and the workers.
struct Shared<T> {
    registry: Registry,
    waker: Waker,
    sources: Mutex<Slab<Source<T>>>,
    queue: Mutex<VecDeque<Event<T>>>,
    ready: Condvar,
    closing: AtomicBool,
    stopped: AtomicBool,
}

impl<T> Shared<T> {
    fn deliver(&self, events: Vec<Event<T>>) {
        if events.is_empty() {
            return;
        }
        let count = events.len();
        lock(&self.queue).extend(events);
        if count == 1 {
            self.ready.notify_one();
        } else {
            self.ready.notify_all();
        }
    }
}

/// Completion reactor over mio readiness.
pub struct MioReactor<T> {
    shared: Arc<Shared<T>>,
    driver: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> MioReactor<T> {
    /// Create the poller and start its driver thread.
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(Shared {
            registry,
            waker,
            sources: Mutex::new(Slab::new()),
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            closing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });

        let driver_shared = Arc::clone(&shared);
        let driver = thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || {
                if let Err(e) = drive(poll, event_capacity, &driver_shared) {
                    error!(error = %e, "Reactor driver failed");
                }
                driver_shared.stopped.store(true, Ordering::Release);
                driver_shared.ready.notify_all();
            })?;

        Ok(Self {
            shared,
            driver: Some(driver),
        })
    }
}

impl<T> MioReactor<T> {
    pub fn register(&self, stream: std::net::TcpStream) -> io::Result<SocketId> {
        stream.set_nonblocking(true)?;
        let mut stream = TcpStream::from_std(stream);
        let generation = SocketId::next_generation();

        let mut sources = lock(&self.shared.sources);
        let entry = sources.vacant_entry();
        let index = entry.key();
        self.shared.registry.register(
            &mut stream,
            Token(index),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        entry.insert(Source {
            stream,
            generation,
            recv: None,
            send: None,
        });

        Ok(SocketId::new(index, generation))
    }

    pub fn submit(&self, mut op: Operation<T>) -> io::Result<()> {
        let socket = op.socket();
        let kind = op.kind();

        let mut sources = lock(&self.shared.sources);
        let source = match sources.get_mut(socket.index()) {
            Some(source) if source.generation == socket.generation() => source,
            _ => return Err(not_registered()),
        };
        if source.slot(kind).is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "operation already pending on socket",
            ));
        }

        match perform(&mut source.stream, &mut op) {
            None => {
                trace!(socket = %socket, ?kind, "Operation parked");
                *source.slot(kind) = Some(op);
            }
            Some(result) => {
                drop(sources);
                self.shared
                    .deliver(vec![Event::Completed(Completion { op, result })]);
            }
        }
        Ok(())
    }

    /// Shut the socket down and release it. Parked operations complete
    /// with `ConnectionAborted`.
    pub fn close(&self, socket: SocketId) {
        let mut aborted = Vec::new();
        {
            let mut sources = lock(&self.shared.sources);
            let live = matches!(
                sources.get(socket.index()),
                Some(source) if source.generation == socket.generation()
            );
            if !live {
                return;
            }

            let mut source = sources.remove(socket.index());
            let _ = self.shared.registry.deregister(&mut source.stream);
            let _ = source.stream.shutdown(Shutdown::Both);
            for op in [source.recv.take(), source.send.take()].into_iter().flatten() {
                aborted.push(Event::Completed(Completion {
                    op,
                    result: Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "socket closed",
                    )),
                }));
            }
            debug!(socket = %socket, "Socket closed");
        }
        self.shared.deliver(aborted);
    }

    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Option<Event<T>>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = lock(&self.shared.queue);

        loop {
            if let Some(event) = queue.pop_front() {
                return Ok(Some(event));
            }
            if self.shared.stopped.load(Ordering::Acquire) {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "reactor driver stopped",
                ));
            }

            queue = match deadline {
                None => self
                    .shared
                    .ready
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.shared
                        .ready
                        .wait_timeout(queue, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    pub fn wake(&self) {
        self.shared.deliver(vec![Event::Wake]);
    }
}

impl<T> Drop for MioReactor<T> {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::Release);
        let _ = self.shared.waker.wake();
        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
    }
}

fn drive<T>(mut poll: Poll, capacity: usize, shared: &Shared<T>) -> io::Result<()> {
    let mut events = Events::with_capacity(capacity);
    debug!("Reactor driver started");

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        let mut completed = Vec::new();
        {
            let mut sources = lock(&shared.sources);
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                // Tokens of removed sources may still be in this batch
                let Some(source) = sources.get_mut(event.token().0) else {
                    continue;
                };
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    source.retry(OpKind::Recv, &mut completed);
                }
                if event.is_writable() || event.is_write_closed() || event.is_error() {
                    source.retry(OpKind::Send, &mut completed);
                }
            }
        }

        if shared.closing.load(Ordering::Acquire) {
            debug!("Reactor driver stopping");
            return Ok(());
        }
        shared.deliver(completed);
    }
}

/// Run the syscall for `op`. `None` means it would block.
fn perform<T>(stream: &mut TcpStream, op: &mut Operation<T>) -> Option<io::Result<usize>> {
    loop {
        let result = match op.kind() {
            OpKind::Recv => stream.read(op.recv_buf()),
            OpKind::Send => stream.write(op.send_buf()),
        };
        match result {
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return None,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return Some(other),
        }
    }
}

fn not_registered() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket is not registered")
}
