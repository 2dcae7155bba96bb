//! Accept loop.
//!
//! Runs on the thread that called `Server::run`. The listener is polled with
//! a timeout so a shutdown request is noticed even when no client arrives.
//! Readiness is edge-triggered, so the backlog is drained on every wake,
//! timeouts included; a drain cut short by a resource error (EMFILE) is
//! picked up again on the next one.

use crate::runtime::{Handler, Reactor};
use crate::signal::Shutdown;
use ::mio::unix::SourceFd;
use ::mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(0);

/// Listening socket plus its poller.
pub struct Acceptor {
    listener: TcpListener,
    poll: Poll,
    poll_timeout: Duration,
}

impl Acceptor {
    pub fn bind(addr: SocketAddr, poll_timeout: Duration) -> io::Result<Self> {
        let listener = create_listener(addr)?;
        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&listener.as_raw_fd()),
            LISTENER_TOKEN,
            Interest::READABLE,
        )?;

        Ok(Self {
            listener,
            poll,
            poll_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until `shutdown` is requested.
    pub fn run<H: Handler>(
        &mut self,
        reactor: &Reactor<H::Tag>,
        handler: &H,
        shutdown: &Shutdown,
    ) -> io::Result<()> {
        let mut events = Events::with_capacity(16);
        info!(addr = %self.local_addr()?, "Accepting connections");

        while !shutdown.is_requested() {
            if let Err(e) = self.poll.poll(&mut events, Some(self.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            self.accept_ready(reactor, handler, shutdown);
        }

        debug!("Accept loop stopped");
        Ok(())
    }

    /// Drain the backlog.
    fn accept_ready<H: Handler>(&self, reactor: &Reactor<H::Tag>, handler: &H, shutdown: &Shutdown) {
        loop {
            if shutdown.is_requested() {
                return;
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    handler.on_accept(reactor, stream, peer);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // The client gave up while queued; the rest of the backlog is fine
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    debug!(error = %e, "Client dropped before accept");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed, retrying on next poll");
                    return;
                }
            }
        }
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeType;
    use crate::runtime::Completion;
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// Counts accepted clients and stops the loop after the first one.
    struct StopOnAccept {
        accepted: AtomicUsize,
        shutdown: Shutdown,
    }

    impl Handler for StopOnAccept {
        type Tag = ();

        fn on_accept(&self, _reactor: &Reactor<()>, _stream: TcpStream, _peer: SocketAddr) {
            self.accepted.fetch_add(1, Ordering::SeqCst);
            self.shutdown.request();
        }

        fn on_complete(&self, _reactor: &Reactor<()>, _completion: Completion<()>) {}
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), Duration::from_millis(10))
            .unwrap();
        let addr = acceptor.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_bind_conflict_fails() {
        let first = Acceptor::bind("127.0.0.1:0".parse().unwrap(), Duration::from_millis(10))
            .unwrap();
        let addr = first.local_addr().unwrap();
        assert!(Acceptor::bind(addr, Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_backlog_drained_without_new_readiness() {
        let mut acceptor =
            Acceptor::bind("127.0.0.1:0".parse().unwrap(), Duration::from_millis(20)).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();

        // Use up the readiness edge, as a drain that stopped on an error would
        let mut events = Events::with_capacity(4);
        acceptor
            .poll
            .poll(&mut events, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(!events.is_empty());

        let shutdown = Shutdown::new();
        let handler = StopOnAccept {
            accepted: AtomicUsize::new(0),
            shutdown: shutdown.clone(),
        };
        let reactor = Reactor::new(RuntimeType::Mio, 64).unwrap();

        let watchdog = {
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_secs(5));
                shutdown.request();
            })
        };
        acceptor.run(&reactor, &handler, &shutdown).unwrap();

        // Picked up by a timed-out poll, not by the watchdog
        assert_eq!(handler.accepted.load(Ordering::SeqCst), 1);
        drop(watchdog);
    }
}
