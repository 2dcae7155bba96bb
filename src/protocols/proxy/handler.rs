//! Relay handler: wires accepted clients to the backend.

use super::session::{HalfRef, Session};
use crate::runtime::{Completion, Handler, Reactor};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

pub struct ProxyHandler {
    backend: SocketAddr,
    connect_timeout: Duration,
    buffer_size: usize,
    next_session: AtomicU64,
}

impl ProxyHandler {
    pub fn new(backend: SocketAddr, connect_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            backend,
            connect_timeout,
            buffer_size,
            next_session: AtomicU64::new(1),
        }
    }
}

impl Handler for ProxyHandler {
    type Tag = HalfRef;

    fn on_accept(&self, reactor: &Reactor<HalfRef>, client: TcpStream, peer: SocketAddr) {
        // Dial failures only cost this client; the accepted socket is dropped
        let backend = match TcpStream::connect_timeout(&self.backend, self.connect_timeout) {
            Ok(backend) => backend,
            Err(e) => {
                warn!(peer = %peer, backend = %self.backend, error = %e, "Backend dial failed");
                return;
            }
        };
        let _ = backend.set_nodelay(true);

        let client = match reactor.register(client) {
            Ok(id) => id,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to register client socket");
                return;
            }
        };
        let backend = match reactor.register(backend) {
            Ok(id) => id,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to register backend socket");
                reactor.close(client);
                return;
            }
        };

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        info!(session = id, peer = %peer, backend = %self.backend, "Session opened");
        Session::new(id, client, backend, self.buffer_size).start(reactor);
    }

    fn on_complete(&self, reactor: &Reactor<HalfRef>, completion: Completion<HalfRef>) {
        Session::complete(reactor, completion);
    }
}
