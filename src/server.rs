//! Server bootstrap.
//!
//! Reactor modes share one shape: the acceptor runs on the calling thread,
//! a worker pool drains the reactor, and on shutdown the workers are woken
//! and joined before the reactor (and with it every socket) is released.

use crate::config::{Config, Mode};
use crate::protocols::echo;
use crate::protocols::framed::FramedEcho;
use crate::protocols::http::{customer_router, HttpService, Routes};
use crate::protocols::proxy::ProxyHandler;
use crate::protocols::stream::ServiceHandler;
use crate::runtime::{Acceptor, Handler, Reactor, WorkerPool};
use crate::signal::Shutdown;
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct Server<H: Handler> {
    acceptor: Acceptor,
    reactor: Arc<Reactor<H::Tag>>,
    handler: Arc<H>,
    shutdown: Shutdown,
    workers: usize,
    poll_timeout: Duration,
}

impl<H: Handler> Server<H> {
    /// Create the reactor and bind the listener. Failures here are fatal.
    pub fn bind(config: &Config, handler: H, shutdown: Shutdown) -> io::Result<Self> {
        let reactor = Reactor::new(config.runtime, config.ring_size)?;
        let acceptor = Acceptor::bind(config.listen, config.poll_timeout)?;

        Ok(Self {
            acceptor,
            reactor: Arc::new(reactor),
            handler: Arc::new(handler),
            shutdown,
            workers: config.workers,
            poll_timeout: config.poll_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Serve until shutdown is requested.
    pub fn run(mut self) -> io::Result<()> {
        let pool = WorkerPool::spawn(
            self.workers,
            Arc::clone(&self.reactor),
            Arc::clone(&self.handler),
            self.shutdown.clone(),
            self.poll_timeout,
        )?;
        info!(workers = pool.len(), "Worker pool started");

        let result = self
            .acceptor
            .run(&self.reactor, &*self.handler, &self.shutdown);

        info!("Stopping workers");
        self.shutdown.request();
        pool.shutdown(&self.reactor);

        // Last reference: closes every socket still registered
        drop(self.reactor);
        info!("Server stopped");
        result
    }
}

/// Run the configured mode until shutdown.
pub fn run(config: Config, shutdown: Shutdown) -> Result<(), Box<dyn Error>> {
    match config.mode {
        Mode::Proxy => {
            let handler =
                ProxyHandler::new(config.backend, config.connect_timeout, config.buffer_size);
            Server::bind(&config, handler, shutdown)?.run()?;
        }
        Mode::FramedEcho => {
            let handler = ServiceHandler::new(FramedEcho, config.buffer_size);
            Server::bind(&config, handler, shutdown)?.run()?;
        }
        Mode::Http => {
            let routes = Routes::new().include(customer_router()?);
            let handler = ServiceHandler::new(HttpService::new(routes), config.buffer_size);
            Server::bind(&config, handler, shutdown)?.run()?;
        }
        Mode::Echo => run_echo(&config, shutdown)?,
    }
    Ok(())
}

fn run_echo(config: &Config, shutdown: Shutdown) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(config.listen).await?;
        echo::serve(listener, shutdown, config.poll_timeout, config.buffer_size).await
    })
}
