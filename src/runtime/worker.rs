//! Worker threads.
//!
//! Every worker blocks on the shared reactor and hands each completion to
//! the handler. A worker exits when it receives a wake-up token, or when it
//! notices the shutdown flag after a poll timeout.

use crate::runtime::{Event, Handler, Reactor};
use crate::signal::Shutdown;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn<H: Handler>(
        workers: usize,
        reactor: Arc<Reactor<H::Tag>>,
        handler: Arc<H>,
        shutdown: Shutdown,
        poll_timeout: Duration,
    ) -> io::Result<Self> {
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let reactor = Arc::clone(&reactor);
            let handler = Arc::clone(&handler);
            let shutdown = shutdown.clone();

            let handle = thread::Builder::new()
                .name(format!("worker-{}", worker_id))
                .spawn(move || {
                    worker_loop(worker_id, &reactor, &*handler, &shutdown, poll_timeout);
                })?;
            handles.push(handle);
        }

        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Post one wake-up per worker and wait for all of them to exit.
    pub fn shutdown<T>(self, reactor: &Reactor<T>) {
        for _ in 0..self.handles.len() {
            reactor.wake();
        }
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop<H: Handler>(
    worker_id: usize,
    reactor: &Reactor<H::Tag>,
    handler: &H,
    shutdown: &Shutdown,
    poll_timeout: Duration,
) {
    debug!(worker = worker_id, "Worker started");

    loop {
        match reactor.poll(Some(poll_timeout)) {
            Ok(Some(Event::Completed(completion))) => handler.on_complete(reactor, completion),
            Ok(Some(Event::Wake)) => break,
            Ok(None) => {
                if shutdown.is_requested() {
                    break;
                }
            }
            Err(e) => {
                error!(worker = worker_id, error = %e, "Worker poll failed");
                break;
            }
        }
    }

    debug!(worker = worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeType;
    use crate::runtime::Completion;
    use std::net::{SocketAddr, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        completions: AtomicUsize,
    }

    impl Handler for Counting {
        type Tag = ();

        fn on_accept(&self, _reactor: &Reactor<()>, _stream: TcpStream, _peer: SocketAddr) {}

        fn on_complete(&self, _reactor: &Reactor<()>, _completion: Completion<()>) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_workers_exit_on_wake() {
        let reactor = Arc::new(Reactor::new(RuntimeType::Mio, 64).unwrap());
        let handler = Arc::new(Counting {
            completions: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(
            3,
            Arc::clone(&reactor),
            handler,
            Shutdown::new(),
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(pool.len(), 3);

        // Returns only if every worker consumed a wake-up
        pool.shutdown(&reactor);
    }

    #[test]
    fn test_workers_exit_on_shutdown_flag() {
        let reactor = Arc::new(Reactor::new(RuntimeType::Mio, 64).unwrap());
        let handler = Arc::new(Counting {
            completions: AtomicUsize::new(0),
        });
        let shutdown = Shutdown::new();
        let pool = WorkerPool::spawn(
            2,
            Arc::clone(&reactor),
            handler,
            shutdown.clone(),
            Duration::from_millis(20),
        )
        .unwrap();

        shutdown.request();
        for handle in pool.handles {
            handle.join().unwrap();
        }
    }
}
