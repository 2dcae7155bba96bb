//! mio-based backend.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS), exposed
//! through the same completion interface as io_uring.

mod event_loop;

pub use event_loop::MioReactor;
