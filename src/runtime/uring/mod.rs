//! Linux io_uring backend.
//!
//! Completion-based I/O: receives and sends are handed to the kernel and
//! their results come back on the completion queue.

mod event_loop;

pub use event_loop::UringReactor;
