//! Byte-for-byte TCP relay to a fixed backend.

mod handler;
mod session;

pub use handler::ProxyHandler;
