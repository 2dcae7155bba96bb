//! Length-prefixed echo protocol.

pub mod codec;
mod handler;

pub use handler::FramedEcho;
