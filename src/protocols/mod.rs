//! Protocol implementations.
//!
//! ## Completion reactor
//! - `proxy`: byte-for-byte relay between a client and the backend
//! - `framed`: length-prefixed echo
//! - `http`: HTTP/1.1 demo with a path router
//!
//! `stream` holds the connection driver shared by `framed` and `http`.
//!
//! ## Tokio
//! - `echo`: plain byte echo, one task per connection

pub mod echo;
pub mod framed;
pub mod http;
pub mod proxy;
pub mod stream;
