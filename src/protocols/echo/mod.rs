//! Plain echo service.
//!
//! Every byte a client sends is written back unchanged until the client
//! closes. Runs on Tokio, one task per connection, independent of the
//! completion reactor.

pub mod handler;

pub use handler::serve;
