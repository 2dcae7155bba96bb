//! Minimal HTTP/1.1 demo server: request parser, path router and the
//! `/customers` resource.

mod customers;
mod handler;
pub mod parser;
pub mod response;
pub mod router;

pub use customers::customer_router;
pub use handler::HttpService;
pub use router::Routes;
