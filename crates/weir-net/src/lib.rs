//! HTTP plumbing for weir: URL splitting, single-socket keep-alive HTTP/1.1
//! connections (plain and TLS), and the per-host connection pool that
//! multiplexes them.

mod connection;
mod error;
mod pool;
mod url;

pub use connection::{Connection, Response};
pub use error::{NetError, NetResult};
pub use pool::Pool;
pub use url::{ParsedUrl, Scheme, parse_url};
