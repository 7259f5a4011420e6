//! Control-port server
//!
//! A line-oriented server built on the runtime: greeting, optional implicit
//! TLS, one reply per line, `QUIT`, and idle timeouts.

pub mod core;
pub mod session;

pub use self::core::Server;
pub use session::Session;
