//! Socket reactor
//!
//! One monitor per descriptor, readiness through `poll(2)`, and socket
//! events delivered as signals on each monitor's private bus.

pub mod core;
pub mod monitor;
pub mod sys;

pub use self::core::Reactor;
pub use monitor::{
    Monitor, SOCKET_CLOSE, SOCKET_CONNECT, SOCKET_ERROR, SOCKET_READ, SOCKET_WRITE,
};
