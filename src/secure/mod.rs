//! Secure layer
//!
//! Runs a rustls engine over a monitored descriptor and turns every
//! "would block" inside handshake, recv, send and shutdown into a reactor
//! suspension point. Callers talk to the secure channels instead of the
//! socket channels.

pub mod config;
pub mod context;
mod engine;
pub mod state;

pub use context::SecureContext;
pub use state::{Operation, Status, TlsRole, Transfer};

pub const SECURE_READ: &str = "secure-read";
pub const SECURE_WRITE: &str = "secure-write";
pub const SECURE_RESUME_RECV: &str = "secure-resume-recv";
pub const SECURE_RESUME_SEND: &str = "secure-resume-send";
pub const SECURE_CONNECT: &str = "secure-connect";
pub const SECURE_ERROR: &str = "secure-error";
