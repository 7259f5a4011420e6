//! Module `state`
//!
//! The two axes of a secure context's state, the engine role it was set up
//! with, and the result type of its transfers.

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use std::fmt;
use std::sync::Arc;

/// What the TLS engine is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    None,
    WantRead,
    WantWrite,
    Connected,
    Error,
}

/// Which engine call is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operation {
    #[default]
    None,
    Handshake,
    Recv,
    Send,
    Shutdown1,
    Shutdown2,
}

impl Status {
    /// States from which recv and send may be issued.
    pub(crate) fn allows_transfer(self) -> bool {
        matches!(self, Status::WantRead | Status::WantWrite | Status::Connected)
    }
}

/// Outcome of a recv or send that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// `n` bytes moved. Zero from a recv means the peer closed cleanly.
    Done(usize),
    /// Nothing moved yet. Repeat the identical call after the matching
    /// resume signal.
    TryAgain,
}

impl Transfer {
    pub fn is_try_again(&self) -> bool {
        matches!(self, Transfer::TryAgain)
    }
}

/// Which side of the handshake the context plays.
#[derive(Clone)]
pub enum TlsRole {
    Server(Arc<ServerConfig>),
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
}

impl TlsRole {
    pub fn is_client(&self) -> bool {
        matches!(self, TlsRole::Client { .. })
    }
}

impl fmt::Debug for TlsRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsRole::Server(_) => f.write_str("Server"),
            TlsRole::Client { server_name, .. } => {
                f.debug_struct("Client").field("server_name", server_name).finish()
            }
        }
    }
}
