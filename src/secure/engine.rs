//! Module `engine`
//!
//! Role-independent wrapper over a rustls client or server connection.

use rustls::{ClientConnection, IoState, ServerConnection};
use std::io::{self, Read, Write};

use crate::error::SecureError;
use crate::reactor::sys::FdStream;
use crate::secure::TlsRole;

pub(crate) enum Engine {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl Engine {
    pub(crate) fn new(role: &TlsRole) -> Result<Self, SecureError> {
        Ok(match role {
            TlsRole::Server(config) => Engine::Server(ServerConnection::new(config.clone())?),
            TlsRole::Client {
                config,
                server_name,
            } => Engine::Client(ClientConnection::new(config.clone(), server_name.clone())?),
        })
    }

    pub(crate) fn read_tls(&mut self, stream: &mut FdStream) -> io::Result<usize> {
        match self {
            Engine::Server(conn) => conn.read_tls(stream),
            Engine::Client(conn) => conn.read_tls(stream),
        }
    }

    pub(crate) fn write_tls(&mut self, stream: &mut FdStream) -> io::Result<usize> {
        match self {
            Engine::Server(conn) => conn.write_tls(stream),
            Engine::Client(conn) => conn.write_tls(stream),
        }
    }

    pub(crate) fn process_new_packets(&mut self) -> Result<IoState, rustls::Error> {
        match self {
            Engine::Server(conn) => conn.process_new_packets(),
            Engine::Client(conn) => conn.process_new_packets(),
        }
    }

    pub(crate) fn wants_write(&self) -> bool {
        match self {
            Engine::Server(conn) => conn.wants_write(),
            Engine::Client(conn) => conn.wants_write(),
        }
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        match self {
            Engine::Server(conn) => conn.is_handshaking(),
            Engine::Client(conn) => conn.is_handshaking(),
        }
    }

    pub(crate) fn send_close_notify(&mut self) {
        match self {
            Engine::Server(conn) => conn.send_close_notify(),
            Engine::Client(conn) => conn.send_close_notify(),
        }
    }

    pub(crate) fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Engine::Server(conn) => conn.reader().read(buf),
            Engine::Client(conn) => conn.reader().read(buf),
        }
    }

    pub(crate) fn write_plaintext(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Engine::Server(conn) => conn.writer().write(buf),
            Engine::Client(conn) => conn.writer().write(buf),
        }
    }

    /// Writes queued TLS records until none are left or the socket is full.
    /// Returns false when output is still pending.
    pub(crate) fn flush(&mut self, stream: &mut FdStream) -> io::Result<bool> {
        while self.wants_write() {
            match self.write_tls(stream) {
                Ok(0) => return Ok(false),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}
