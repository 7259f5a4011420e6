//! Error types
//!
//! Defines domain-specific error types for each subsystem of the runtime.
//! Transient "would block" conditions are not errors and never appear here.

use std::fmt;
use std::io;
use std::os::fd::RawFd;

use crate::secure::{Operation, Status};

/// Collection module errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionError {
    /// The collection was destroyed or has a destroy pending.
    CollectionTornDown,
    /// The collectible was destroyed or has a destroy pending.
    ItemTornDown,
    /// The collection is void and rejects new members.
    Void,
    NotMember,
}

impl fmt::Display for CollectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionError::CollectionTornDown => write!(f, "Collection is torn down"),
            CollectionError::ItemTornDown => write!(f, "Collectible is torn down"),
            CollectionError::Void => write!(f, "Collection is void"),
            CollectionError::NotMember => write!(f, "Collectible is not a member"),
        }
    }
}

impl std::error::Error for CollectionError {}

/// Signal bus errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    BusDestroyed(String),
    Registration(CollectionError),
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::BusDestroyed(name) => write!(f, "Signal bus destroyed: {}", name),
            SignalError::Registration(e) => write!(f, "Signal registration failed: {}", e),
        }
    }
}

impl std::error::Error for SignalError {}

impl From<CollectionError> for SignalError {
    fn from(error: CollectionError) -> Self {
        SignalError::Registration(error)
    }
}

/// Socket reactor errors
#[derive(Debug)]
pub enum ReactorError {
    AlreadyMonitored(RawFd),
    UnknownDescriptor(RawFd),
    ReactorShutdown,
    Signal(SignalError),
    Io(io::Error),
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactorError::AlreadyMonitored(fd) => write!(f, "Descriptor {} is already monitored", fd),
            ReactorError::UnknownDescriptor(fd) => write!(f, "Descriptor {} is not monitored", fd),
            ReactorError::ReactorShutdown => write!(f, "Reactor is shut down"),
            ReactorError::Signal(e) => write!(f, "Signal error: {}", e),
            ReactorError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ReactorError {}

impl From<io::Error> for ReactorError {
    fn from(error: io::Error) -> Self {
        ReactorError::Io(error)
    }
}

impl From<SignalError> for ReactorError {
    fn from(error: SignalError) -> Self {
        ReactorError::Signal(error)
    }
}

impl From<CollectionError> for ReactorError {
    fn from(error: CollectionError) -> Self {
        ReactorError::Signal(SignalError::Registration(error))
    }
}

/// Secure layer errors
#[derive(Debug)]
pub enum SecureError {
    /// `setup` was never called, or the engine was already released.
    NotConfigured,
    /// `connect` was never called.
    NotAttached,
    ContextDestroyed,
    /// A call was made outside the valid status/operation pairing.
    InvalidState { status: Status, operation: Operation },
    Tls(rustls::Error),
    Certificate(String),
    PeerClosed,
    Reactor(ReactorError),
    Io(io::Error),
}

impl fmt::Display for SecureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecureError::NotConfigured => write!(f, "Secure context has no TLS engine"),
            SecureError::NotAttached => write!(f, "Secure context is not attached to a socket"),
            SecureError::ContextDestroyed => write!(f, "Secure context destroyed"),
            SecureError::InvalidState { status, operation } => {
                write!(f, "Invalid secure state: {:?} during {:?}", status, operation)
            }
            SecureError::Tls(e) => write!(f, "TLS error: {}", e),
            SecureError::Certificate(msg) => write!(f, "Certificate error: {}", msg),
            SecureError::PeerClosed => write!(f, "Peer closed the connection"),
            SecureError::Reactor(e) => write!(f, "Reactor error: {}", e),
            SecureError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for SecureError {}

impl From<rustls::Error> for SecureError {
    fn from(error: rustls::Error) -> Self {
        SecureError::Tls(error)
    }
}

impl From<io::Error> for SecureError {
    fn from(error: io::Error) -> Self {
        SecureError::Io(error)
    }
}

impl From<ReactorError> for SecureError {
    fn from(error: ReactorError) -> Self {
        SecureError::Reactor(error)
    }
}

impl From<SignalError> for SecureError {
    fn from(error: SignalError) -> Self {
        SecureError::Reactor(ReactorError::Signal(error))
    }
}

/// General runtime error that encompasses all error types
#[derive(Debug)]
pub enum RuntimeError {
    Collection(CollectionError),
    Signal(SignalError),
    Reactor(ReactorError),
    Secure(SecureError),
    Config(config::ConfigError),
    IoError(io::Error),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Collection(e) => write!(f, "Collection error: {}", e),
            RuntimeError::Signal(e) => write!(f, "Signal error: {}", e),
            RuntimeError::Reactor(e) => write!(f, "Reactor error: {}", e),
            RuntimeError::Secure(e) => write!(f, "Secure error: {}", e),
            RuntimeError::Config(e) => write!(f, "Configuration error: {}", e),
            RuntimeError::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<CollectionError> for RuntimeError {
    fn from(error: CollectionError) -> Self {
        RuntimeError::Collection(error)
    }
}

impl From<SignalError> for RuntimeError {
    fn from(error: SignalError) -> Self {
        RuntimeError::Signal(error)
    }
}

impl From<ReactorError> for RuntimeError {
    fn from(error: ReactorError) -> Self {
        RuntimeError::Reactor(error)
    }
}

impl From<SecureError> for RuntimeError {
    fn from(error: SecureError) -> Self {
        RuntimeError::Secure(error)
    }
}

impl From<config::ConfigError> for RuntimeError {
    fn from(error: config::ConfigError) -> Self {
        RuntimeError::Config(error)
    }
}

impl From<io::Error> for RuntimeError {
    fn from(error: io::Error) -> Self {
        RuntimeError::IoError(error)
    }
}
