//! Module `monitor`
//!
//! Defines `Monitor`, the reactor's bookkeeping record for one descriptor:
//! its connection state and a private signal bus exposing the five socket
//! channels.

use log::debug;
use std::cell::Cell;
use std::fmt;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::collection::Store;
use crate::error::{ReactorError, SignalError};
use crate::signal::{ChannelRef, Clock, Identity, SignalBus};

pub const SOCKET_CONNECT: &str = "socket-connect";
pub const SOCKET_READ: &str = "socket-read";
pub const SOCKET_WRITE: &str = "socket-write";
pub const SOCKET_CLOSE: &str = "socket-close";
pub const SOCKET_ERROR: &str = "socket-error";

/// Per-descriptor state plus its channels.
pub struct Monitor {
    fd: RawFd,
    listening: bool,
    connected: Cell<bool>,
    dead: Cell<bool>,
    bus: SignalBus,
    connect: ChannelRef,
    read: ChannelRef,
    write: ChannelRef,
    close: ChannelRef,
    error: ChannelRef,
}

impl Monitor {
    pub(crate) fn new(
        fd: RawFd,
        connected: bool,
        listening: bool,
        store: &Rc<Store>,
        clock: Rc<dyn Clock>,
    ) -> Result<Self, ReactorError> {
        let bus = SignalBus::new(&format!("fd-{}", fd), store, clock);
        let channel = |name: &str| {
            bus.get(name, true)
                .ok_or_else(|| ReactorError::Signal(SignalError::BusDestroyed(bus.label().to_string())))
        };
        Ok(Self {
            fd,
            listening,
            // A listening socket never becomes connected.
            connected: Cell::new(connected && !listening),
            dead: Cell::new(false),
            connect: channel(SOCKET_CONNECT)?,
            read: channel(SOCKET_READ)?,
            write: channel(SOCKET_WRITE)?,
            close: channel(SOCKET_CLOSE)?,
            error: channel(SOCKET_ERROR)?,
            bus,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn identity(&self) -> Identity {
        Identity::from_fd(self.fd)
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    /// Connecting sockets that have not completed yet.
    pub fn is_connecting(&self) -> bool {
        !self.listening && !self.connected.get()
    }

    pub fn is_dead(&self) -> bool {
        self.dead.get()
    }

    pub fn bus(&self) -> &SignalBus {
        &self.bus
    }

    /// `poll(2)` interest for the next tick.
    pub(crate) fn interest(&self) -> libc::c_short {
        if self.listening {
            libc::POLLIN
        } else if !self.connected.get() {
            libc::POLLOUT
        } else if self.write.subscribers() > 0 {
            libc::POLLIN | libc::POLLOUT
        } else {
            libc::POLLIN
        }
    }

    pub(crate) fn mark_connected(&self) -> usize {
        if self.listening || self.connected.replace(true) {
            return 0;
        }
        debug!("Descriptor {} connected", self.fd);
        self.connect.raise(self.identity());
        1
    }

    pub(crate) fn raise_connect(&self) -> usize {
        self.connect.raise(self.identity());
        1
    }

    pub(crate) fn raise_read(&self) -> usize {
        self.read.raise(self.identity());
        1
    }

    pub(crate) fn raise_write(&self) -> usize {
        self.write.raise(self.identity());
        1
    }

    /// Terminal: marks the monitor dead and raises `socket-close`.
    pub(crate) fn raise_close(&self) -> usize {
        if self.dead.replace(true) {
            return 0;
        }
        self.close.raise(self.identity());
        1
    }

    /// Terminal: marks the monitor dead and raises `socket-error`.
    pub(crate) fn raise_error(&self) -> usize {
        if self.dead.replace(true) {
            return 0;
        }
        self.error.raise(self.identity());
        1
    }

    pub(crate) fn teardown(&self) {
        self.dead.set(true);
        self.bus.destroy();
        debug!("Monitor for descriptor {} torn down", self.fd);
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("fd", &self.fd)
            .field("listening", &self.listening)
            .field("connected", &self.connected.get())
            .field("dead", &self.dead.get())
            .finish()
    }
}
