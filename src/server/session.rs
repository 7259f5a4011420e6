//! Module `session`
//!
//! Defines `Session`, one accepted control connection: its socket, its
//! secure context, and the line buffers between them.

use log::{debug, info, warn};
use std::cell::{Cell, RefCell};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;

use crate::secure::{SecureContext, Transfer};
use crate::signal::{Registration, SignalGroup};

const READ_CHUNK: usize = 4096;
const MAX_LINE: usize = 4096;

pub struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    secure: SecureContext,
    group: SignalGroup,
    inbox: RefCell<Vec<u8>>,
    outbox: RefCell<Vec<u8>>,
    /// Length of the send that returned `TryAgain`, repeated verbatim.
    retry_len: Cell<usize>,
    /// `secure-write` subscription held only while a send is blocked.
    write_wait: RefCell<Option<Registration>>,
    /// `secure-read` subscription carrying the idle timeout.
    idle_watch: RefCell<Option<Registration>>,
    quitting: Cell<bool>,
}

impl Session {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        secure: SecureContext,
        group: SignalGroup,
    ) -> Self {
        Self {
            stream,
            peer,
            secure,
            group,
            inbox: RefCell::new(Vec::new()),
            outbox: RefCell::new(Vec::new()),
            retry_len: Cell::new(0),
            write_wait: RefCell::new(None),
            idle_watch: RefCell::new(None),
            quitting: Cell::new(false),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn secure(&self) -> &SecureContext {
        &self.secure
    }

    pub(crate) fn group(&self) -> &SignalGroup {
        &self.group
    }

    pub(crate) fn set_write_wait(&self, registration: Option<Registration>) {
        let previous = self.write_wait.replace(registration);
        if let Some(previous) = previous {
            previous.delete();
        }
    }

    pub(crate) fn has_write_wait(&self) -> bool {
        self.write_wait.borrow().is_some()
    }

    pub(crate) fn set_idle_watch(&self, registration: Registration) {
        *self.idle_watch.borrow_mut() = Some(registration);
    }

    /// Restarts the idle window. Reads resumed after a `TryAgain` arrive on
    /// `secure-resume-recv`, which does not touch the watched registration.
    pub(crate) fn touch(&self) {
        if let Some(watch) = self.idle_watch.borrow().as_ref() {
            watch.rearm();
        }
    }

    pub(crate) fn is_write_blocked(&self) -> bool {
        self.retry_len.get() > 0
    }

    pub fn reply(&self, code: u16, text: &str) {
        let line = format!("{} {}\r\n", code, text);
        self.outbox.borrow_mut().extend_from_slice(line.as_bytes());
    }

    /// Drains the socket into the inbox and queues a reply for every
    /// complete line. Returns false when the peer is gone.
    pub(crate) fn on_readable(&self) -> bool {
        let mut buf = [0u8; READ_CHUNK];
        while !self.quitting.get() {
            match self.secure.recv(&mut buf) {
                Ok(Transfer::Done(0)) => {
                    info!("Client {} disconnected", self.peer);
                    return false;
                }
                Ok(Transfer::Done(n)) => {
                    self.inbox.borrow_mut().extend_from_slice(&buf[..n]);
                    self.process_lines();
                }
                Ok(Transfer::TryAgain) => break,
                Err(e) => {
                    warn!("Read from {} failed: {}", self.peer, e);
                    return false;
                }
            }
        }
        true
    }

    fn process_lines(&self) {
        loop {
            let line = {
                let mut inbox = self.inbox.borrow_mut();
                let newline = inbox.iter().position(|&b| b == b'\n');
                match newline {
                    Some(end) => {
                        let raw: Vec<u8> = inbox.drain(..=end).collect();
                        String::from_utf8_lossy(&raw).trim_end_matches(['\r', '\n']).to_string()
                    }
                    None => {
                        if inbox.len() > MAX_LINE {
                            inbox.clear();
                            drop(inbox);
                            self.reply(500, "Line too long");
                        }
                        return;
                    }
                }
            };
            debug!("Received from {}: {}", self.peer, line);
            if line.trim().eq_ignore_ascii_case("QUIT") {
                self.reply(221, "Goodbye");
                self.quitting.set(true);
                return;
            }
            self.reply(200, &line);
        }
    }

    /// Sends as much of the outbox as the socket takes. Returns false when
    /// the session should end: a send failed, or QUIT's reply is out.
    pub(crate) fn flush(&self) -> bool {
        loop {
            let len = match self.retry_len.get() {
                0 => self.outbox.borrow().len(),
                blocked => blocked,
            };
            if len == 0 {
                break;
            }
            let chunk = self.outbox.borrow()[..len].to_vec();
            match self.secure.send(&chunk) {
                Ok(Transfer::Done(n)) => {
                    self.outbox.borrow_mut().drain(..n);
                    self.retry_len.set(0);
                }
                Ok(Transfer::TryAgain) => {
                    self.retry_len.set(len);
                    return true;
                }
                Err(e) => {
                    warn!("Write to {} failed: {}", self.peer, e);
                    return false;
                }
            }
        }
        !self.quitting.get()
    }

    /// Sends whatever is queued and tells the peer why it is being dropped.
    pub(crate) fn say_goodbye(&self, code: u16, text: &str) {
        self.reply(code, text);
        self.quitting.set(true);
        self.flush();
    }

    pub(crate) fn teardown(&self) {
        self.set_write_wait(None);
        self.idle_watch.borrow_mut().take();
        self.secure.destroy();
        self.group.destroy();
        info!(
            "Session {} on descriptor {} closed",
            self.peer,
            self.stream.as_raw_fd()
        );
    }
}
