//! Module `context`
//!
//! Defines `SecureContext`, the TLS state machine wrapped around one
//! monitored descriptor.
//!
//! The context hooks the descriptor's socket channels and re-raises them as
//! secure channels. While a TLS engine is active, socket readiness is first
//! offered to whatever engine call is suspended: a handshake or shutdown is
//! resumed in place, a suspended recv or send is resumed by raising
//! `secure-resume-recv` or `secure-resume-send` so the caller repeats the
//! identical call.
//!
//! A suspended recv and a suspended send are tracked apart: either side can
//! be retried while the other direction keeps moving. `status` and
//! `operation` report the send first when both are waiting.

use log::{debug, info, warn};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::error::{ReactorError, SecureError};
use crate::reactor::sys::{self, FdStream};
use crate::reactor::{Reactor, SOCKET_CLOSE, SOCKET_CONNECT, SOCKET_ERROR, SOCKET_READ, SOCKET_WRITE};
use crate::secure::engine::Engine;
use crate::secure::{
    Operation, SECURE_CONNECT, SECURE_ERROR, SECURE_READ, SECURE_RESUME_RECV, SECURE_RESUME_SEND,
    SECURE_WRITE, Status, TlsRole, Transfer,
};
use crate::signal::{Identity, Raised, Registration, SignalBus, SignalGroup};

enum Progress {
    /// Suspended until the socket is ready for the given direction.
    Blocked(Status),
    /// Finished. For a handshake, whether plaintext is already buffered.
    Complete(bool),
}

struct SecureInner {
    reactor: Reactor,
    hooks: SignalGroup,
    write_hook: RefCell<Option<Registration>>,
    role: RefCell<Option<TlsRole>>,
    engine: RefCell<Option<Engine>>,
    fd: Cell<Option<RawFd>>,
    status: Cell<Status>,
    operation: Cell<Operation>,
    recv_pending: Cell<bool>,
    send_pending: Cell<bool>,
    valid: Cell<bool>,
}

/// Handle onto one secure context.
#[derive(Clone)]
pub struct SecureContext {
    inner: Rc<SecureInner>,
}

impl SecureContext {
    pub fn new(reactor: &Reactor) -> Self {
        Self {
            inner: Rc::new(SecureInner {
                reactor: reactor.clone(),
                hooks: SignalGroup::new(reactor.store()),
                write_hook: RefCell::new(None),
                role: RefCell::new(None),
                engine: RefCell::new(None),
                fd: Cell::new(None),
                status: Cell::new(Status::None),
                operation: Cell::new(Operation::None),
                recv_pending: Cell::new(false),
                send_pending: Cell::new(false),
                valid: Cell::new(true),
            }),
        }
    }

    pub fn status(&self) -> Status {
        self.inner.status.get()
    }

    pub fn operation(&self) -> Operation {
        self.inner.operation.get()
    }

    /// True while a TLS engine is active on the descriptor.
    pub fn is_secure(&self) -> bool {
        self.inner.engine.borrow().is_some()
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.inner.fd.get()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.valid.get()
    }

    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    /// Chooses the side of the handshake `negotiate` will play.
    pub fn setup(&self, role: TlsRole) -> Result<(), SecureError> {
        self.check_valid()?;
        if self.is_secure() {
            return Err(self.invalid_state());
        }
        debug!("Secure context set up as {:?}", role);
        *self.inner.role.borrow_mut() = Some(role);
        Ok(())
    }

    /// Attaches the context to a descriptor the reactor already monitors.
    /// Traffic passes through in cleartext until `negotiate` is called.
    pub fn connect(&self, fd: RawFd) -> Result<(), SecureError> {
        self.check_valid()?;
        if self.inner.fd.get().is_some() {
            return Err(self.invalid_state());
        }
        self.hook(fd, SOCKET_CONNECT, Self::on_connect)?;
        self.hook(fd, SOCKET_READ, Self::on_read)?;
        self.hook(fd, SOCKET_CLOSE, Self::on_fault)?;
        self.hook(fd, SOCKET_ERROR, Self::on_fault)?;
        self.inner.fd.set(Some(fd));
        self.sync_write_interest();
        debug!("Secure context attached to descriptor {}", fd);
        Ok(())
    }

    /// Starts the TLS handshake, or drives one already in progress.
    ///
    /// Returns true once the handshake is complete. `secure-connect` is
    /// raised at that point whether completion happened here or from a
    /// later readiness signal.
    pub fn negotiate(&self) -> Result<bool, SecureError> {
        let fd = self.attached()?;
        match (self.status(), self.operation()) {
            (_, Operation::Handshake) => return self.advance_handshake(),
            (_, Operation::None | Operation::Recv | Operation::Send)
                if self.is_secure() && self.status().allows_transfer() =>
            {
                return Ok(true);
            }
            (Status::None, Operation::None) if !self.is_secure() => {}
            _ => return Err(self.invalid_state()),
        }

        let role = self.inner.role.borrow().clone();
        let Some(role) = role else {
            return Err(SecureError::NotConfigured);
        };
        let engine = Engine::new(&role)?;
        *self.inner.engine.borrow_mut() = Some(engine);
        self.inner.operation.set(Operation::Handshake);
        // The client speaks first.
        self.inner.status.set(if role.is_client() {
            Status::WantWrite
        } else {
            Status::WantRead
        });
        debug!("TLS handshake on descriptor {} started as {:?}", fd, role);
        self.advance_handshake()
    }

    /// Reads decrypted bytes, or raw bytes when no engine is active.
    ///
    /// After a `Done`, call again until `TryAgain`: the engine may hold more
    /// plaintext than the socket signals. After a `TryAgain`, repeat the
    /// identical call on `secure-resume-recv` (or `secure-read` in cleartext).
    pub fn recv(&self, buf: &mut [u8]) -> Result<Transfer, SecureError> {
        let fd = self.attached()?;
        if !self.is_secure() {
            return passthrough(sys::recv(fd, buf));
        }
        self.check_transfer()?;

        let progress = {
            let mut engine = self.inner.engine.borrow_mut();
            let Some(engine) = engine.as_mut() else {
                return Err(SecureError::NotConfigured);
            };
            recv_step(engine, fd, buf)
        };
        match progress {
            Ok(Some(n)) => {
                self.inner.recv_pending.set(false);
                self.refresh();
                Ok(Transfer::Done(n))
            }
            Ok(None) => {
                self.inner.recv_pending.set(true);
                self.refresh();
                Ok(Transfer::TryAgain)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Encrypts and sends `buf`, or writes it raw when no engine is active.
    ///
    /// Plaintext is only accepted once earlier records have left the engine,
    /// so retrying after `TryAgain` never duplicates data. Records still
    /// queued after a `Done` are flushed on the next write readiness.
    pub fn send(&self, buf: &[u8]) -> Result<Transfer, SecureError> {
        let fd = self.attached()?;
        if !self.is_secure() {
            return passthrough(sys::send(fd, buf));
        }
        self.check_transfer()?;

        let progress = {
            let mut engine = self.inner.engine.borrow_mut();
            let Some(engine) = engine.as_mut() else {
                return Err(SecureError::NotConfigured);
            };
            send_step(engine, fd, buf)
        };
        match progress {
            Ok(Some(n)) => {
                self.inner.send_pending.set(false);
                self.refresh();
                Ok(Transfer::Done(n))
            }
            Ok(None) => {
                self.inner.send_pending.set(true);
                self.refresh();
                Ok(Transfer::TryAgain)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Subscribes to one of the secure channels.
    ///
    /// The channels live on the descriptor's monitor, so their timeouts are
    /// swept with the monitor's and they go away when monitoring stops.
    pub fn signal_add(
        &self,
        group: &SignalGroup,
        name: &str,
        callback: impl Fn(&Raised<'_>) + 'static,
    ) -> Result<Registration, SecureError> {
        let fd = self.attached()?;
        let bus = self
            .bus()
            .ok_or(SecureError::Reactor(ReactorError::UnknownDescriptor(fd)))?;
        let registration = bus.add(group, name, callback)?;
        if name == SECURE_WRITE {
            self.sync_write_interest();
        }
        Ok(registration)
    }

    /// Shuts TLS down in both directions and continues in cleartext.
    ///
    /// Best effort only. Both peers must call it, and any bytes the peer
    /// sends after its close_notify but before it reads ours can be lost
    /// inside the engine. Returns true once the engine has been released.
    ///
    /// A recv left waiting for data is abandoned; a send still waiting to
    /// go out is not, and makes this call fail.
    pub fn drop_to_clear(&self) -> Result<bool, SecureError> {
        let fd = self.attached()?;
        if !self.is_secure() {
            return Err(SecureError::NotConfigured);
        }
        match (self.status(), self.operation()) {
            (_, Operation::Shutdown1 | Operation::Shutdown2) => return self.advance_shutdown(),
            (Status::Connected | Status::WantRead, Operation::None | Operation::Recv) => {}
            _ => return Err(self.invalid_state()),
        }
        self.inner.recv_pending.set(false);
        warn!(
            "Dropping descriptor {} to cleartext; in-flight data may be lost",
            fd
        );
        if let Some(engine) = self.inner.engine.borrow_mut().as_mut() {
            engine.send_close_notify();
        }
        self.inner.operation.set(Operation::Shutdown1);
        self.advance_shutdown()
    }

    /// Sends a best-effort close_notify, detaches from the descriptor and
    /// stops monitoring it. The descriptor itself stays open.
    pub fn close(&self) {
        let Some(fd) = self.inner.fd.take() else {
            return;
        };
        let engine = self.inner.engine.borrow_mut().take();
        if let Some(mut engine) = engine {
            engine.send_close_notify();
            if let Err(e) = engine.flush(&mut FdStream(fd)) {
                debug!("close_notify on descriptor {} not sent: {}", fd, e);
            }
        }
        self.inner.write_hook.borrow_mut().take();
        self.inner.hooks.clear();
        self.clear_pending();
        self.inner.status.set(Status::None);
        self.inner.operation.set(Operation::None);
        self.inner.reactor.monitor_fd_closed(fd);
        debug!("Secure context on descriptor {} closed", fd);
    }

    /// Closes the context and tears down its channels.
    pub fn destroy(&self) {
        if !self.inner.valid.get() {
            return;
        }
        self.close();
        self.inner.valid.set(false);
        self.inner.hooks.destroy();
    }

    fn check_valid(&self) -> Result<(), SecureError> {
        if self.inner.valid.get() {
            Ok(())
        } else {
            Err(SecureError::ContextDestroyed)
        }
    }

    fn attached(&self) -> Result<RawFd, SecureError> {
        self.check_valid()?;
        self.inner.fd.get().ok_or(SecureError::NotAttached)
    }

    fn invalid_state(&self) -> SecureError {
        let (status, operation) = (self.status(), self.operation());
        warn!("Secure call rejected in {:?} during {:?}", status, operation);
        SecureError::InvalidState { status, operation }
    }

    fn check_transfer(&self) -> Result<(), SecureError> {
        let idle_or_transfer = matches!(
            self.operation(),
            Operation::None | Operation::Recv | Operation::Send
        );
        if self.status().allows_transfer() && idle_or_transfer {
            Ok(())
        } else {
            Err(self.invalid_state())
        }
    }

    /// Derives status and operation from the suspended transfers.
    fn refresh(&self) {
        let (status, operation) = if self.inner.send_pending.get() {
            (Status::WantWrite, Operation::Send)
        } else if self.inner.recv_pending.get() {
            (Status::WantRead, Operation::Recv)
        } else {
            (Status::Connected, Operation::None)
        };
        self.inner.status.set(status);
        self.inner.operation.set(operation);
        self.sync_write_interest();
    }

    fn settle(&self) {
        self.clear_pending();
        self.refresh();
    }

    fn clear_pending(&self) {
        self.inner.recv_pending.set(false);
        self.inner.send_pending.set(false);
    }

    /// True once the handshake is over and no shutdown is running.
    fn is_transferring(&self) -> bool {
        self.status() != Status::Error
            && matches!(
                self.operation(),
                Operation::None | Operation::Recv | Operation::Send
            )
    }

    /// Terminal failure: records it, raises `secure-error`, hands it back.
    fn fail(&self, error: SecureError) -> SecureError {
        self.clear_pending();
        self.inner.status.set(Status::Error);
        self.inner.operation.set(Operation::None);
        warn!(
            "Secure failure on descriptor {:?}: {}",
            self.inner.fd.get(),
            error
        );
        self.sync_write_interest();
        self.raise(SECURE_ERROR);
        error
    }

    fn bus(&self) -> Option<SignalBus> {
        let fd = self.inner.fd.get()?;
        self.inner
            .reactor
            .monitor(fd)
            .map(|monitor| monitor.bus().clone())
    }

    fn raise(&self, name: &str) -> usize {
        let (Some(fd), Some(bus)) = (self.inner.fd.get(), self.bus()) else {
            return 0;
        };
        bus.get(name, false)
            .map_or(0, |channel| channel.raise(Identity::from_fd(fd)))
    }

    fn has_subscribers(&self, name: &str) -> bool {
        self.bus()
            .and_then(|bus| bus.get(name, false))
            .is_some_and(|channel| channel.subscribers() > 0)
    }

    fn hook(
        &self,
        fd: RawFd,
        name: &str,
        handler: fn(&SecureContext),
    ) -> Result<Registration, SecureError> {
        let weak = Rc::downgrade(&self.inner);
        let registration =
            self.inner
                .reactor
                .signal_add(fd, &self.inner.hooks, name, move |_| {
                    if let Some(inner) = weak.upgrade() {
                        handler(&SecureContext { inner });
                    }
                })?;
        Ok(registration)
    }

    /// Keeps a `socket-write` hook only while something needs write
    /// readiness, so idle sockets are not polled for it.
    fn sync_write_interest(&self) {
        let Some(fd) = self.inner.fd.get() else {
            return;
        };
        let pending = self
            .inner
            .engine
            .borrow()
            .as_ref()
            .is_some_and(Engine::wants_write);
        let wanted = self.inner.valid.get()
            && self.status() != Status::Error
            && (pending || self.status() == Status::WantWrite || self.has_subscribers(SECURE_WRITE));
        let hooked = self.inner.write_hook.borrow().is_some();

        if wanted && !hooked {
            match self.hook(fd, SOCKET_WRITE, Self::on_write) {
                Ok(registration) => *self.inner.write_hook.borrow_mut() = Some(registration),
                Err(e) => warn!("Write interest on descriptor {} failed: {}", fd, e),
            }
        } else if !wanted && hooked {
            let registration = self.inner.write_hook.borrow_mut().take();
            if let Some(registration) = registration {
                registration.delete();
            }
        }
    }

    fn advance_handshake(&self) -> Result<bool, SecureError> {
        let fd = self.attached()?;
        let progress = {
            let mut engine = self.inner.engine.borrow_mut();
            let Some(engine) = engine.as_mut() else {
                return Err(SecureError::NotConfigured);
            };
            handshake_step(engine, fd)
        };
        match progress {
            Ok(Progress::Blocked(status)) => {
                self.inner.status.set(status);
                self.sync_write_interest();
                Ok(false)
            }
            Ok(Progress::Complete(buffered)) => {
                self.settle();
                info!("TLS established on descriptor {}", fd);
                self.raise(SECURE_CONNECT);
                if buffered && self.status() == Status::Connected {
                    self.raise(SECURE_READ);
                }
                Ok(true)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn advance_shutdown(&self) -> Result<bool, SecureError> {
        let fd = self.attached()?;
        let progress = {
            let mut engine = self.inner.engine.borrow_mut();
            let Some(engine) = engine.as_mut() else {
                return Err(SecureError::NotConfigured);
            };
            shutdown_step(engine, fd, self.operation())
        };
        match progress {
            Ok((Progress::Blocked(status), operation)) => {
                self.inner.status.set(status);
                self.inner.operation.set(operation);
                self.sync_write_interest();
                Ok(false)
            }
            Ok((Progress::Complete(_), _)) => {
                self.inner.engine.borrow_mut().take();
                self.clear_pending();
                self.inner.status.set(Status::None);
                self.inner.operation.set(Operation::None);
                self.sync_write_interest();
                info!("Descriptor {} continues in cleartext", fd);
                Ok(true)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn on_connect(&self) {
        self.raise(SECURE_CONNECT);
    }

    fn on_read(&self) {
        if !self.is_secure() {
            self.raise(SECURE_READ);
            return;
        }
        match (self.status(), self.operation()) {
            (_, Operation::Handshake) => {
                let _ = self.advance_handshake();
            }
            (_, Operation::Shutdown1 | Operation::Shutdown2) => {
                let _ = self.advance_shutdown();
            }
            _ if !self.is_transferring() => {}
            _ if self.inner.recv_pending.get() => {
                self.raise(SECURE_RESUME_RECV);
            }
            _ => {
                self.raise(SECURE_READ);
            }
        }
    }

    fn on_write(&self) {
        let Some(fd) = self.fd() else {
            return;
        };
        if self.is_secure() {
            let flushed = {
                let mut engine = self.inner.engine.borrow_mut();
                match engine.as_mut() {
                    Some(engine) => engine.flush(&mut FdStream(fd)),
                    None => Ok(true),
                }
            };
            match flushed {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    self.fail(e.into());
                    return;
                }
            }
            match (self.status(), self.operation()) {
                (_, Operation::Handshake) => {
                    let _ = self.advance_handshake();
                }
                (_, Operation::Shutdown1 | Operation::Shutdown2) => {
                    let _ = self.advance_shutdown();
                }
                _ if !self.is_transferring() => {}
                _ if self.inner.send_pending.get() => {
                    self.raise(SECURE_RESUME_SEND);
                }
                _ => {
                    self.raise(SECURE_WRITE);
                }
            }
        } else {
            self.raise(SECURE_WRITE);
        }
        self.sync_write_interest();
    }

    /// `socket-close` and `socket-error` both end the secure session.
    fn on_fault(&self) {
        if self.is_secure() {
            self.clear_pending();
            self.inner.status.set(Status::Error);
            self.inner.operation.set(Operation::None);
        }
        info!("Descriptor {:?} lost under secure context", self.fd());
        self.sync_write_interest();
        self.raise(SECURE_ERROR);
    }
}

impl fmt::Debug for SecureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureContext")
            .field("fd", &self.inner.fd.get())
            .field("status", &self.status())
            .field("operation", &self.operation())
            .field("secure", &self.is_secure())
            .finish()
    }
}

fn passthrough(result: io::Result<usize>) -> Result<Transfer, SecureError> {
    match result {
        Ok(n) => Ok(Transfer::Done(n)),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            Ok(Transfer::TryAgain)
        }
        Err(e) => Err(e.into()),
    }
}

/// Feeds socket bytes into the engine. `Ok(false)` when the socket is dry.
fn pull(engine: &mut Engine, stream: &mut FdStream) -> Result<bool, SecureError> {
    loop {
        match engine.read_tls(stream) {
            Ok(0) => return Err(SecureError::PeerClosed),
            Ok(_) => {
                if let Err(e) = engine.process_new_packets() {
                    // Push out the alert rustls queued for the peer.
                    let _ = engine.flush(stream);
                    return Err(e.into());
                }
                return Ok(true);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn handshake_step(engine: &mut Engine, fd: RawFd) -> Result<Progress, SecureError> {
    let mut stream = FdStream(fd);
    loop {
        if !engine.flush(&mut stream)? {
            return Ok(Progress::Blocked(Status::WantWrite));
        }
        if !engine.is_handshaking() {
            let buffered = engine.process_new_packets()?.plaintext_bytes_to_read() > 0;
            return Ok(Progress::Complete(buffered));
        }
        if !pull(engine, &mut stream)? {
            return Ok(Progress::Blocked(Status::WantRead));
        }
    }
}

fn recv_step(engine: &mut Engine, fd: RawFd, buf: &mut [u8]) -> Result<Option<usize>, SecureError> {
    let mut stream = FdStream(fd);
    loop {
        match engine.read_plaintext(buf) {
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(SecureError::PeerClosed);
            }
            Err(e) => return Err(e.into()),
        }
        if !pull(engine, &mut stream)? {
            return Ok(None);
        }
        // Answer anything the engine owes the peer (key updates, alerts).
        engine.flush(&mut stream)?;
    }
}

fn send_step(engine: &mut Engine, fd: RawFd, buf: &[u8]) -> Result<Option<usize>, SecureError> {
    let mut stream = FdStream(fd);
    if !engine.flush(&mut stream)? {
        return Ok(None);
    }
    let n = engine.write_plaintext(buf)?;
    engine.flush(&mut stream)?;
    Ok(Some(n))
}

fn shutdown_step(
    engine: &mut Engine,
    fd: RawFd,
    mut operation: Operation,
) -> Result<(Progress, Operation), SecureError> {
    let mut stream = FdStream(fd);
    if operation != Operation::Shutdown2 {
        if !engine.flush(&mut stream)? {
            return Ok((Progress::Blocked(Status::WantWrite), Operation::Shutdown1));
        }
        operation = Operation::Shutdown2;
    }
    loop {
        let state = engine.process_new_packets()?;
        if state.peer_has_closed() {
            return Ok((Progress::Complete(false), operation));
        }
        // Plaintext arriving ahead of the peer's close_notify is discarded.
        let mut scratch = [0u8; 1024];
        while let Ok(n) = engine.read_plaintext(&mut scratch) {
            if n == 0 {
                break;
            }
            debug!("Discarded {} bytes while dropping to cleartext", n);
        }
        if !pull(engine, &mut stream)? {
            return Ok((Progress::Blocked(Status::WantRead), operation));
        }
    }
}
