//! Module `core`
//!
//! Defines `Reactor`, which owns every live socket monitor and turns
//! `poll(2)` readiness into socket signals once per tick.

use log::{debug, info, warn};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::collection::{Collectible, Collection, Policy, Store};
use crate::error::ReactorError;
use crate::reactor::monitor::Monitor;
use crate::reactor::sys;
use crate::signal::{Clock, Raised, Registration, SignalGroup};

struct ReactorInner {
    store: Rc<Store>,
    clock: Rc<dyn Clock>,
    monitors: Collection<Monitor>,
    by_fd: RefCell<HashMap<RawFd, Collectible<Monitor>>>,
    batch_size: usize,
    valid: Cell<bool>,
}

/// Handle onto the socket multiplexer.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<ReactorInner>,
}

impl Reactor {
    pub fn new(store: &Rc<Store>, clock: Rc<dyn Clock>, batch_size: usize) -> Self {
        Self {
            inner: Rc::new(ReactorInner {
                store: Rc::clone(store),
                clock,
                monitors: Collection::new(store, Policy::Cascade),
                by_fd: RefCell::new(HashMap::new()),
                batch_size: batch_size.max(1),
                valid: Cell::new(true),
            }),
        }
    }

    pub fn store(&self) -> &Rc<Store> {
        &self.inner.store
    }

    pub fn clock(&self) -> Rc<dyn Clock> {
        Rc::clone(&self.inner.clock)
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    /// Starts monitoring `fd` and switches it to non-blocking mode.
    ///
    /// A socket that is neither `connected` nor `listening` is treated as an
    /// outgoing connect in progress.
    pub fn monitor_new(
        &self,
        fd: RawFd,
        connected: bool,
        listening: bool,
    ) -> Result<(), ReactorError> {
        if !self.inner.valid.get() {
            return Err(ReactorError::ReactorShutdown);
        }
        if self.is_monitored(fd) {
            warn!("Descriptor {} is already monitored", fd);
            return Err(ReactorError::AlreadyMonitored(fd));
        }
        sys::set_nonblocking(fd)?;

        let monitor = Monitor::new(
            fd,
            connected,
            listening,
            &self.inner.store,
            Rc::clone(&self.inner.clock),
        )?;
        let item = Collectible::with_destructor(&self.inner.store, monitor, Monitor::teardown);
        if let Err(e) = self.inner.monitors.add(&item) {
            item.destroy();
            return Err(e.into());
        }
        self.inner.by_fd.borrow_mut().insert(fd, item);
        debug!(
            "Monitoring descriptor {} (connected: {}, listening: {})",
            fd, connected, listening
        );
        Ok(())
    }

    /// Subscribes `callback` to one of `fd`'s socket channels.
    pub fn signal_add(
        &self,
        fd: RawFd,
        group: &SignalGroup,
        name: &str,
        callback: impl Fn(&Raised<'_>) + 'static,
    ) -> Result<Registration, ReactorError> {
        let monitor = self.monitor(fd).ok_or(ReactorError::UnknownDescriptor(fd))?;
        Ok(monitor.bus().add(group, name, callback)?)
    }

    /// Stops monitoring `fd`; the caller closes the descriptor itself.
    ///
    /// Called from inside one of the descriptor's own callbacks, teardown
    /// waits until dispatch for the current tick is over.
    pub fn monitor_fd_closed(&self, fd: RawFd) -> bool {
        let item = self.inner.by_fd.borrow_mut().remove(&fd);
        let Some(item) = item else {
            return false;
        };
        item.destroy();
        // Dropping the cascade membership releases the last structural hold.
        let _ = self.inner.monitors.delete(&item);
        debug!("Descriptor {} no longer monitored", fd);
        true
    }

    pub fn is_monitored(&self, fd: RawFd) -> bool {
        self.inner.by_fd.borrow().contains_key(&fd)
    }

    pub fn is_connected(&self, fd: RawFd) -> bool {
        self.monitor(fd).is_some_and(|monitor| monitor.is_connected())
    }

    pub fn is_dead(&self, fd: RawFd) -> bool {
        self.monitor(fd).is_some_and(|monitor| monitor.is_dead())
    }

    pub fn len(&self) -> usize {
        self.inner.by_fd.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn monitor(&self, fd: RawFd) -> Option<Collectible<Monitor>> {
        self.inner.by_fd.borrow().get(&fd).cloned()
    }

    /// One reactor tick. Returns the number of signals delivered, timeouts
    /// included.
    ///
    /// Monitors are polled in batches of `batch_size` descriptors with a zero
    /// timeout. Each monitor is locked while its signals are dispatched in the
    /// order connect, error, read, write, then its timeout sweep. Dead
    /// monitors are left out of the readiness poll but still swept.
    pub fn poll(&self) -> usize {
        if !self.inner.valid.get() {
            return 0;
        }
        let (dead, live): (Vec<Collectible<Monitor>>, Vec<Collectible<Monitor>>) = self
            .inner
            .monitors
            .to_vec()
            .into_iter()
            .partition(|item| item.is_dead());

        let mut processed = 0;
        for item in &dead {
            processed += self.sweep(item);
            if !self.inner.valid.get() {
                return processed;
            }
        }
        for batch in live.chunks(self.inner.batch_size) {
            let mut fds: Vec<libc::pollfd> = batch
                .iter()
                .map(|item| libc::pollfd {
                    fd: item.fd(),
                    events: item.interest(),
                    revents: 0,
                })
                .collect();
            if let Err(e) = sys::poll(&mut fds, 0) {
                warn!("Readiness poll failed: {}", e);
                return processed;
            }
            for (item, pollfd) in batch.iter().zip(&fds) {
                processed += self.dispatch(item, pollfd.revents);
                if !self.inner.valid.get() {
                    return processed;
                }
            }
        }
        processed
    }

    fn dispatch(&self, item: &Collectible<Monitor>, revents: libc::c_short) -> usize {
        if self.inner.monitors.lock(item).is_err() {
            return 0;
        }
        let mut processed = self.dispatch_events(item, revents);
        if item.is_valid() {
            processed += item.bus().poll();
        }
        self.inner.monitors.unlock(item);
        processed
    }

    fn sweep(&self, item: &Collectible<Monitor>) -> usize {
        if self.inner.monitors.lock(item).is_err() {
            return 0;
        }
        let processed = if item.is_valid() { item.bus().poll() } else { 0 };
        self.inner.monitors.unlock(item);
        processed
    }

    fn dispatch_events(&self, item: &Collectible<Monitor>, revents: libc::c_short) -> usize {
        let monitor: &Monitor = item;
        let fd = monitor.fd();
        let alive = || item.is_valid() && !monitor.is_dead();
        let mut processed = 0;

        if monitor.is_listening() {
            if revents & libc::POLLIN != 0 {
                processed += monitor.raise_connect();
            }
        } else if monitor.is_connecting() {
            if revents & (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) == 0 {
                return processed;
            }
            return match sys::socket_error(fd) {
                Ok(None) => monitor.mark_connected(),
                Ok(Some(e)) | Err(e) => {
                    info!("Connect on descriptor {} failed: {}", fd, e);
                    monitor.raise_error()
                }
            };
        }
        if !alive() {
            return processed;
        }

        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            match sys::socket_error(fd) {
                Ok(Some(e)) | Err(e) => info!("Descriptor {} failed: {}", fd, e),
                Ok(None) => info!("Descriptor {} reported an error condition", fd),
            }
            return processed + monitor.raise_error();
        }
        if monitor.is_listening() {
            return processed;
        }

        if revents & (libc::POLLIN | libc::POLLHUP) != 0 {
            match sys::bytes_available(fd) {
                Ok(0) => {
                    debug!("Peer closed descriptor {}", fd);
                    return processed + monitor.raise_close();
                }
                Ok(_) => processed += monitor.raise_read(),
                Err(e) => {
                    info!("Descriptor {} unreadable: {}", fd, e);
                    return processed + monitor.raise_error();
                }
            }
            if !alive() {
                return processed;
            }
        }

        if revents & libc::POLLOUT != 0 {
            processed += monitor.raise_write();
        }
        processed
    }

    /// Tears down every monitor. Descriptors are left open.
    pub fn shutdown(&self) {
        if !self.inner.valid.replace(false) {
            return;
        }
        let count = self.inner.by_fd.borrow_mut().drain().count();
        self.inner.monitors.destroy();
        info!("Reactor shut down with {} monitors", count);
    }

    pub fn is_valid(&self) -> bool {
        self.inner.valid.get()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("monitors", &self.len())
            .field("batch_size", &self.inner.batch_size)
            .finish()
    }
}
