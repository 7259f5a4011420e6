//! Module `lifecycle`
//!
//! Defines `Object`, the reference-counted header that decides when a
//! record's destructor runs. The destructor runs exactly once, and only after
//! a destroy request once the reference count is back to zero.

use log::{debug, warn};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::object::{DestroyOutcome, Lifecycle};

type Destructor = Box<dyn FnOnce()>;

struct Header {
    refs: Cell<usize>,
    state: Cell<Lifecycle>,
    destructor: RefCell<Option<Destructor>>,
}

/// Shared handle to a kernel header.
///
/// Cloning the handle does not take a reference in the kernel sense; only
/// `acquire` does. Handles are cheap and are freely stored by whoever needs
/// to query or drive the lifecycle.
#[derive(Clone)]
pub struct Object {
    header: Rc<Header>,
}

impl Object {
    /// Creates a live object whose teardown runs `destructor`.
    pub fn new(destructor: impl FnOnce() + 'static) -> Self {
        Self {
            header: Rc::new(Header {
                refs: Cell::new(0),
                state: Cell::new(Lifecycle::Live),
                destructor: RefCell::new(Some(Box::new(destructor))),
            }),
        }
    }

    /// Creates a live object with nothing to run on teardown.
    pub fn inert() -> Self {
        Self {
            header: Rc::new(Header {
                refs: Cell::new(0),
                state: Cell::new(Lifecycle::Live),
                destructor: RefCell::new(None),
            }),
        }
    }

    /// Takes a reference.
    ///
    /// Re-acquiring a condemned object is a usage error; it is logged and the
    /// reference is still counted so that the matching `release` balances.
    pub fn acquire(&self) {
        if self.lifecycle() != Lifecycle::Live {
            warn!(
                "Reference taken on condemned object (state {:?}, refs {})",
                self.lifecycle(),
                self.refs()
            );
        }
        self.header.refs.set(self.header.refs.get() + 1);
    }

    /// Drops a reference. Returns true if this release ran the destructor.
    pub fn release(&self) -> bool {
        let refs = self.header.refs.get();
        if refs == 0 {
            warn!("Unbalanced release on object (state {:?})", self.lifecycle());
            return false;
        }
        self.header.refs.set(refs - 1);

        if refs == 1 && self.lifecycle() == Lifecycle::DestroyRequested {
            self.teardown();
            return true;
        }
        false
    }

    /// Requests teardown.
    pub fn destroy(&self) -> DestroyOutcome {
        match self.lifecycle() {
            Lifecycle::Destroying | Lifecycle::Destroyed => DestroyOutcome::AlreadyDone,
            Lifecycle::DestroyRequested => DestroyOutcome::Deferred,
            Lifecycle::Live if self.refs() > 0 => {
                debug!("Destroy deferred ({} references outstanding)", self.refs());
                self.header.state.set(Lifecycle::DestroyRequested);
                DestroyOutcome::Deferred
            }
            Lifecycle::Live => {
                self.teardown();
                DestroyOutcome::Completed
            }
        }
    }

    /// True while no destroy has been requested.
    pub fn is_valid(&self) -> bool {
        self.lifecycle() == Lifecycle::Live
    }

    /// True once the destructor has finished.
    pub fn is_destroyed(&self) -> bool {
        self.lifecycle() == Lifecycle::Destroyed
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.header.state.get()
    }

    pub fn refs(&self) -> usize {
        self.header.refs.get()
    }

    /// Takes a reference released when the guard drops.
    pub fn guard(&self) -> ObjectGuard {
        self.acquire();
        ObjectGuard {
            object: Some(self.clone()),
        }
    }

    /// True if both handles point at the same header.
    pub fn same(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.header, &other.header)
    }

    fn teardown(&self) {
        self.header.state.set(Lifecycle::Destroying);
        // Taken out first so a nested destroy/release inside the destructor
        // finds nothing left to run.
        let destructor = self.header.destructor.borrow_mut().take();
        if let Some(destructor) = destructor {
            destructor();
        }
        self.header.state.set(Lifecycle::Destroyed);
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("state", &self.lifecycle())
            .field("refs", &self.refs())
            .finish()
    }
}

/// Keeps an object referenced for the guard's lifetime.
#[derive(Debug)]
pub struct ObjectGuard {
    object: Option<Object>,
}

impl ObjectGuard {
    /// Releases early, reporting whether the release ran the destructor.
    pub fn finish(mut self) -> bool {
        self.object.take().is_some_and(|object| object.release())
    }
}

impl Drop for ObjectGuard {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            object.release();
        }
    }
}
