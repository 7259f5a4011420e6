//! Module `collectible`
//!
//! Defines `Collectible<T>`, the capability that lets a host record join any
//! number of collections.

use std::fmt;
use std::ops::Deref;
use std::rc::{Rc, Weak};

use crate::collection::store::{CollectibleId, Store};
use crate::object::{DestroyOutcome, Object};

/// A host record registered in a `Store`.
///
/// Destroying it detaches it from every collection it belongs to, then runs
/// the host destructor given at creation. Teardown waits for outstanding
/// locks and for any cascade collection still holding it.
pub struct Collectible<T> {
    store: Rc<Store>,
    id: CollectibleId,
    host: Rc<T>,
}

impl<T: 'static> Collectible<T> {
    pub fn new(store: &Rc<Store>, host: T) -> Self {
        Self::with_destructor(store, host, |_| {})
    }

    /// Registers `host`; `on_destroy` runs once when teardown completes.
    pub fn with_destructor(
        store: &Rc<Store>,
        host: T,
        on_destroy: impl FnOnce(&T) + 'static,
    ) -> Self {
        let host = Rc::new(host);
        let held = Rc::clone(&host);
        let weak = Rc::downgrade(store);
        let id = store.with(|inner| {
            inner.insert_collectible(host.clone(), |id| {
                Object::new(move || {
                    if let Some(store) = weak.upgrade() {
                        store.finish_collectible(id);
                    }
                    on_destroy(&held);
                })
            })
        });
        Self {
            store: Rc::clone(store),
            id,
            host,
        }
    }

    /// Rebuilds a typed handle from a node found during iteration.
    pub(crate) fn from_parts(store: &Rc<Store>, id: CollectibleId, host: Rc<T>) -> Self {
        Self {
            store: Rc::clone(store),
            id,
            host,
        }
    }

    pub(crate) fn id(&self) -> CollectibleId {
        self.id
    }

    pub fn object(&self) -> Option<Object> {
        self.store
            .with(|inner| inner.collectible(self.id).map(|node| node.object.clone()))
    }

    /// Requests teardown of the host record.
    pub fn destroy(&self) -> DestroyOutcome {
        match self.object() {
            Some(object) => object.destroy(),
            None => DestroyOutcome::AlreadyDone,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.object().is_some_and(|object| object.is_valid())
    }

    /// Number of collections this record currently belongs to.
    pub fn collector_count(&self) -> usize {
        self.store.with(|inner| inner.collector_count(self.id))
    }

    pub fn lock_count(&self) -> usize {
        self.store
            .with(|inner| inner.collectible(self.id).map_or(0, |node| node.locks))
    }

    pub fn host(&self) -> &Rc<T> {
        &self.host
    }

    /// Handle that keeps neither the store nor the host alive.
    pub fn downgrade(&self) -> WeakCollectible<T> {
        WeakCollectible {
            store: Rc::downgrade(&self.store),
            id: self.id,
            host: Rc::downgrade(&self.host),
        }
    }

    /// True if both handles refer to the same record.
    pub fn same(&self, other: &Collectible<T>) -> bool {
        self.id == other.id && Rc::ptr_eq(&self.host, &other.host)
    }
}

/// Non-owning counterpart of `Collectible`, for callbacks that must not
/// keep their record alive.
pub struct WeakCollectible<T> {
    store: Weak<Store>,
    id: CollectibleId,
    host: Weak<T>,
}

impl<T: 'static> WeakCollectible<T> {
    /// Succeeds until the record's teardown has completed.
    pub fn upgrade(&self) -> Option<Collectible<T>> {
        let store = self.store.upgrade()?;
        let host = self.host.upgrade()?;
        let present = store.with(|inner| inner.collectible(self.id).is_some());
        present.then(|| Collectible::from_parts(&store, self.id, host))
    }
}

impl<T> Clone for WeakCollectible<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            id: self.id,
            host: self.host.clone(),
        }
    }
}

impl<T> Deref for Collectible<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.host
    }
}

impl<T> Clone for Collectible<T> {
    fn clone(&self) -> Self {
        Self {
            store: Rc::clone(&self.store),
            id: self.id,
            host: Rc::clone(&self.host),
        }
    }
}

impl<T> fmt::Debug for Collectible<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collectible").field("id", &self.id).finish()
    }
}
