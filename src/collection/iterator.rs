//! Module `iterator`
//!
//! Persistent cursors over a collection. A cursor remembers the next
//! membership to visit; removing that membership moves the cursor to the
//! successor, so callbacks may delete whatever they are visiting.

use log::error;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::collection::Collectible;
use crate::collection::store::{CollectionId, IteratorId, Store};

/// Cursor over the surviving members of a collection.
///
/// Dropped cursors stay on the store's iterator list until the next
/// `Store::collect_garbage`.
pub struct Cursor<T> {
    store: Rc<Store>,
    id: IteratorId,
    _host: PhantomData<fn() -> T>,
}

impl<T: 'static> Cursor<T> {
    pub(crate) fn open(store: &Rc<Store>, collection: CollectionId) -> Self {
        let id = store.with(|inner| inner.open_iterator(collection));
        Self {
            store: Rc::clone(store),
            id,
            _host: PhantomData,
        }
    }
}

impl<T: 'static> Iterator for Cursor<T> {
    type Item = Collectible<T>;

    fn next(&mut self) -> Option<Collectible<T>> {
        loop {
            let (id, host) = self.store.with(|inner| inner.advance(self.id))?;
            match host.downcast::<T>() {
                Ok(host) => return Some(Collectible::from_parts(&self.store, id, host)),
                Err(_) => error!("Collection member has an unexpected host type"),
            }
        }
    }
}

impl<T> Drop for Cursor<T> {
    fn drop(&mut self) {
        self.store.release_iterator(self.id);
    }
}
