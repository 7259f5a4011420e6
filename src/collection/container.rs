//! Module `collection`
//!
//! Defines `Collection<T>`, a typed handle onto a many-to-many membership
//! container in a shared `Store`.

use log::{debug, warn};
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::collection::store::{CollectionId, Store};
use crate::collection::{Collectible, Cursor};
use crate::error::CollectionError;
use crate::object::{DestroyOutcome, Object};

/// What happens to members when the collection is emptied or destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Members survive; only the memberships go away.
    Plain,
    /// Every member's host record is destroyed as well.
    Cascade,
}

/// Handle onto a collection of `T` host records.
pub struct Collection<T> {
    store: Rc<Store>,
    id: CollectionId,
    _host: PhantomData<fn() -> T>,
}

impl<T: 'static> Collection<T> {
    pub fn new(store: &Rc<Store>, policy: Policy) -> Self {
        let weak = Rc::downgrade(store);
        let id = store.with(|inner| {
            inner.insert_collection(policy, |id| {
                Object::new(move || {
                    if let Some(store) = weak.upgrade() {
                        store.finish_collection(id);
                    }
                })
            })
        });
        Self {
            store: Rc::clone(store),
            id,
            _host: PhantomData,
        }
    }

    pub fn store(&self) -> &Rc<Store> {
        &self.store
    }

    /// Kernel object of the collection, while its node exists.
    pub fn object(&self) -> Option<Object> {
        self.store
            .with(|inner| inner.collection(self.id).map(|node| node.object.clone()))
    }

    pub fn policy(&self) -> Policy {
        self.store.with(|inner| {
            inner
                .collection(self.id)
                .map_or(Policy::Plain, |node| node.policy)
        })
    }

    pub fn is_valid(&self) -> bool {
        self.object().is_some_and(|object| object.is_valid())
    }

    /// Adds a membership at the head of the collection.
    pub fn add(&self, item: &Collectible<T>) -> Result<(), CollectionError> {
        self.store
            .with(|inner| inner.link(self.id, item.id()))
            .map(|_| ())
    }

    /// Removes the membership joining this collection and `item`.
    ///
    /// Returns true when dropping the membership completed a teardown that
    /// was waiting on it (a condemned member of a cascade collection).
    pub fn delete(&self, item: &Collectible<T>) -> Result<bool, CollectionError> {
        let detached = self.store.with(|inner| {
            let member = inner
                .find(self.id, item.id())
                .ok_or(CollectionError::NotMember)?;
            inner.unlink(member).ok_or(CollectionError::NotMember)
        })?;
        if detached.policy == Policy::Cascade {
            return Ok(detached.item.release());
        }
        Ok(false)
    }

    pub fn contains(&self, item: &Collectible<T>) -> bool {
        self.store
            .with(|inner| inner.find(self.id, item.id()).is_some())
    }

    /// Moves `item` to the tail without reordering the other members.
    ///
    /// A cursor parked on `item` moves on to its successor first, so a pass
    /// already past the tail will not see it again; a pass that still has
    /// members ahead of it will.
    pub fn move_to_end(&self, item: &Collectible<T>) -> Result<(), CollectionError> {
        self.store.with(|inner| {
            let member = inner
                .find(self.id, item.id())
                .ok_or(CollectionError::NotMember)?;
            inner.move_to_end(member).ok_or(CollectionError::NotMember)
        })
    }

    pub fn len(&self) -> usize {
        self.store.with(|inner| inner.len(self.id))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pins the collection, the collectible and its host for an in-flight
    /// callback.
    pub fn lock(&self, item: &Collectible<T>) -> Result<(), CollectionError> {
        self.store.with(|inner| {
            let coll = inner
                .collection(self.id)
                .map(|node| node.object.clone())
                .ok_or(CollectionError::CollectionTornDown)?;
            let target = inner
                .collectible_mut(item.id())
                .ok_or(CollectionError::ItemTornDown)?;
            target.locks += 1;
            target.object.acquire();
            coll.acquire();
            Ok(())
        })
    }

    /// Undoes `lock`. Returns true if this unlock completed the collectible's
    /// teardown.
    pub fn unlock(&self, item: &Collectible<T>) -> bool {
        let objects = self.store.with(|inner| {
            let coll = inner.collection(self.id).map(|node| node.object.clone());
            let target = inner.collectible_mut(item.id())?;
            if target.locks == 0 {
                return None;
            }
            target.locks -= 1;
            Some((coll, target.object.clone()))
        });
        let Some((coll, target)) = objects else {
            warn!("Unbalanced collection unlock");
            return false;
        };
        let torn_down = target.release();
        if let Some(coll) = coll {
            coll.release();
        }
        torn_down
    }

    /// Opens a persistent cursor seeded at the current head.
    pub fn iter(&self) -> Cursor<T> {
        Cursor::open(&self.store, self.id)
    }

    /// Calls `callback` for every surviving member until it returns false.
    ///
    /// The collection stays pinned for the whole pass and each member is
    /// locked around its callback, so callbacks may delete or destroy any
    /// member, themselves included. Returns false if the pass was stopped by
    /// the callback or the collection was torn down mid-pass.
    pub fn iterate(&self, mut callback: impl FnMut(&Collectible<T>) -> bool) -> bool {
        let Some(object) = self.object() else {
            warn!("Iterate on a destroyed collection");
            return false;
        };
        if !object.is_valid() {
            return false;
        }
        let _pin = object.guard();

        for item in self.iter() {
            if self.lock(&item).is_err() {
                continue;
            }
            let keep_going = callback(&item);
            self.unlock(&item);
            if !keep_going || !object.is_valid() {
                return false;
            }
        }
        object.is_valid()
    }

    /// Returns the first surviving member accepted by `predicate`.
    pub fn match_first(
        &self,
        mut predicate: impl FnMut(&Collectible<T>) -> bool,
    ) -> Option<Collectible<T>> {
        for item in self.iter() {
            if self.lock(&item).is_err() {
                continue;
            }
            let accepted = predicate(&item);
            self.unlock(&item);
            if accepted && item.is_valid() {
                return Some(item);
            }
        }
        None
    }

    /// Snapshot of the surviving members in iteration order.
    pub fn to_vec(&self) -> Vec<Collectible<T>> {
        self.iter().collect()
    }

    /// Marks the collection void: new members are rejected.
    pub fn set_void(&self, void: bool) {
        self.store.with(|inner| {
            if let Some(node) = inner.collection_mut(self.id) {
                node.void = void;
            }
        });
    }

    pub fn is_void(&self) -> bool {
        self.store
            .with(|inner| inner.collection(self.id).is_some_and(|node| node.void))
    }

    /// Drops every membership, destroying members under the cascade policy.
    /// The collection itself survives and accepts members again afterwards.
    pub fn empty(&self) {
        self.set_void(true);
        self.drain();
        if self.is_valid() {
            self.set_void(false);
        }
    }

    /// Tears the collection down: void, drain, stop cursors, then release
    /// the kernel object (deferred while the collection is pinned).
    pub fn destroy(&self) -> DestroyOutcome {
        let Some(object) = self.object() else {
            return DestroyOutcome::AlreadyDone;
        };
        if !object.is_valid() {
            return object.destroy();
        }
        self.set_void(true);
        let drained = self.drain();
        self.store.with(|inner| inner.orphan_iterators(self.id));
        debug!("Collection destroyed after draining {} members", drained);
        object.destroy()
    }

    fn drain(&self) -> usize {
        let mut drained = 0;
        loop {
            let detached = self.store.with(|inner| {
                let member = inner.head(self.id)?;
                inner.unlink(member)
            });
            let Some(detached) = detached else {
                break;
            };
            drained += 1;
            if detached.policy == Policy::Cascade {
                detached.item.destroy();
                detached.item.release();
            }
        }
        drained
    }
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            store: Rc::clone(&self.store),
            id: self.id,
            _host: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    type Log = Rc<RefCell<Vec<&'static str>>>;

    fn named(store: &Rc<Store>, name: &'static str, log: &Log) -> Collectible<&'static str> {
        let log = Rc::clone(log);
        Collectible::with_destructor(store, name, move |host| log.borrow_mut().push(*host))
    }

    fn names(collection: &Collection<&'static str>) -> Vec<&'static str> {
        collection.to_vec().iter().map(|item| **item).collect()
    }

    #[test]
    fn test_insertion_is_at_head() {
        let store = Store::new();
        let log = Log::default();
        let collection = Collection::new(&store, Policy::Plain);
        for name in ["a", "b", "c"] {
            collection.add(&named(&store, name, &log)).unwrap();
        }
        assert_eq!(names(&collection), vec!["c", "b", "a"]);
        assert_eq!(collection.len(), 3);
    }

    #[test]
    fn test_delete_during_iteration_visits_survivors() {
        let store = Store::new();
        let log = Log::default();
        let collection = Collection::new(&store, Policy::Cascade);
        let a = named(&store, "A", &log);
        let b = named(&store, "B", &log);
        let c = named(&store, "C", &log);
        for item in [&a, &b, &c] {
            collection.add(item).unwrap();
        }

        let mut visited = Vec::new();
        let completed = collection.iterate(|item| {
            visited.push(**item);
            if **item == "C" {
                b.destroy();
                collection.delete(&b).unwrap();
            }
            true
        });

        assert!(completed);
        assert_eq!(visited, vec!["C", "A"]);
        assert_eq!(*log.borrow(), vec!["B"]);
        assert_eq!(collection.len(), 2);
    }

    #[test]
    fn test_callback_may_destroy_current_member() {
        let store = Store::new();
        let log = Log::default();
        let collection = Collection::new(&store, Policy::Plain);
        for name in ["a", "b", "c"] {
            collection.add(&named(&store, name, &log)).unwrap();
        }

        let mut visited = Vec::new();
        collection.iterate(|item| {
            visited.push(**item);
            item.destroy();
            // Teardown waits for the iteration lock.
            assert!(!log.borrow().contains(&**item));
            true
        });

        assert_eq!(visited, vec!["c", "b", "a"]);
        assert_eq!(*log.borrow(), vec!["c", "b", "a"]);
        assert!(collection.is_empty());
    }

    #[test]
    fn test_cascade_destroy_tears_down_each_member_once() {
        let store = Store::new();
        let log = Log::default();
        let cascade = Collection::new(&store, Policy::Cascade);
        let plain = Collection::new(&store, Policy::Plain);
        let items: Vec<_> = ["x", "y", "z"]
            .into_iter()
            .map(|name| named(&store, name, &log))
            .collect();
        for item in &items {
            cascade.add(item).unwrap();
            plain.add(item).unwrap();
        }

        assert_eq!(cascade.destroy(), DestroyOutcome::Completed);
        let mut destroyed = log.borrow().clone();
        destroyed.sort();
        assert_eq!(destroyed, vec!["x", "y", "z"]);
        assert!(plain.is_empty());
        assert_eq!(cascade.destroy(), DestroyOutcome::AlreadyDone);
        assert!(items.iter().all(|item| !item.is_valid()));
    }

    #[test]
    fn test_plain_destroy_keeps_members() {
        let store = Store::new();
        let log = Log::default();
        let collection = Collection::new(&store, Policy::Plain);
        let item = named(&store, "kept", &log);
        collection.add(&item).unwrap();

        collection.destroy();
        assert!(log.borrow().is_empty());
        assert!(item.is_valid());
        assert_eq!(item.collector_count(), 0);
        assert_eq!(collection.add(&item), Err(CollectionError::CollectionTornDown));
    }

    #[test]
    fn test_condemned_cascade_member_waits_for_removal() {
        let store = Store::new();
        let log = Log::default();
        let collection = Collection::new(&store, Policy::Cascade);
        let item = named(&store, "late", &log);
        collection.add(&item).unwrap();

        assert_eq!(item.destroy(), DestroyOutcome::Deferred);
        assert!(log.borrow().is_empty());
        assert!(collection.to_vec().is_empty());
        assert_eq!(collection.delete(&item), Ok(true));
        assert_eq!(*log.borrow(), vec!["late"]);
    }

    #[test]
    fn test_void_collection_rejects_members() {
        let store = Store::new();
        let log = Log::default();
        let collection = Collection::new(&store, Policy::Plain);
        collection.set_void(true);
        assert!(collection.is_void());
        assert_eq!(
            collection.add(&named(&store, "no", &log)),
            Err(CollectionError::Void)
        );
    }

    #[test]
    fn test_empty_restores_collection() {
        let store = Store::new();
        let log = Log::default();
        let collection = Collection::new(&store, Policy::Cascade);
        collection.add(&named(&store, "one", &log)).unwrap();
        collection.empty();
        assert_eq!(*log.borrow(), vec!["one"]);
        assert!(!collection.is_void());
        collection.add(&named(&store, "two", &log)).unwrap();
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn test_move_to_end_rotates_single_entry() {
        let store = Store::new();
        let log = Log::default();
        let collection = Collection::new(&store, Policy::Plain);
        let a = named(&store, "a", &log);
        collection.add(&a).unwrap();
        collection.add(&named(&store, "b", &log)).unwrap();
        collection.add(&named(&store, "c", &log)).unwrap();

        collection.move_to_end(&named(&store, "d", &log)).unwrap_err();
        let head = collection.to_vec().remove(0);
        collection.move_to_end(&head).unwrap();
        assert_eq!(names(&collection), vec!["b", "a", "c"]);
        collection.move_to_end(&a).unwrap();
        assert_eq!(names(&collection), vec!["b", "c", "a"]);
        assert_eq!(collection.len(), 3);
    }

    #[test]
    fn test_match_first_returns_accepted_member() {
        let store = Store::new();
        let log = Log::default();
        let collection = Collection::new(&store, Policy::Plain);
        for name in ["alpha", "beta", "gamma"] {
            collection.add(&named(&store, name, &log)).unwrap();
        }
        let found = collection.match_first(|item| item.starts_with('b'));
        assert_eq!(found.map(|item| *item), Some("beta"));
        assert!(collection.match_first(|item| item.is_empty()).is_none());
    }

    #[test]
    fn test_lock_defers_teardown_until_unlock() {
        let store = Store::new();
        let log = Log::default();
        let collection = Collection::new(&store, Policy::Plain);
        let item = named(&store, "pinned", &log);
        collection.add(&item).unwrap();

        collection.lock(&item).unwrap();
        assert_eq!(item.lock_count(), 1);
        assert_eq!(item.destroy(), DestroyOutcome::Deferred);
        assert!(log.borrow().is_empty());
        assert!(collection.unlock(&item));
        assert_eq!(*log.borrow(), vec!["pinned"]);
        assert!(!collection.unlock(&item));
    }

    #[test]
    fn test_destroy_mid_pass_aborts_iteration() {
        let store = Store::new();
        let log = Log::default();
        let collection = Collection::new(&store, Policy::Plain);
        for name in ["a", "b", "c"] {
            collection.add(&named(&store, name, &log)).unwrap();
        }
        let mut visited = 0;
        let completed = collection.iterate(|_| {
            visited += 1;
            collection.destroy();
            true
        });
        assert!(!completed);
        assert_eq!(visited, 1);
        assert!(collection.object().is_none());
    }

    #[test]
    fn test_released_cursors_are_collected() {
        let store = Store::new();
        let log = Log::default();
        let collection = Collection::new(&store, Policy::Plain);
        collection.add(&named(&store, "a", &log)).unwrap();
        collection.iterate(|_| true);
        let cursor = collection.iter();
        assert_eq!(store.live_iterators(), 2);
        assert_eq!(store.collect_garbage(), 1);
        drop(cursor);
        assert_eq!(store.collect_garbage(), 1);
        assert_eq!(store.live_iterators(), 0);
    }
}
