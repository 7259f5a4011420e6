//! Module `store`
//!
//! Arena-backed storage shared by every collection, collectible, membership
//! and cursor created against it. A membership is a node linked by index into
//! two lists at once: its collection's member list and its collectible's
//! collector list. That gives O(1) insert, remove and move without intrusive
//! pointers.
//!
//! Nothing in this module runs a destructor while the store is borrowed.
//! Operations that can trigger teardown hand the relevant `Object` back to
//! the caller, which acts on it after the borrow ends.

use log::{debug, error};
use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::collection::Policy;
use crate::collection::arena::{Arena, Key};
use crate::error::CollectionError;
use crate::object::Object;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CollectionId(Key);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CollectibleId(Key);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct MemberId(Key);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct IteratorId(Key);

pub(crate) struct CollectionNode {
    pub(crate) object: Object,
    pub(crate) policy: Policy,
    pub(crate) void: bool,
    head: Option<MemberId>,
    tail: Option<MemberId>,
    len: usize,
    iterators: Vec<IteratorId>,
}

pub(crate) struct CollectibleNode {
    pub(crate) object: Object,
    pub(crate) host: Rc<dyn Any>,
    collectors: Option<MemberId>,
    count: usize,
    pub(crate) locks: usize,
}

struct MemberNode {
    collection: CollectionId,
    collectible: CollectibleId,
    prev: Option<MemberId>,
    next: Option<MemberId>,
    item_prev: Option<MemberId>,
    item_next: Option<MemberId>,
}

struct IteratorNode {
    collection: CollectionId,
    next: Option<MemberId>,
}

/// A membership that was just detached.
pub(crate) struct Detached {
    pub(crate) policy: Policy,
    pub(crate) item: Object,
}

/// Counts of live records, mostly useful for leak checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub collections: usize,
    pub collectibles: usize,
    pub memberships: usize,
    pub iterators: usize,
}

#[derive(Default)]
pub(crate) struct StoreInner {
    collections: Arena<CollectionNode>,
    collectibles: Arena<CollectibleNode>,
    members: Arena<MemberNode>,
    iterators: Arena<IteratorNode>,
}

/// Shared backing store for collections and collectibles.
pub struct Store {
    inner: RefCell<StoreInner>,
    released: RefCell<Vec<IteratorId>>,
}

impl Store {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            inner: RefCell::new(StoreInner::default()),
            released: RefCell::new(Vec::new()),
        })
    }

    /// Runs `f` against the arenas. `f` must not run destructors.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut StoreInner) -> R) -> R {
        f(&mut self.inner.borrow_mut())
    }

    /// Frees every cursor dropped since the last sweep. Returns how many.
    pub fn collect_garbage(&self) -> usize {
        let released: Vec<IteratorId> = self.released.borrow_mut().drain(..).collect();
        if released.is_empty() {
            return 0;
        }
        let count = released.len();
        self.with(|inner| {
            for id in released {
                inner.free_iterator(id);
            }
        });
        debug!("Collected {} released iterators", count);
        count
    }

    /// Size of the process-wide iterator list, released ones included.
    pub fn live_iterators(&self) -> usize {
        self.inner.borrow().iterators.len()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.borrow();
        StoreStats {
            collections: inner.collections.len(),
            collectibles: inner.collectibles.len(),
            memberships: inner.members.len(),
            iterators: inner.iterators.len(),
        }
    }

    pub(crate) fn release_iterator(&self, id: IteratorId) {
        self.released.borrow_mut().push(id);
    }

    /// Final stage of a collection teardown, run by its kernel object.
    pub(crate) fn finish_collection(&self, id: CollectionId) {
        let leftovers = self.with(|inner| inner.remove_collection(id));
        if !leftovers.is_empty() {
            error!(
                "Collection torn down with {} members still attached",
                leftovers.len()
            );
        }
        for detached in leftovers {
            if detached.policy == Policy::Cascade {
                detached.item.release();
            }
        }
    }

    /// Final stage of a collectible teardown, run by its kernel object.
    pub(crate) fn finish_collectible(&self, id: CollectibleId) {
        let removed = self.with(|inner| inner.remove_collectible(id));
        if let Some((node, detached)) = removed {
            if node.locks > 0 {
                error!("Collectible torn down with {} locks held", node.locks);
            }
            debug!("Collectible detached from {} collections", detached.len());
            // The host is dropped here, outside the store borrow.
            drop(node);
        }
    }
}

impl StoreInner {
    pub(crate) fn insert_collection(
        &mut self,
        policy: Policy,
        object: impl FnOnce(CollectionId) -> Object,
    ) -> CollectionId {
        CollectionId(self.collections.insert_with(|key| CollectionNode {
            object: object(CollectionId(key)),
            policy,
            void: false,
            head: None,
            tail: None,
            len: 0,
            iterators: Vec::new(),
        }))
    }

    pub(crate) fn insert_collectible(
        &mut self,
        host: Rc<dyn Any>,
        object: impl FnOnce(CollectibleId) -> Object,
    ) -> CollectibleId {
        CollectibleId(self.collectibles.insert_with(|key| CollectibleNode {
            object: object(CollectibleId(key)),
            host,
            collectors: None,
            count: 0,
            locks: 0,
        }))
    }

    pub(crate) fn collection(&self, id: CollectionId) -> Option<&CollectionNode> {
        self.collections.get(id.0)
    }

    pub(crate) fn collection_mut(&mut self, id: CollectionId) -> Option<&mut CollectionNode> {
        self.collections.get_mut(id.0)
    }

    pub(crate) fn collectible(&self, id: CollectibleId) -> Option<&CollectibleNode> {
        self.collectibles.get(id.0)
    }

    pub(crate) fn collectible_mut(&mut self, id: CollectibleId) -> Option<&mut CollectibleNode> {
        self.collectibles.get_mut(id.0)
    }

    pub(crate) fn len(&self, id: CollectionId) -> usize {
        self.collection(id).map_or(0, |node| node.len)
    }

    pub(crate) fn collector_count(&self, id: CollectibleId) -> usize {
        self.collectible(id).map_or(0, |node| node.count)
    }

    pub(crate) fn head(&self, id: CollectionId) -> Option<MemberId> {
        self.collection(id).and_then(|node| node.head)
    }

    /// Creates a membership at the head of both lists.
    ///
    /// A cascade membership holds a kernel reference on the collectible.
    pub(crate) fn link(
        &mut self,
        coll: CollectionId,
        item: CollectibleId,
    ) -> Result<MemberId, CollectionError> {
        let node = self
            .collections
            .get(coll.0)
            .ok_or(CollectionError::CollectionTornDown)?;
        if !node.object.is_valid() {
            return Err(CollectionError::CollectionTornDown);
        }
        if node.void {
            return Err(CollectionError::Void);
        }
        let (policy, coll_head) = (node.policy, node.head);

        let target = self
            .collectibles
            .get(item.0)
            .ok_or(CollectionError::ItemTornDown)?;
        if !target.object.is_valid() {
            return Err(CollectionError::ItemTornDown);
        }
        let item_head = target.collectors;

        let member = MemberId(self.members.insert(MemberNode {
            collection: coll,
            collectible: item,
            prev: None,
            next: coll_head,
            item_prev: None,
            item_next: item_head,
        }));
        if let Some(head) = coll_head.and_then(|h| self.members.get_mut(h.0)) {
            head.prev = Some(member);
        }
        if let Some(head) = item_head.and_then(|h| self.members.get_mut(h.0)) {
            head.item_prev = Some(member);
        }

        if let Some(node) = self.collections.get_mut(coll.0) {
            node.head = Some(member);
            if node.tail.is_none() {
                node.tail = Some(member);
            }
            node.len += 1;
        }
        if let Some(target) = self.collectibles.get_mut(item.0) {
            target.collectors = Some(member);
            target.count += 1;
            if policy == Policy::Cascade {
                target.object.acquire();
            }
        }
        Ok(member)
    }

    /// Finds the membership joining `coll` and `item`.
    ///
    /// Walks the collector list, which is the short side in practice.
    pub(crate) fn find(&self, coll: CollectionId, item: CollectibleId) -> Option<MemberId> {
        let mut cursor = self.collectible(item)?.collectors;
        while let Some(member) = cursor {
            let node = self.members.get(member.0)?;
            if node.collection == coll {
                return Some(member);
            }
            cursor = node.item_next;
        }
        None
    }

    /// Removes a membership from both lists and frees it.
    pub(crate) fn unlink(&mut self, member: MemberId) -> Option<Detached> {
        self.detach_from_collection(member)?;
        let node = self.members.remove(member.0)?;

        match node.item_prev {
            Some(prev) => {
                if let Some(prev) = self.members.get_mut(prev.0) {
                    prev.item_next = node.item_next;
                }
            }
            None => {
                if let Some(target) = self.collectibles.get_mut(node.collectible.0) {
                    target.collectors = node.item_next;
                }
            }
        }
        if let Some(next) = node.item_next.and_then(|n| self.members.get_mut(n.0)) {
            next.item_prev = node.item_prev;
        }

        let policy = self
            .collection(node.collection)
            .map_or(Policy::Plain, |c| c.policy);
        let target = self.collectibles.get_mut(node.collectible.0)?;
        target.count = target.count.saturating_sub(1);
        Some(Detached {
            policy,
            item: target.object.clone(),
        })
    }

    /// Relocates a membership to the tail of its collection.
    pub(crate) fn move_to_end(&mut self, member: MemberId) -> Option<()> {
        self.detach_from_collection(member)?;
        let coll = self.members.get(member.0)?.collection;
        let tail = self.collection(coll)?.tail;

        if let Some(node) = self.members.get_mut(member.0) {
            node.prev = tail;
            node.next = None;
        }
        match tail.and_then(|t| self.members.get_mut(t.0)) {
            Some(last) => last.next = Some(member),
            None => {
                if let Some(node) = self.collections.get_mut(coll.0) {
                    node.head = Some(member);
                }
            }
        }
        let node = self.collections.get_mut(coll.0)?;
        node.tail = Some(member);
        node.len += 1;
        Some(())
    }

    /// Unlinks a membership from its collection's list only. Cursors parked
    /// on it move to its successor.
    fn detach_from_collection(&mut self, member: MemberId) -> Option<()> {
        let (coll, prev, next) = {
            let node = self.members.get(member.0)?;
            (node.collection, node.prev, node.next)
        };

        if let Some(node) = self.collections.get(coll.0) {
            for id in &node.iterators {
                if let Some(cursor) = self.iterators.get_mut(id.0) {
                    if cursor.next == Some(member) {
                        cursor.next = next;
                    }
                }
            }
        }

        match prev.and_then(|p| self.members.get_mut(p.0)) {
            Some(before) => before.next = next,
            None => {
                if let Some(node) = self.collections.get_mut(coll.0) {
                    node.head = next;
                }
            }
        }
        match next.and_then(|n| self.members.get_mut(n.0)) {
            Some(after) => after.prev = prev,
            None => {
                if let Some(node) = self.collections.get_mut(coll.0) {
                    node.tail = prev;
                }
            }
        }
        if let Some(node) = self.collections.get_mut(coll.0) {
            node.len = node.len.saturating_sub(1);
        }
        if let Some(node) = self.members.get_mut(member.0) {
            node.prev = None;
            node.next = None;
        }
        Some(())
    }

    pub(crate) fn open_iterator(&mut self, coll: CollectionId) -> IteratorId {
        let next = self.head(coll);
        let id = IteratorId(self.iterators.insert(IteratorNode {
            collection: coll,
            next,
        }));
        if let Some(node) = self.collections.get_mut(coll.0) {
            node.iterators.push(id);
        }
        id
    }

    /// Returns the member a cursor was parked on and parks it on the
    /// successor recorded now. Condemned members are skipped.
    pub(crate) fn advance(&mut self, id: IteratorId) -> Option<(CollectibleId, Rc<dyn Any>)> {
        loop {
            let cursor = self.iterators.get(id.0)?;
            let member = cursor.next?;
            let Some(node) = self.members.get(member.0) else {
                if let Some(cursor) = self.iterators.get_mut(id.0) {
                    cursor.next = None;
                }
                return None;
            };
            let (next, item) = (node.next, node.collectible);
            if let Some(cursor) = self.iterators.get_mut(id.0) {
                cursor.next = next;
            }
            match self.collectibles.get(item.0) {
                Some(target) if target.object.is_valid() => {
                    return Some((item, Rc::clone(&target.host)));
                }
                _ => continue,
            }
        }
    }

    /// Stops every cursor of a collection.
    pub(crate) fn orphan_iterators(&mut self, coll: CollectionId) {
        let Some(node) = self.collections.get(coll.0) else {
            return;
        };
        for id in &node.iterators {
            if let Some(cursor) = self.iterators.get_mut(id.0) {
                cursor.next = None;
            }
        }
    }

    fn free_iterator(&mut self, id: IteratorId) {
        if let Some(cursor) = self.iterators.remove(id.0) {
            if let Some(node) = self.collections.get_mut(cursor.collection.0) {
                node.iterators.retain(|other| *other != id);
            }
        }
    }

    fn remove_collection(&mut self, id: CollectionId) -> Vec<Detached> {
        let mut leftovers = Vec::new();
        while let Some(member) = self.head(id) {
            match self.unlink(member) {
                Some(detached) => leftovers.push(detached),
                None => break,
            }
        }
        self.orphan_iterators(id);
        self.collections.remove(id.0);
        leftovers
    }

    fn remove_collectible(
        &mut self,
        id: CollectibleId,
    ) -> Option<(CollectibleNode, Vec<Detached>)> {
        let mut detached = Vec::new();
        while let Some(member) = self.collectible(id)?.collectors {
            match self.unlink(member) {
                Some(entry) => detached.push(entry),
                None => break,
            }
        }
        let node = self.collectibles.remove(id.0)?;
        Some((node, detached))
    }
}
