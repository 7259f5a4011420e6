//! Module `registration`
//!
//! Defines the subscription record stored on a channel, the `Registration`
//! handle returned to subscribers, and `SignalGroup`, the per-owner set of
//! registrations cleared together on teardown.

use log::debug;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::collection::{Collectible, Collection, Policy, Store};
use crate::signal::bus::BusInner;
use crate::signal::{Identity, Raised, SignalCallback};

struct Timeout {
    window: Duration,
    callback: SignalCallback,
}

/// One callback bound to one channel.
pub struct Subscription {
    channel: String,
    bus: Weak<BusInner>,
    callback: SignalCallback,
    filter: Cell<Option<Identity>>,
    timeout: RefCell<Option<Timeout>>,
    last_fired: Cell<Instant>,
}

impl Subscription {
    pub(crate) fn new(
        channel: &str,
        bus: Weak<BusInner>,
        callback: SignalCallback,
        now: Instant,
    ) -> Self {
        Self {
            channel: channel.to_string(),
            bus,
            callback,
            filter: Cell::new(None),
            timeout: RefCell::new(None),
            last_fired: Cell::new(now),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn filter(&self) -> Option<Identity> {
        self.filter.get()
    }

    pub(crate) fn matches(&self, value: Identity) -> bool {
        self.filter.get().is_none_or(|filter| filter == value)
    }

    pub(crate) fn fire(&self, raised: &Raised<'_>, now: Instant) {
        self.last_fired.set(now);
        (self.callback)(raised);
    }

    /// Runs the timeout callback if the window elapsed since the last
    /// firing, then restarts the window.
    pub(crate) fn check_timeout(&self, name: &str, now: Instant) -> bool {
        let callback = match &*self.timeout.borrow() {
            Some(timeout) if now.duration_since(self.last_fired.get()) >= timeout.window => {
                Rc::clone(&timeout.callback)
            }
            _ => return false,
        };
        self.last_fired.set(now);
        callback(&Raised {
            name,
            value: self.filter.get().unwrap_or_default(),
            timed_out: true,
        });
        true
    }

    fn now(&self) -> Instant {
        self.bus
            .upgrade()
            .map_or_else(Instant::now, |bus| bus.clock.now())
    }
}

/// Handle returned by `SignalBus::add`.
#[derive(Clone)]
pub struct Registration {
    item: Collectible<Subscription>,
}

impl Registration {
    pub(crate) fn from_item(item: Collectible<Subscription>) -> Self {
        Self { item }
    }

    pub(crate) fn item(&self) -> &Collectible<Subscription> {
        &self.item
    }

    pub fn channel(&self) -> &str {
        &self.item.channel
    }

    pub fn is_valid(&self) -> bool {
        self.item.is_valid()
    }

    /// Only fire for raises carrying `identity`.
    pub fn filter(&self, identity: Identity) -> &Self {
        self.item.filter.set(Some(identity));
        self
    }

    /// Calls `callback` whenever `window` passes without this registration
    /// firing. The window starts now.
    pub fn timeout(&self, window: Duration, callback: impl Fn(&Raised<'_>) + 'static) -> &Self {
        *self.item.timeout.borrow_mut() = Some(Timeout {
            window,
            callback: Rc::new(callback),
        });
        self.item.last_fired.set(self.item.now());
        self
    }

    /// Restarts the timeout window as if the registration had just fired.
    pub fn rearm(&self) -> &Self {
        self.item.last_fired.set(self.item.now());
        self
    }

    pub fn clear_timeout(&self) -> &Self {
        self.item.timeout.borrow_mut().take();
        self
    }

    /// Unsubscribes. Safe to call from inside the registration's own
    /// callback; teardown then completes once the callback returns.
    pub fn delete(&self) -> bool {
        if !self.item.is_valid() {
            return false;
        }
        self.item.destroy();
        if let Some(bus) = self.item.bus.upgrade() {
            if let Some(channel) = bus.channel(&self.item.channel) {
                // The channel's cascade membership is what keeps the record
                // alive; dropping it completes the teardown.
                let _ = channel.registrations.delete(&self.item);
            }
        }
        true
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("channel", &self.item.channel)
            .field("filter", &self.item.filter.get())
            .finish()
    }
}

/// The registrations one owner made, across any number of channels and buses.
#[derive(Clone, Debug)]
pub struct SignalGroup {
    members: Collection<Subscription>,
}

impl SignalGroup {
    pub fn new(store: &Rc<Store>) -> Self {
        Self {
            members: Collection::new(store, Policy::Plain),
        }
    }

    pub(crate) fn members(&self) -> &Collection<Subscription> {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Deletes every registration in the group.
    pub fn clear(&self) -> usize {
        self.clear_matching(|_| true)
    }

    /// Deletes the group's registrations on `name` filtered on `identity`.
    pub fn clear_with_filter(&self, name: &str, identity: Identity) -> usize {
        self.clear_matching(|subscription| {
            subscription.channel == name && subscription.filter.get() == Some(identity)
        })
    }

    /// Clears the group and releases it.
    pub fn destroy(&self) {
        self.clear();
        self.members.destroy();
    }

    fn clear_matching(&self, mut predicate: impl FnMut(&Subscription) -> bool) -> usize {
        let mut cleared = 0;
        for item in self.members.to_vec() {
            if predicate(&item) && Registration::from_item(item).delete() {
                cleared += 1;
            }
        }
        if cleared > 0 {
            debug!("Signal group cleared {} registrations", cleared);
        }
        cleared
    }
}
