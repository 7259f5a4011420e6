//! Module `bus`
//!
//! Defines `SignalBus`, a set of named channels, and `ChannelRef`, a counted
//! external reference that keeps a channel alive without subscribing to it.
//! A channel with no registrations and no external references reaps itself.

use log::{debug, warn};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::collection::{Collectible, Collection, Policy, Store};
use crate::error::SignalError;
use crate::signal::registration::{Registration, SignalGroup, Subscription};
use crate::signal::{Clock, Identity, Raised};

pub(crate) struct Channel {
    name: String,
    pub(crate) registrations: Collection<Subscription>,
    refs: Cell<usize>,
}

pub(crate) struct BusInner {
    label: String,
    store: Rc<Store>,
    pub(crate) clock: Rc<dyn Clock>,
    channels: RefCell<HashMap<String, Rc<Channel>>>,
    valid: Cell<bool>,
}

impl BusInner {
    pub(crate) fn channel(&self, name: &str) -> Option<Rc<Channel>> {
        self.channels.borrow().get(name).cloned()
    }

    /// Frees `name` if nothing references or subscribes to it any more.
    pub(crate) fn reap(&self, name: &str) {
        let idle = self
            .channel(name)
            .is_some_and(|channel| channel.refs.get() == 0 && channel.registrations.is_empty());
        if !idle {
            return;
        }
        let channel = self.channels.borrow_mut().remove(name);
        if let Some(channel) = channel {
            channel.registrations.destroy();
            debug!("Signal channel {}/{} reaped", self.label, name);
        }
    }
}

/// Handle onto a named group of signal channels.
#[derive(Clone)]
pub struct SignalBus {
    inner: Rc<BusInner>,
}

impl SignalBus {
    pub fn new(label: &str, store: &Rc<Store>, clock: Rc<dyn Clock>) -> Self {
        Self {
            inner: Rc::new(BusInner {
                label: label.to_string(),
                store: Rc::clone(store),
                clock,
                channels: RefCell::new(HashMap::new()),
                valid: Cell::new(true),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn store(&self) -> &Rc<Store> {
        &self.inner.store
    }

    pub fn is_valid(&self) -> bool {
        self.inner.valid.get()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.borrow().len()
    }

    /// Looks up a channel, creating it when `create` is set.
    pub fn get(&self, name: &str, create: bool) -> Option<ChannelRef> {
        if !self.is_valid() {
            warn!("Channel lookup {} on destroyed bus {}", name, self.label());
            return None;
        }
        let channel = match self.inner.channel(name) {
            Some(channel) => channel,
            None if create => {
                let channel = Rc::new(Channel {
                    name: name.to_string(),
                    registrations: Collection::new(&self.inner.store, Policy::Cascade),
                    refs: Cell::new(0),
                });
                self.inner
                    .channels
                    .borrow_mut()
                    .insert(name.to_string(), Rc::clone(&channel));
                debug!("Signal channel {}/{} created", self.label(), name);
                channel
            }
            None => return None,
        };
        Some(ChannelRef::new(channel, Rc::downgrade(&self.inner)))
    }

    /// Subscribes `callback` to channel `name`, recording the registration in
    /// `group` so the owner can clear all of its registrations at once.
    pub fn add(
        &self,
        group: &SignalGroup,
        name: &str,
        callback: impl Fn(&Raised<'_>) + 'static,
    ) -> Result<Registration, SignalError> {
        let Some(channel) = self.get(name, true) else {
            return Err(SignalError::BusDestroyed(self.label().to_string()));
        };

        let subscription = Subscription::new(
            name,
            Rc::downgrade(&self.inner),
            Rc::new(callback),
            self.inner.clock.now(),
        );
        let bus = Rc::downgrade(&self.inner);
        let channel_name = name.to_string();
        let item = Collectible::with_destructor(&self.inner.store, subscription, move |_| {
            if let Some(bus) = bus.upgrade() {
                bus.reap(&channel_name);
            }
        });

        if let Err(e) = channel.channel.registrations.add(&item) {
            warn!("Signal add {}/{} failed: {}", self.label(), name, e);
            item.destroy();
            return Err(e.into());
        }
        let registration = Registration::from_item(item);
        if let Err(e) = group.members().add(registration.item()) {
            warn!("Signal group rejected registration on {}: {}", name, e);
            registration.delete();
            return Err(e.into());
        }
        Ok(registration)
    }

    /// Raises `name` with `value`. Returns the number of callbacks invoked.
    pub fn raise(&self, name: &str, value: Identity) -> usize {
        match self.get(name, false) {
            Some(channel) => channel.raise(value),
            None => {
                if self.is_valid() {
                    warn!("Raise of unknown channel {}/{}", self.label(), name);
                }
                0
            }
        }
    }

    /// Runs the timeout sweep. Returns the number of timeout callbacks run.
    pub fn poll(&self) -> usize {
        if !self.is_valid() {
            return 0;
        }
        let channels: Vec<Rc<Channel>> = self.inner.channels.borrow().values().cloned().collect();
        let mut fired = 0;
        for channel in channels {
            let pinned = ChannelRef::new(channel, Rc::downgrade(&self.inner));
            let name = pinned.channel.name.clone();
            pinned.channel.registrations.iterate(|item| {
                if item.check_timeout(&name, self.inner.clock.now()) {
                    fired += 1;
                }
                self.is_valid()
            });
        }
        fired
    }

    /// Destroys every channel and every registration on them.
    pub fn destroy(&self) {
        if !self.inner.valid.replace(false) {
            return;
        }
        let channels: Vec<Rc<Channel>> = self
            .inner
            .channels
            .borrow_mut()
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        debug!(
            "Signal bus {} destroyed with {} channels",
            self.label(),
            channels.len()
        );
        for channel in channels {
            channel.registrations.destroy();
        }
    }
}

impl fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalBus")
            .field("label", &self.inner.label)
            .field("channels", &self.channel_count())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Counted reference to one channel of a bus.
pub struct ChannelRef {
    channel: Rc<Channel>,
    bus: Weak<BusInner>,
}

impl ChannelRef {
    fn new(channel: Rc<Channel>, bus: Weak<BusInner>) -> Self {
        channel.refs.set(channel.refs.get() + 1);
        Self { channel, bus }
    }

    pub fn name(&self) -> &str {
        &self.channel.name
    }

    /// Number of live registrations on the channel.
    pub fn subscribers(&self) -> usize {
        self.channel.registrations.len()
    }

    /// Invokes every registration whose filter is unset or equals `value`.
    ///
    /// Each registration is locked around its callback, so callbacks may
    /// delete themselves or any sibling.
    pub fn raise(&self, value: Identity) -> usize {
        let Some(bus) = self.bus.upgrade() else {
            warn!("Raise of {} after its bus was dropped", self.name());
            return 0;
        };
        if !bus.valid.get() {
            warn!("Raise of {} on destroyed bus {}", self.name(), bus.label);
            return 0;
        }
        let raised = Raised {
            name: &self.channel.name,
            value,
            timed_out: false,
        };
        let mut fired = 0;
        self.channel.registrations.iterate(|item| {
            if item.matches(value) {
                item.fire(&raised, bus.clock.now());
                fired += 1;
            }
            bus.valid.get()
        });
        fired
    }
}

impl Clone for ChannelRef {
    fn clone(&self) -> Self {
        Self::new(Rc::clone(&self.channel), self.bus.clone())
    }
}

impl Drop for ChannelRef {
    fn drop(&mut self) {
        self.channel.refs.set(self.channel.refs.get().saturating_sub(1));
        if let Some(bus) = self.bus.upgrade() {
            if bus.valid.get() {
                bus.reap(&self.channel.name);
            }
        }
    }
}

impl fmt::Debug for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRef")
            .field("name", &self.channel.name)
            .field("refs", &self.channel.refs.get())
            .finish()
    }
}
