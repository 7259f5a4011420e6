//! Signal bus
//!
//! Named publish/subscribe channels with per-subscription identity filters
//! and per-subscription timeouts. Timeouts are the only way scheduled work
//! enters the runtime: `SignalBus::poll` sweeps them once per tick.

pub mod bus;
pub mod clock;
pub mod registration;

pub use bus::{ChannelRef, SignalBus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use registration::{Registration, SignalGroup, Subscription};

use std::os::fd::RawFd;
use std::rc::Rc;

/// Value carried by a raise and matched by subscription filters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Identity(pub u64);

impl Identity {
    pub fn from_fd(fd: RawFd) -> Self {
        Identity(fd as u64)
    }
}

/// What a callback is told about the signal it is handling.
#[derive(Debug, Clone, Copy)]
pub struct Raised<'a> {
    pub name: &'a str,
    pub value: Identity,
    /// Set when the call comes from a timeout sweep rather than a raise.
    pub timed_out: bool,
}

pub type SignalCallback = Rc<dyn Fn(&Raised<'_>)>;
