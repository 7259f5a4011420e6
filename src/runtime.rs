//! Module `runtime`
//!
//! Defines `Runtime`, the context that owns the process-wide pieces of the
//! event loop: the collection store, the reactor, the clock and the lazily
//! created named signal buses.

use log::{debug, info};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use crate::collection::Store;
use crate::reactor::Reactor;
use crate::signal::{Clock, SignalBus, SystemClock};

pub struct Runtime {
    store: Rc<Store>,
    clock: Rc<dyn Clock>,
    reactor: Reactor,
    buses: RefCell<HashMap<String, SignalBus>>,
}

impl Runtime {
    pub fn new(poll_batch_size: usize) -> Self {
        Self::with_clock(poll_batch_size, Rc::new(SystemClock))
    }

    pub fn with_clock(poll_batch_size: usize, clock: Rc<dyn Clock>) -> Self {
        let store = Store::new();
        let reactor = Reactor::new(&store, Rc::clone(&clock), poll_batch_size);
        Self {
            store,
            clock,
            reactor,
            buses: RefCell::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Rc<Store> {
        &self.store
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn clock(&self) -> Rc<dyn Clock> {
        Rc::clone(&self.clock)
    }

    /// Named bus for a subsystem, created on first use.
    pub fn bus(&self, name: &str) -> SignalBus {
        self.buses
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Signal bus {} created", name);
                SignalBus::new(name, &self.store, Rc::clone(&self.clock))
            })
            .clone()
    }

    /// One pass of the main loop: reactor dispatch, timeout sweeps of the
    /// named buses, then iterator garbage collection.
    pub fn tick(&self) -> usize {
        let mut processed = self.reactor.poll();
        let buses: Vec<SignalBus> = self.buses.borrow().values().cloned().collect();
        for bus in buses {
            processed += bus.poll();
        }
        self.store.collect_garbage();
        processed
    }

    /// Ticks every `tick_delay` until `keep_running` returns false.
    pub fn run(&self, tick_delay: Duration, mut keep_running: impl FnMut(&Runtime) -> bool) {
        info!("Runtime loop started ({:?} tick)", tick_delay);
        while keep_running(self) {
            self.tick();
            thread::sleep(tick_delay);
        }
        info!("Runtime loop stopped");
    }

    /// Tears down every monitor and bus.
    pub fn shutdown(&self) {
        self.reactor.shutdown();
        let buses: Vec<SignalBus> = self.buses.borrow_mut().drain().map(|(_, bus)| bus).collect();
        for bus in buses {
            bus.destroy();
        }
        self.store.collect_garbage();
        info!("Runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Identity, ManualClock, SignalGroup};
    use std::cell::Cell;

    #[test]
    fn test_bus_is_created_once() {
        let runtime = Runtime::new(8);
        let first = runtime.bus("proxy");
        let group = SignalGroup::new(runtime.store());
        let hits = Rc::new(Cell::new(0));
        let seen = Rc::clone(&hits);
        first
            .add(&group, "ready", move |_| seen.set(seen.get() + 1))
            .unwrap();

        assert_eq!(runtime.bus("proxy").raise("ready", Identity(1)), 1);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_tick_sweeps_named_bus_timeouts() {
        let clock = Rc::new(ManualClock::new());
        let runtime = Runtime::with_clock(8, clock.clone());
        let group = SignalGroup::new(runtime.store());
        let fired = Rc::new(Cell::new(0));
        let seen = Rc::clone(&fired);
        runtime
            .bus("mirror")
            .add(&group, "heartbeat", |_| {})
            .unwrap()
            .timeout(Duration::from_secs(5), move |_| seen.set(seen.get() + 1));

        assert_eq!(runtime.tick(), 0);
        clock.advance(Duration::from_secs(6));
        assert_eq!(runtime.tick(), 1);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_run_stops_when_asked() {
        let runtime = Runtime::new(8);
        let mut ticks = 0;
        runtime.run(Duration::from_millis(1), |_| {
            ticks += 1;
            ticks <= 3
        });
        assert_eq!(ticks, 4);
    }

    #[test]
    fn test_shutdown_destroys_buses() {
        let runtime = Runtime::new(8);
        let bus = runtime.bus("irc");
        runtime.shutdown();
        assert!(!bus.is_valid());
        assert!(!runtime.reactor().is_valid());
    }
}
