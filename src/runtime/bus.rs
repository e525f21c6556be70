//! Reactor bus: descriptor interest registry and event dispatch.
//!
//! The bus maps each descriptor to an ordered list of callbacks and
//! dispatches readiness events to them, first the events reported by the
//! [`Poller`], then the synthetic events enqueued by callbacks.
//!
//! ## Removal
//!
//! Callbacks are never removed while a dispatch may be iterating them.
//! `del_fd_callbacks` and `del_fd` only mark the descriptor; the mark is
//! checked before every callback invocation and the marked registrations are
//! swept after each event. The sweep releases every borrow before dropping
//! the callbacks, because dropping them may close sockets that call back
//! into the bus.
//!
//! ## Synthetic events
//!
//! Edge-triggered polling only reports transitions. Callbacks that stop
//! short of exhausting readiness (a partial write, an accept that may have
//! siblings) enqueue a synthetic event to be called again. The queue is
//! swapped out and drained once per `wait_events`; events enqueued while
//! draining are delivered on the next call, after the next poll.

use crate::runtime::error::{Error, Result};
use crate::runtime::flags::Flags;
use crate::runtime::mio::MioPoller;
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;
use tracing::{error, trace};

/// A readiness notification for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub flags: Flags,
}

impl Event {
    pub fn new(fd: RawFd, flags: Flags) -> Self {
        Self { fd, flags }
    }
}

/// Callback invoked with the bus, the descriptor and its readiness flags.
pub type BusCallback = Box<dyn FnMut(&Rc<Bus>, RawFd, Flags) -> Result<()>>;

/// Receives errors returned by callbacks and poll failures.
pub type ErrorCallback<'a> = dyn FnMut(&Rc<Bus>, &Error) + 'a;

/// Readiness source behind the bus.
pub trait Poller {
    /// Subscribe `fd` for readable and writable readiness.
    fn register(&mut self, fd: RawFd) -> Result<()>;

    /// Stop watching `fd`.
    fn deregister(&mut self, fd: RawFd) -> Result<()>;

    /// Wait up to `timeout` (forever when `None`) and append at most
    /// `max_events` ready events to `ready`.
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        max_events: usize,
        ready: &mut Vec<Event>,
    ) -> Result<()>;
}

struct Registration {
    fd: RawFd,
    generation: u64,
    callbacks: Vec<Rc<RefCell<BusCallback>>>,
}

#[derive(Default)]
struct Registry {
    registrations: Slab<Registration>,
    by_fd: HashMap<RawFd, usize>,
    subscribed: HashSet<RawFd>,
    removed: HashSet<RawFd>,
}

/// Single-threaded event bus.
pub struct Bus {
    poller: RefCell<Box<dyn Poller>>,
    registry: RefCell<Registry>,
    queue: RefCell<VecDeque<Event>>,
    next_generation: Cell<u64>,
}

impl Bus {
    /// Create a bus backed by the platform poller.
    pub fn new() -> Result<Rc<Bus>> {
        Ok(Self::with_poller(Box::new(MioPoller::new()?)))
    }

    pub fn with_poller(poller: Box<dyn Poller>) -> Rc<Bus> {
        Rc::new(Bus {
            poller: RefCell::new(poller),
            registry: RefCell::new(Registry::default()),
            queue: RefCell::new(VecDeque::new()),
            next_generation: Cell::new(0),
        })
    }

    /// Ensure `fd` is subscribed with the poller and has a registration.
    ///
    /// If `fd` is marked for removal, the stale registration is discarded
    /// and a fresh one is started.
    pub fn add_fd(&self, fd: RawFd) -> Result<()> {
        self.registration_for(fd).map(|_| ())
    }

    /// Append `callback` to the callbacks of `fd`, subscribing it first if
    /// it is unseen.
    pub fn add_fd_callback(&self, fd: RawFd, callback: BusCallback) -> Result<()> {
        let key = self.registration_for(fd)?;
        let mut registry = self.registry.borrow_mut();
        registry.registrations[key]
            .callbacks
            .push(Rc::new(RefCell::new(callback)));
        Ok(())
    }

    /// Mark every callback of `fd` for removal; the poller subscription
    /// stays.
    pub fn del_fd_callbacks(&self, fd: RawFd) {
        trace!(fd, "callbacks marked for removal");
        self.registry.borrow_mut().removed.insert(fd);
    }

    /// Mark `fd` for removal and unsubscribe it from the poller now.
    pub fn del_fd(&self, fd: RawFd) -> Result<()> {
        let was_subscribed = {
            let mut registry = self.registry.borrow_mut();
            registry.removed.insert(fd);
            registry.subscribed.remove(&fd)
        };
        if was_subscribed {
            if let Err(e) = self.poller.borrow_mut().deregister(fd) {
                self.registry.borrow_mut().subscribed.insert(fd);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Queue a synthetic event, delivered after the next poll.
    pub fn enqueue_event(&self, fd: RawFd, flags: Flags) {
        trace!(fd, %flags, "event enqueued");
        self.queue.borrow_mut().push_back(Event::new(fd, flags));
    }

    /// Poll once, dispatch the ready events, then drain the synthetic
    /// events queued so far.
    ///
    /// Errors returned by callbacks, and a failing poll, are handed to
    /// `on_error` and never abort the pass.
    pub fn wait_events(
        self: &Rc<Self>,
        timeout: Option<Duration>,
        max_events: usize,
        on_error: &mut ErrorCallback<'_>,
    ) {
        // Queued work is never re-signalled by the poller; don't block on it.
        let timeout = if self.queue.borrow().is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };
        let mut ready = Vec::new();
        let polled = self
            .poller
            .borrow_mut()
            .poll(timeout, max_events, &mut ready);
        if let Err(e) = polled {
            error!(error = %e, "poll failed");
            on_error(self, &e);
        }

        for event in ready {
            self.dispatch(event, on_error);
        }

        let queued = mem::take(&mut *self.queue.borrow_mut());
        for event in queued {
            self.dispatch(event, on_error);
        }
    }

    /// Number of synthetic events waiting for the next drain.
    pub fn pending_events(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Whether `fd` has a registration that is not marked for removal.
    pub fn is_registered(&self, fd: RawFd) -> bool {
        let registry = self.registry.borrow();
        !registry.removed.contains(&fd) && registry.by_fd.contains_key(&fd)
    }

    /// Number of live registrations.
    pub fn registrations(&self) -> usize {
        let registry = self.registry.borrow();
        registry
            .registrations
            .iter()
            .filter(|(_, r)| !registry.removed.contains(&r.fd))
            .count()
    }

    fn registration_for(&self, fd: RawFd) -> Result<usize> {
        let stale = {
            let mut registry = self.registry.borrow_mut();
            if registry.removed.remove(&fd) {
                registry
                    .by_fd
                    .remove(&fd)
                    .map(|key| registry.registrations.remove(key))
            } else {
                None
            }
        };
        drop(stale);

        let needs_subscribe = !self.registry.borrow().subscribed.contains(&fd);
        if needs_subscribe {
            self.poller.borrow_mut().register(fd)?;
            self.registry.borrow_mut().subscribed.insert(fd);
        }

        let mut registry = self.registry.borrow_mut();
        if let Some(&key) = registry.by_fd.get(&fd) {
            return Ok(key);
        }
        let generation = self.next_generation.get();
        self.next_generation.set(generation + 1);
        let key = registry.registrations.insert(Registration {
            fd,
            generation,
            callbacks: Vec::new(),
        });
        registry.by_fd.insert(fd, key);
        Ok(key)
    }

    fn is_live(&self, fd: RawFd, key: usize, generation: u64) -> bool {
        let registry = self.registry.borrow();
        !registry.removed.contains(&fd)
            && registry.by_fd.get(&fd) == Some(&key)
            && registry
                .registrations
                .get(key)
                .is_some_and(|r| r.generation == generation)
    }

    fn dispatch(self: &Rc<Self>, event: Event, on_error: &mut ErrorCallback<'_>) {
        let Event { fd, flags } = event;
        let snapshot = {
            let registry = self.registry.borrow();
            if registry.removed.contains(&fd) {
                None
            } else {
                registry.by_fd.get(&fd).map(|&key| {
                    let registration = &registry.registrations[key];
                    (key, registration.generation, registration.callbacks.clone())
                })
            }
        };

        if let Some((key, generation, callbacks)) = snapshot {
            trace!(fd, %flags, callbacks = callbacks.len(), "dispatch");
            for callback in &callbacks {
                if !self.is_live(fd, key, generation) {
                    break;
                }
                let result = (&mut *callback.borrow_mut())(self, fd, flags);
                if let Err(e) = result {
                    on_error(self, &e);
                }
            }
        }

        self.sweep();
    }

    fn sweep(&self) {
        let dropped: Vec<Registration> = {
            let mut registry = self.registry.borrow_mut();
            if registry.removed.is_empty() {
                return;
            }
            let removed: Vec<RawFd> = registry.removed.drain().collect();
            let mut dropped = Vec::with_capacity(removed.len());
            for fd in removed {
                if let Some(key) = registry.by_fd.remove(&fd) {
                    dropped.push(registry.registrations.remove(key));
                }
            }
            dropped
        };
        drop(dropped);
    }
}
