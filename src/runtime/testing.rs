//! Scripted stand-ins for the poller and for sockets.

use crate::runtime::bus::{Bus, Event, Poller};
use crate::runtime::error::{Error, Result};
use crate::runtime::object::{IoObject, Readable, Writable};
use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

#[derive(Default)]
struct PollerState {
    registered: HashSet<RawFd>,
    register_calls: usize,
    deregister_calls: usize,
    batches: VecDeque<Vec<Event>>,
    fail_next: bool,
    last_timeout: Option<Option<Duration>>,
}

/// Poller returning pre-scripted batches of events, one batch per poll.
#[derive(Clone, Default)]
pub(crate) struct MockPoller {
    state: Rc<RefCell<PollerState>>,
}

impl MockPoller {
    pub fn push(&self, events: Vec<Event>) {
        self.state.borrow_mut().batches.push_back(events);
    }

    pub fn fail_next_poll(&self) {
        self.state.borrow_mut().fail_next = true;
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.state.borrow().registered.contains(&fd)
    }

    /// Timeout given to the most recent poll, if any poll happened.
    pub fn last_timeout(&self) -> Option<Option<Duration>> {
        self.state.borrow().last_timeout
    }

    pub fn register_calls(&self) -> usize {
        self.state.borrow().register_calls
    }

    pub fn deregister_calls(&self) -> usize {
        self.state.borrow().deregister_calls
    }
}

impl Poller for MockPoller {
    fn register(&mut self, fd: RawFd) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.register_calls += 1;
        state.registered.insert(fd);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.deregister_calls += 1;
        if state.registered.remove(&fd) {
            Ok(())
        } else {
            Err(Error::Os {
                context: "failed to remove file descriptor from poller",
                fd,
                errno: libc::ENOENT,
            })
        }
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        max_events: usize,
        ready: &mut Vec<Event>,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.last_timeout = Some(timeout);
        if state.fail_next {
            state.fail_next = false;
            return Err(Error::Os {
                context: "poll wait error",
                fd: -1,
                errno: libc::EBADF,
            });
        }
        if let Some(batch) = state.batches.pop_front() {
            ready.extend(batch.into_iter().take(max_events));
        }
        Ok(())
    }
}

/// Fake socket: reads come from a script, writes are captured.
pub(crate) struct MockObject {
    fd: RawFd,
    bus: Weak<Bus>,
    reads: RefCell<VecDeque<Result<Vec<u8>>>>,
    written: RefCell<Vec<u8>>,
    write_limit: Cell<usize>,
    write_calls: Cell<usize>,
    fail_writes: Cell<bool>,
}

impl MockObject {
    pub fn new(bus: &Rc<Bus>, fd: RawFd) -> Rc<Self> {
        Rc::new(Self {
            fd,
            bus: Rc::downgrade(bus),
            reads: RefCell::new(VecDeque::new()),
            written: RefCell::new(Vec::new()),
            write_limit: Cell::new(usize::MAX),
            write_calls: Cell::new(0),
            fail_writes: Cell::new(false),
        })
    }

    /// Queue the result of the next read.
    pub fn push_read(&self, bytes: &[u8]) {
        self.reads.borrow_mut().push_back(Ok(bytes.to_vec()));
    }

    pub fn push_read_error(&self, err: Error) {
        self.reads.borrow_mut().push_back(Err(err));
    }

    pub fn set_write_limit(&self, limit: usize) {
        self.write_limit.set(limit);
    }

    pub fn fail_writes(&self) {
        self.fail_writes.set(true);
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.borrow().clone()
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.get()
    }
}

impl IoObject for MockObject {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn bus(&self) -> Option<Rc<Bus>> {
        self.bus.upgrade()
    }
}

impl Readable for MockObject {
    fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        let mut reads = self.reads.borrow_mut();
        match reads.pop_front() {
            None => Ok(0),
            Some(Err(e)) => Err(e),
            Some(Ok(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    reads.push_front(Ok(bytes[n..].to_vec()));
                }
                Ok(n)
            }
        }
    }
}

impl Writable for MockObject {
    fn write_some(&self, buf: &[u8]) -> Result<usize> {
        self.write_calls.set(self.write_calls.get() + 1);
        if self.fail_writes.get() {
            return Err(Error::Os {
                context: "send failed",
                fd: self.fd,
                errno: libc::EPIPE,
            });
        }
        let n = buf.len().min(self.write_limit.get());
        self.written.borrow_mut().extend_from_slice(&buf[..n]);
        Ok(n)
    }
}
