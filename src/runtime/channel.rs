//! One-directional byte pump between two I/O objects.
//!
//! A channel reads from its input into a [`BipBuffer`] when the input is
//! readable and drains the buffer into its output right away, then again
//! whenever the output becomes writable. Inspection handlers see the raw
//! result of every read before the bytes are committed to the buffer.
//!
//! Edge-triggered readiness is re-armed with synthetic events: writable on
//! the output while bytes remain buffered, readable on the input after a
//! read that filled a whole chunk or after a read deferred for lack of
//! space once the drain frees some.
//!
//! Input and output may be the same object (an echo loopback).

use crate::runtime::buffer::BipBuffer;
use crate::runtime::bus::Bus;
use crate::runtime::error::{Error, Result};
use crate::runtime::flags::Flags;
use crate::runtime::object::{Readable, Writable};
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Bytes requested from the input per read.
pub const CHUNK_SIZE: usize = 64 * 1024 - 1;

/// Bytes delivered by one successful read.
#[derive(Debug)]
pub struct Received<'a> {
    pub fd: RawFd,
    pub data: &'a [u8],
}

/// What inspection handlers are given for each read attempt.
pub type InputResult<'a> = std::result::Result<Received<'a>, Error>;

type InputHandler = Box<dyn FnMut(&Rc<Bus>, &InputResult<'_>)>;

pub struct Channel {
    input: Rc<dyn Readable>,
    output: Rc<dyn Writable>,
    buffer: RefCell<BipBuffer>,
    chunk: usize,
    read_deferred: Cell<bool>,
    handlers: RefCell<Vec<InputHandler>>,
}

impl Channel {
    /// Create a channel with the default chunk size and arm it on the bus.
    pub fn open(input: Rc<dyn Readable>, output: Rc<dyn Writable>) -> Result<Rc<Channel>> {
        Self::open_with_chunk(input, output, CHUNK_SIZE)
    }

    /// Like [`Channel::open`], reading at most `chunk` bytes at a time into
    /// a buffer holding two chunks.
    pub fn open_with_chunk(
        input: Rc<dyn Readable>,
        output: Rc<dyn Writable>,
        chunk: usize,
    ) -> Result<Rc<Channel>> {
        let channel = Rc::new(Channel {
            input,
            output,
            buffer: RefCell::new(BipBuffer::new(2 * chunk)),
            chunk,
            read_deferred: Cell::new(false),
            handlers: RefCell::new(Vec::new()),
        });
        channel.start()?;
        Ok(channel)
    }

    fn start(self: &Rc<Self>) -> Result<()> {
        let this = Rc::clone(self);
        self.input.add_bus_callback(Box::new(move |bus, fd, flags| {
            this.on_input_event(bus, fd, flags);
            Ok(())
        }))?;

        let this = Rc::clone(self);
        self.output.add_bus_callback(Box::new(move |bus, fd, flags| {
            this.on_output_event(bus, fd, flags);
            Ok(())
        }))
    }

    /// Add an inspection handler; handlers run in insertion order.
    pub fn add_handler<F>(&self, handler: F)
    where
        F: FnMut(&Rc<Bus>, &InputResult<'_>) + 'static,
    {
        self.handlers.borrow_mut().push(Box::new(handler));
    }

    pub fn input_fd(&self) -> RawFd {
        self.input.fd()
    }

    pub fn output_fd(&self) -> RawFd {
        self.output.fd()
    }

    /// Bytes read but not yet written.
    pub fn buffered(&self) -> usize {
        self.buffer.borrow().len()
    }

    fn on_input_event(&self, bus: &Rc<Bus>, fd: RawFd, flags: Flags) {
        if flags.contains(Flags::ERROR) {
            trace!(fd, %flags, "input error event");
        }
        if !flags.contains(Flags::READABLE) {
            return;
        }
        self.fill(bus, fd);
        self.drain(bus);
    }

    fn on_output_event(&self, bus: &Rc<Bus>, _fd: RawFd, flags: Flags) {
        if !flags.contains(Flags::WRITABLE) {
            return;
        }
        self.drain(bus);
    }

    fn fill(&self, bus: &Rc<Bus>, fd: RawFd) {
        let mut buffer = self.buffer.borrow_mut();
        let Some(region) = buffer.write_acquire(self.chunk) else {
            trace!(fd, "buffer full, read deferred");
            self.read_deferred.set(true);
            return;
        };

        let result = match self.input.read_some(region) {
            Ok(n) => Ok(Received {
                fd,
                data: &region[..n],
            }),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            match e {
                Error::PeerClosed { .. } => debug!(fd, "peer closed input"),
                _ => warn!(fd, error = %e, "read failed"),
            }
            bus.enqueue_event(fd, Flags::ERROR);
        }

        for handler in self.handlers.borrow_mut().iter_mut() {
            handler(bus, &result);
        }

        let read = result.as_ref().map_or(0, |received| received.data.len());
        drop(result);
        buffer.write_release(read);

        // A full chunk means the input may hold more than one read took.
        if read == self.chunk {
            bus.enqueue_event(fd, Flags::READABLE);
        }
    }

    fn drain(&self, bus: &Rc<Bus>) {
        let mut buffer = self.buffer.borrow_mut();
        let pending = buffer.read_acquire();
        if pending.is_empty() {
            return;
        }

        match self.output.write_some(pending) {
            Ok(sent) => {
                buffer.read_release(sent);
                if !buffer.is_empty() {
                    bus.enqueue_event(self.output.fd(), Flags::WRITABLE);
                }
                if sent > 0 && self.read_deferred.replace(false) {
                    bus.enqueue_event(self.input.fd(), Flags::READABLE);
                }
            }
            Err(e) => warn!(fd = self.output.fd(), error = %e, "write failed"),
        }
    }
}
