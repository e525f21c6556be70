//! [`Poller`] implementation over `mio::Poll`.

use crate::runtime::bus::{Event, Poller};
use crate::runtime::error::{Error, Result};
use crate::runtime::flags::Flags;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Default number of events fetched per poll.
const DEFAULT_EVENTS: usize = 1024;

pub struct MioPoller {
    poll: Poll,
    events: Events,
}

impl MioPoller {
    pub fn new() -> Result<Self> {
        let poll = Poll::new().map_err(|e| Error::os("failed to create poller", -1, &e))?;
        Ok(Self {
            poll,
            events: Events::with_capacity(DEFAULT_EVENTS),
        })
    }
}

impl Poller for MioPoller {
    fn register(&mut self, fd: RawFd) -> Result<()> {
        self.poll
            .registry()
            .register(
                &mut SourceFd(&fd),
                Token(fd as usize),
                Interest::READABLE | Interest::WRITABLE,
            )
            .map_err(|e| Error::os("failed to add file descriptor to poller", fd, &e))
    }

    fn deregister(&mut self, fd: RawFd) -> Result<()> {
        self.poll
            .registry()
            .deregister(&mut SourceFd(&fd))
            .map_err(|e| Error::os("failed to remove file descriptor from poller", fd, &e))
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        max_events: usize,
        ready: &mut Vec<Event>,
    ) -> Result<()> {
        let max_events = max_events.max(1);
        if self.events.capacity() != max_events {
            self.events = Events::with_capacity(max_events);
        }

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(wait_error(&e)),
        }

        ready.extend(
            self.events
                .iter()
                .map(|event| Event::new(event.token().0 as RawFd, flags_of(event))),
        );
        Ok(())
    }
}

/// A failed wait concerns no registered descriptor.
fn wait_error(err: &io::Error) -> Error {
    Error::os("poll wait error", -1, err)
}

fn flags_of(event: &mio::event::Event) -> Flags {
    let mut flags = Flags::EMPTY;
    if event.is_error() || (event.is_read_closed() && event.is_write_closed()) {
        flags |= Flags::ERROR;
    }
    if event.is_readable() {
        flags |= Flags::READABLE;
    }
    if event.is_writable() {
        flags |= Flags::WRITABLE;
    }
    flags
}
