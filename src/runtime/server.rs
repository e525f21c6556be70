//! Accept loop glue: every accepted connection becomes a started session.

use crate::runtime::acceptor::Acceptor;
use crate::runtime::bus::Bus;
use crate::runtime::error::Result;
use crate::runtime::flags::Flags;
use crate::runtime::session::Session;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::rc::Rc;
use tracing::debug;

/// Builds the session for one accepted connection.
pub type SessionFactory = Box<dyn FnMut(&Rc<Bus>, OwnedFd, SocketAddr) -> Result<Session>>;

pub struct Server {
    acceptor: Rc<Acceptor>,
}

impl Server {
    pub fn new(acceptor: Rc<Acceptor>, mut factory: SessionFactory) -> Self {
        acceptor.set_handler(Box::new(move |bus, fd, peer| {
            let client_fd = fd.as_raw_fd();
            let session = factory(bus, fd, peer)?.start(bus)?;
            debug!(fd = client_fd, peer = %peer, fds = ?session.fds(), "session started");
            // Bytes may have arrived before the descriptor was registered.
            bus.enqueue_event(client_fd, Flags::READABLE);
            Ok(())
        }));
        Self { acceptor }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }
}
