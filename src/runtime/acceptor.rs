//! Listening socket that hands accepted connections to a handler.

use crate::runtime::bus::Bus;
use crate::runtime::endpoint::Endpoint;
use crate::runtime::error::{is_transient, Error, Result};
use crate::runtime::flags::Flags;
use crate::runtime::object::IoObject;
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use tracing::{debug, error, warn};

/// Receives each accepted connection: the bus, the new descriptor (already
/// non-blocking) and the peer address.
pub type AcceptHandler = Box<dyn FnMut(&Rc<Bus>, OwnedFd, SocketAddr) -> Result<()>>;

pub struct Acceptor {
    fd: RawFd,
    bus: Weak<Bus>,
    listener: Socket,
    local_addr: SocketAddr,
    handler: RefCell<Option<AcceptHandler>>,
}

impl Acceptor {
    /// Bind and listen on the first resolved address of `endpoint`.
    pub fn bind(bus: &Rc<Bus>, endpoint: &Endpoint, backlog: i32) -> Result<Rc<Acceptor>> {
        let addr = endpoint.resolve()?[0];
        let listener = listen(addr, backlog)?;
        let fd = listener.as_raw_fd();
        let local_addr = listener
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(addr);

        let acceptor = Rc::new(Acceptor {
            fd,
            bus: Rc::downgrade(bus),
            listener,
            local_addr,
            handler: RefCell::new(None),
        });

        let weak = Rc::downgrade(&acceptor);
        acceptor.add_bus_callback(Box::new(move |bus, _fd, flags| match weak.upgrade() {
            Some(acceptor) => acceptor.on_event(bus, flags),
            None => Ok(()),
        }))?;

        debug!(fd, addr = %local_addr, backlog, "listening");
        Ok(acceptor)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Install the handler receiving accepted connections.
    pub fn set_handler(&self, handler: AcceptHandler) {
        *self.handler.borrow_mut() = Some(handler);
    }

    fn on_event(&self, bus: &Rc<Bus>, flags: Flags) -> Result<()> {
        if flags.contains(Flags::ERROR) {
            let errno = match self.listener.take_error() {
                Ok(Some(e)) => e.raw_os_error().unwrap_or(0),
                _ => 0,
            };
            return Err(Error::Os {
                context: "failed to accept",
                fd: self.fd,
                errno,
            });
        }
        if !flags.contains(Flags::READABLE) {
            return Ok(());
        }

        match self.listener.accept() {
            Ok((socket, addr)) => {
                // Edge-triggered: more connections may already be queued.
                bus.enqueue_event(self.fd, Flags::READABLE);
                let conn_fd = socket.as_raw_fd();
                socket
                    .set_nonblocking(true)
                    .map_err(|e| Error::os("failed to make socket non-blocking", conn_fd, &e))?;
                let peer = addr
                    .as_socket()
                    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
                debug!(fd = conn_fd, peer = %peer, "accepted connection");
                self.deliver(bus, OwnedFd::from(socket), peer)
            }
            Err(e) if is_transient(&e) => {
                bus.enqueue_event(self.fd, Flags::READABLE);
                Ok(())
            }
            Err(e) => Err(Error::os("failed to accept", self.fd, &e)),
        }
    }

    fn deliver(&self, bus: &Rc<Bus>, fd: OwnedFd, peer: SocketAddr) -> Result<()> {
        let mut handler = self.handler.borrow_mut();
        match handler.as_mut() {
            Some(handler) => handler(bus, fd, peer),
            None => {
                warn!(peer = %peer, "no accept handler, dropping connection");
                Ok(())
            }
        }
    }
}

fn listen(addr: SocketAddr, backlog: i32) -> Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::os("failed to create socket", -1, &e))?;
    let fd = socket.as_raw_fd();

    socket
        .set_reuse_address(true)
        .map_err(|e| Error::os("failed to set SO_REUSEADDR", fd, &e))?;
    socket
        .set_reuse_port(true)
        .map_err(|e| Error::os("failed to set SO_REUSEPORT", fd, &e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::os("failed to make socket non-blocking", fd, &e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| Error::os("failed to bind", fd, &e))?;
    socket
        .listen(backlog)
        .map_err(|e| Error::os("failed to listen", fd, &e))?;
    Ok(socket)
}

impl IoObject for Acceptor {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn bus(&self) -> Option<Rc<Bus>> {
        self.bus.upgrade()
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Err(e) = self.del_bus_fd() {
            error!(fd = self.fd, error = %e, "failed to deregister acceptor");
        }
    }
}
