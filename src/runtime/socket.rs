//! Non-blocking TCP socket registered on a bus.
//!
//! Reads and writes are single attempts. Transient conditions report zero
//! bytes, a zero-byte read is surfaced as [`Error::PeerClosed`], and any
//! other failure carries the descriptor and errno.

use crate::runtime::bus::Bus;
use crate::runtime::endpoint::Endpoint;
use crate::runtime::error::{is_transient, Error, Result};
use crate::runtime::object::{IoObject, Readable, Writable};
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::RefCell;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use tracing::{debug, error};

/// A vanished peer must surface as EPIPE, never as SIGPIPE.
#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

pub struct TcpSocket {
    fd: RawFd,
    bus: Weak<Bus>,
    socket: RefCell<Option<Socket>>,
}

impl TcpSocket {
    /// Wrap an already connected descriptor, switching it to non-blocking.
    pub fn from_fd(bus: &Rc<Bus>, fd: OwnedFd) -> Result<Self> {
        let socket = Socket::from(fd);
        let raw = socket.as_raw_fd();
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::os("failed to make socket non-blocking", raw, &e))?;
        Ok(Self::wrap(bus, socket))
    }

    /// Connect to the first candidate address of `endpoint` that accepts a
    /// non-blocking connect. A connect still in progress counts as success.
    pub fn connect(bus: &Rc<Bus>, endpoint: &Endpoint) -> Result<Self> {
        let mut last_errno = 0;
        for addr in endpoint.resolve()? {
            match start_connect(addr) {
                Ok(socket) => {
                    debug!(fd = socket.as_raw_fd(), addr = %addr, "connecting");
                    return Ok(Self::wrap(bus, socket));
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "connect candidate failed");
                    last_errno = e.raw_os_error().unwrap_or(0);
                }
            }
        }
        Err(Error::Os {
            context: "failed to connect",
            fd: -1,
            errno: last_errno,
        })
    }

    fn wrap(bus: &Rc<Bus>, socket: Socket) -> Self {
        Self {
            fd: socket.as_raw_fd(),
            bus: Rc::downgrade(bus),
            socket: RefCell::new(Some(socket)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.socket.borrow().is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket
            .borrow()
            .as_ref()
            .and_then(|s| s.peer_addr().ok())
            .and_then(|a| a.as_socket())
    }

    /// Deregister from the bus, shut down and release the descriptor.
    ///
    /// Closing twice is a no-op. If deregistration or shutdown fails the
    /// socket keeps its descriptor so that the close can be retried.
    pub fn close(&self) -> Result<()> {
        let Some(socket) = self.socket.borrow_mut().take() else {
            return Ok(());
        };

        if let Err(e) = self.del_bus_fd() {
            *self.socket.borrow_mut() = Some(socket);
            return Err(e);
        }

        match socket.shutdown(Shutdown::Both) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => {}
            Err(e) => {
                *self.socket.borrow_mut() = Some(socket);
                return Err(Error::os("failed to shutdown socket", self.fd, &e));
            }
        }

        debug!(fd = self.fd, "socket closed");
        drop(socket);
        Ok(())
    }

    fn with_socket<T>(&self, f: impl FnOnce(&Socket) -> T) -> Result<T> {
        let guard = self.socket.borrow();
        let socket = guard.as_ref().ok_or(Error::Closed { fd: self.fd })?;
        Ok(f(socket))
    }
}

fn start_connect(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => Ok(socket),
        Err(e) if is_transient(&e) => Ok(socket),
        Err(e) => Err(e),
    }
}

impl IoObject for TcpSocket {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn bus(&self) -> Option<Rc<Bus>> {
        self.bus.upgrade()
    }
}

impl Readable for TcpSocket {
    fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.fd;
        self.with_socket(|mut socket| match socket.read(buf) {
            Ok(0) if !buf.is_empty() => Err(Error::PeerClosed { fd }),
            Ok(n) => Ok(n),
            Err(e) if is_transient(&e) => Ok(0),
            Err(e) => Err(Error::os("recv failed", fd, &e)),
        })?
    }
}

impl Writable for TcpSocket {
    fn write_some(&self, buf: &[u8]) -> Result<usize> {
        let fd = self.fd;
        self.with_socket(|socket| match socket.send_with_flags(buf, SEND_FLAGS) {
            Ok(n) => Ok(n),
            Err(e) if is_transient(&e) => Ok(0),
            Err(e) => Err(Error::os("send failed", fd, &e)),
        })?
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(fd = self.fd, error = %e, "failed to close socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::bus::Poller;
    use crate::runtime::testing::MockPoller;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::time::{Duration, Instant};

    fn connected_pair(bus: &Rc<Bus>) -> (TcpSocket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (TcpSocket::from_fd(bus, OwnedFd::from(server)).unwrap(), client)
    }

    #[test]
    fn test_read_would_block_is_zero() {
        let bus = Bus::with_poller(Box::new(MockPoller::default()));
        let (socket, _client) = connected_pair(&bus);
        let mut buf = [0u8; 16];
        assert_eq!(socket.read_some(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_write_then_read() {
        let bus = Bus::with_poller(Box::new(MockPoller::default()));
        let (socket, mut client) = connected_pair(&bus);

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut n = 0;
        while n == 0 && Instant::now() < deadline {
            n = socket.read_some(&mut buf).unwrap();
        }
        assert_eq!(&buf[..n], b"ping");

        assert_eq!(socket.write_some(b"pong").unwrap(), 4);
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong");
    }

    #[test]
    fn test_peer_close_is_error() {
        let bus = Bus::with_poller(Box::new(MockPoller::default()));
        let (socket, client) = connected_pair(&bus);
        drop(client);

        let mut buf = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match socket.read_some(&mut buf) {
                Ok(0) if Instant::now() < deadline => continue,
                Err(Error::PeerClosed { fd }) => {
                    assert_eq!(fd, socket.fd());
                    break;
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_close_is_idempotent_and_deregisters() {
        let poller = MockPoller::default();
        let bus = Bus::with_poller(Box::new(poller.clone()));
        let (socket, _client) = connected_pair(&bus);
        socket
            .add_bus_callback(Box::new(|_, _, _| Ok(())))
            .unwrap();
        assert!(poller.is_registered(socket.fd()));

        socket.close().unwrap();
        assert!(!socket.is_open());
        assert!(!poller.is_registered(socket.fd()));
        socket.close().unwrap();

        let mut buf = [0u8; 4];
        match socket.read_some(&mut buf) {
            Err(e) => assert!(e.is_programmer_error()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_close_failure_keeps_descriptor() {
        let poller = MockPoller::default();
        let bus = Bus::with_poller(Box::new(poller.clone()));
        let (socket, _client) = connected_pair(&bus);
        socket.add_bus_callback(Box::new(|_, _, _| Ok(()))).unwrap();

        // Take the fd out of the poller behind the bus's back so the
        // deregistration inside close fails.
        let mut inner = poller.clone();
        inner.deregister(socket.fd()).unwrap();

        assert!(socket.close().is_err());
        assert!(socket.is_open());
    }

    #[test]
    fn test_connect_to_listener() {
        let bus = Bus::with_poller(Box::new(MockPoller::default()));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let socket = TcpSocket::connect(&bus, &Endpoint::new("127.0.0.1", addr.port())).unwrap();
        assert!(socket.is_open());
        let _accepted = listener.accept().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while socket.peer_addr().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(socket.peer_addr(), Some(addr));
    }

    #[test]
    fn test_connect_with_nothing_listening() {
        let bus = Bus::with_poller(Box::new(MockPoller::default()));
        // Port 0 is never connectable.
        match TcpSocket::connect(&bus, &Endpoint::new("127.0.0.1", 0)) {
            Ok(socket) => {
                // Some kernels defer the refusal; the socket then reports
                // it as a pending error.
                let deadline = Instant::now() + Duration::from_secs(5);
                let mut buf = [0u8; 1];
                loop {
                    match socket.read_some(&mut buf) {
                        Ok(0) if Instant::now() < deadline => continue,
                        Err(_) => break,
                        other => panic!("unexpected: {:?}", other),
                    }
                }
            }
            Err(e) => assert_eq!(e.fd(), -1),
        }
    }
}
