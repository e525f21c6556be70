//! Raw echo service.
//!
//! Every byte a client sends is written straight back through a single
//! loopback channel (the socket is both input and output).

use crate::runtime::{Bus, Channel, IoObject, Result, Session, TcpSocket};
use std::os::unix::io::OwnedFd;
use std::rc::Rc;

/// Build the session for one accepted echo connection.
pub fn new_session(bus: &Rc<Bus>, fd: OwnedFd) -> Result<Session> {
    let socket = Rc::new(TcpSocket::from_fd(bus, fd)?);
    let channel = Channel::open(socket.clone(), socket.clone())?;
    Ok(Session::new("echo", vec![socket.fd()], vec![channel]))
}
