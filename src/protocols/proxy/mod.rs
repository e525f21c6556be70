//! Generic bidirectional TCP proxy.
//!
//! Each accepted client gets a fresh connection to the upstream and two
//! channels, client to upstream and upstream to client. The session owns
//! both descriptors, so an error on either side tears down the pair.

use crate::runtime::{Bus, Channel, Endpoint, IoObject, Result, Session, TcpSocket};
use std::os::unix::io::OwnedFd;
use std::rc::Rc;
use tracing::debug;

/// The two sockets and two channels of one proxied connection.
pub struct ProxyPair {
    pub client: Rc<TcpSocket>,
    pub upstream: Rc<TcpSocket>,
    pub client_to_upstream: Rc<Channel>,
    pub upstream_to_client: Rc<Channel>,
}

impl ProxyPair {
    /// Wrap the accepted `fd`, connect to `upstream` and wire both
    /// directions.
    pub fn connect(bus: &Rc<Bus>, fd: OwnedFd, upstream: &Endpoint) -> Result<Self> {
        let client = Rc::new(TcpSocket::from_fd(bus, fd)?);
        let target = Rc::new(TcpSocket::connect(bus, upstream)?);
        debug!(client = client.fd(), upstream = target.fd(), to = %upstream, "proxying");

        let client_to_upstream = Channel::open(client.clone(), target.clone())?;
        let upstream_to_client = Channel::open(target.clone(), client.clone())?;
        Ok(Self {
            client,
            upstream: target,
            client_to_upstream,
            upstream_to_client,
        })
    }

    pub fn into_session(self, name: &'static str) -> Session {
        Session::new(
            name,
            vec![self.client.fd(), self.upstream.fd()],
            vec![self.client_to_upstream, self.upstream_to_client],
        )
    }
}

/// Build the session for one accepted proxy connection.
pub fn new_session(bus: &Rc<Bus>, fd: OwnedFd, upstream: &Endpoint) -> Result<Session> {
    Ok(ProxyPair::connect(bus, fd, upstream)?.into_session("tcp_proxy"))
}
