//! PostgreSQL proxy that logs the queries clients send.
//!
//! Traffic is forwarded unchanged in both directions. Client-to-server
//! bytes are also decoded on the side by a [`QueryInspector`].

mod handler;
pub mod message;
pub mod query_log;

pub use handler::QueryInspector;
pub use query_log::{query_log, FileWriter, QueryLog, QueryLogReader, QuerySink};

use crate::protocols::proxy::ProxyPair;
use crate::runtime::{Bus, Endpoint, IoObject, Result, Session};
use std::cell::RefCell;
use std::os::unix::io::OwnedFd;
use std::rc::Rc;

/// Build the session for one accepted client: proxy to `upstream` and
/// record client queries into `sink`.
pub fn new_session(
    bus: &Rc<Bus>,
    fd: OwnedFd,
    upstream: &Endpoint,
    sink: Rc<RefCell<dyn QuerySink>>,
) -> Result<Session> {
    let pair = ProxyPair::connect(bus, fd, upstream)?;
    let mut inspector = QueryInspector::new(pair.client.fd(), sink);
    pair.client_to_upstream
        .add_handler(move |bus, result| inspector.on_input(bus, result));
    Ok(pair.into_session("psql_proxy"))
}
