//! Inspection of client-to-server traffic.
//!
//! The inspector sees every chunk read from the client before it is
//! forwarded. It reassembles frames split across reads, logs query text,
//! and asks the bus to tear the session down when the client terminates.
//! Forwarding is never held back by inspection.

use super::message::{decode, next_frame, Frame, Message, StartupMessage};
use super::query_log::QuerySink;
use crate::runtime::{Bus, Flags, InputResult};
use bytes::{Buf, BytesMut};
use std::cell::RefCell;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use tracing::{debug, info, trace, warn};

pub struct QueryInspector {
    client_fd: RawFd,
    sink: Rc<RefCell<dyn QuerySink>>,
    pending: BytesMut,
    /// Set once the untagged startup message has been seen.
    tagged: bool,
    /// Set after a frame with an impossible length; nothing more is
    /// inspected on this connection.
    desynced: bool,
    /// Complete frames seen so far, decodable or not.
    frames: usize,
    startup: Option<StartupMessage>,
}

impl QueryInspector {
    pub fn new(client_fd: RawFd, sink: Rc<RefCell<dyn QuerySink>>) -> Self {
        Self {
            client_fd,
            sink,
            pending: BytesMut::new(),
            tagged: false,
            desynced: false,
            frames: 0,
            startup: None,
        }
    }

    /// Feed one read result. Read errors are left to the session.
    pub fn on_input(&mut self, bus: &Bus, result: &InputResult<'_>) {
        let Ok(received) = result else {
            return;
        };
        if self.desynced || received.data.is_empty() {
            return;
        }

        if self.pending.is_empty() {
            let consumed = self.consume(bus, received.data);
            self.pending.extend_from_slice(&received.data[consumed..]);
        } else {
            let mut pending = mem::take(&mut self.pending);
            pending.extend_from_slice(received.data);
            let consumed = self.consume(bus, &pending);
            pending.advance(consumed);
            self.pending = pending;
        }
    }

    /// Bytes buffered while waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_desynced(&self) -> bool {
        self.desynced
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// The client's startup message, once it has been decoded.
    pub fn startup(&self) -> Option<&StartupMessage> {
        self.startup.as_ref()
    }

    /// Handle every complete frame in `buf`; returns the bytes used.
    fn consume(&mut self, bus: &Bus, buf: &[u8]) -> usize {
        let mut consumed = 0;
        loop {
            match next_frame(&buf[consumed..], self.tagged) {
                Frame::Incomplete => return consumed,
                Frame::Malformed { code, length } => {
                    warn!(
                        fd = self.client_fd,
                        code, length, "bad message length, inspection stopped"
                    );
                    self.desynced = true;
                    return buf.len();
                }
                Frame::Complete {
                    code,
                    payload,
                    endianness,
                    len,
                } => {
                    consumed += len;
                    self.frames += 1;
                    let message = decode(code, payload, endianness);
                    let negotiation =
                        matches!(&message, Some(Message::Startup(s)) if s.is_negotiation());
                    if !negotiation {
                        self.tagged = true;
                    }
                    match message {
                        Some(message) => self.handle(bus, message),
                        None => trace!(fd = self.client_fd, code, "message skipped"),
                    }
                }
            }
        }
    }

    fn handle(&mut self, bus: &Bus, message: Message) {
        match message {
            Message::Startup(startup) if startup.is_negotiation() => {
                debug!(
                    fd = self.client_fd,
                    code = startup.version.minor,
                    "negotiation request"
                );
            }
            Message::Startup(startup) => {
                info!(
                    fd = self.client_fd,
                    major = startup.version.major,
                    minor = startup.version.minor,
                    "startup message"
                );
                for parameter in &startup.parameters {
                    debug!(name = %parameter.name, value = %parameter.value, "startup parameter");
                }
                self.startup = Some(startup);
            }
            Message::ParameterStatus(parameters) => {
                for parameter in &parameters {
                    debug!(name = %parameter.name, value = %parameter.value, "parameter status");
                }
            }
            Message::Query(text) => {
                trace!(fd = self.client_fd, query = %text, "query");
                self.sink.borrow_mut().add_message(&text);
            }
            Message::Terminate => {
                info!(fd = self.client_fd, "terminate received");
                bus.enqueue_event(self.client_fd, Flags::ERROR);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::postgres::message::{encode_startup, encode_tagged, QUERY, TERMINATE};
    use crate::runtime::testing::MockPoller;
    use crate::runtime::{Error, Received};

    const CLIENT: RawFd = 9;

    fn inspector() -> (QueryInspector, Rc<RefCell<Vec<String>>>) {
        let queries = Rc::new(RefCell::new(Vec::new()));
        (QueryInspector::new(CLIENT, queries.clone()), queries)
    }

    fn feed(inspector: &mut QueryInspector, bus: &Bus, data: &[u8]) {
        inspector.on_input(bus, &Ok(Received { fd: CLIENT, data }));
    }

    #[test]
    fn test_startup_split_across_reads() {
        let bus = Bus::with_poller(Box::new(MockPoller::default()));
        let (mut inspector, queries) = inspector();

        let startup = encode_startup(3, 0, &[("user", "postgres")]);
        assert_eq!(startup.len(), 23);
        let mut stream = startup.clone();
        stream.extend(encode_tagged(QUERY, b"select 1\0"));

        // Header, version and part of the parameter bytes, cut inside
        // "postgres".
        feed(&mut inspector, &bus, &stream[..16]);
        assert_eq!(inspector.pending(), 16);
        assert_eq!(inspector.frames(), 0);
        assert!(inspector.startup().is_none());

        feed(&mut inspector, &bus, &stream[16..]);
        assert_eq!(inspector.pending(), 0);
        assert_eq!(inspector.frames(), 2);

        let decoded = inspector.startup().unwrap();
        assert_eq!(decoded.version.major, 3);
        assert_eq!(decoded.version.minor, 0);
        let parameters: Vec<(&str, &str)> = decoded
            .parameters
            .iter()
            .map(|p| (p.name.as_str(), p.value.as_str()))
            .collect();
        assert_eq!(parameters, vec![("user", "postgres")]);
        assert_eq!(*queries.borrow(), vec!["select 1".to_string()]);
    }

    #[test]
    fn test_several_frames_in_one_read() {
        let bus = Bus::with_poller(Box::new(MockPoller::default()));
        let (mut inspector, queries) = inspector();

        let mut stream = encode_startup(3, 0, &[]);
        stream.extend(encode_tagged(QUERY, b"begin\0"));
        stream.extend(encode_tagged(b'P', b"stmt\0select $1\0\0\0"));
        stream.extend(encode_tagged(QUERY, b"commit\0"));
        let tail = encode_tagged(QUERY, b"rollback\0");
        stream.extend_from_slice(&tail[..4]);

        feed(&mut inspector, &bus, &stream);
        assert_eq!(*queries.borrow(), vec!["begin".to_string(), "commit".to_string()]);
        assert_eq!(inspector.pending(), 4);

        feed(&mut inspector, &bus, &tail[4..]);
        assert_eq!(queries.borrow().last().map(String::as_str), Some("rollback"));
    }

    #[test]
    fn test_terminate_enqueues_error() {
        let bus = Bus::with_poller(Box::new(MockPoller::default()));
        let (mut inspector, _) = inspector();
        let events = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&events);
        bus.add_fd_callback(
            CLIENT,
            Box::new(move |_, fd, flags| {
                seen.borrow_mut().push((fd, flags));
                Ok(())
            }),
        )
        .unwrap();

        let mut stream = encode_startup(3, 0, &[]);
        stream.extend(encode_tagged(TERMINATE, b""));
        assert_eq!(bus.pending_events(), 0);
        feed(&mut inspector, &bus, &stream);
        assert_eq!(bus.pending_events(), 1);

        bus.wait_events(None, 16, &mut |_, e| panic!("unexpected error: {e}"));
        assert_eq!(*events.borrow(), vec![(CLIENT, Flags::ERROR)]);
    }

    #[test]
    fn test_ssl_request_keeps_startup_untagged() {
        let bus = Bus::with_poller(Box::new(MockPoller::default()));
        let (mut inspector, queries) = inspector();

        feed(&mut inspector, &bus, &[0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f]);
        let mut stream = encode_startup(3, 0, &[("user", "postgres")]);
        stream.extend(encode_tagged(QUERY, b"select 2\0"));
        feed(&mut inspector, &bus, &stream);
        assert_eq!(*queries.borrow(), vec!["select 2".to_string()]);
        assert_eq!(inspector.frames(), 3);
        assert_eq!(inspector.startup().map(|s| s.version.major), Some(3));
    }

    #[test]
    fn test_bad_length_stops_inspection() {
        let bus = Bus::with_poller(Box::new(MockPoller::default()));
        let (mut inspector, queries) = inspector();

        let mut stream = encode_startup(3, 0, &[]);
        stream.extend_from_slice(&[b'Q', 0, 0, 0, 2]);
        stream.extend(encode_tagged(QUERY, b"select 3\0"));
        feed(&mut inspector, &bus, &stream);
        assert!(inspector.is_desynced());
        assert_eq!(inspector.pending(), 0);

        feed(&mut inspector, &bus, &encode_tagged(QUERY, b"select 4\0"));
        assert!(queries.borrow().is_empty());
    }

    #[test]
    fn test_read_errors_are_ignored() {
        let bus = Bus::with_poller(Box::new(MockPoller::default()));
        let (mut inspector, _) = inspector();
        inspector.on_input(&bus, &Err(Error::PeerClosed { fd: CLIENT }));
        assert_eq!(inspector.pending(), 0);
        assert_eq!(bus.pending_events(), 0);
    }
}
