//! Single-threaded edge-triggered reactor.
//!
//! Layers, leaf to root:
//! - `BipBuffer`: ring buffer of in-flight bytes
//! - `Flags` / `Error`: readiness bits and structured failures
//! - `Bus`: descriptor registry, dispatch, synthetic event queue
//! - `TcpSocket` / `Acceptor`: non-blocking I/O objects on a bus
//! - `Channel`: pumps bytes from a readable to a writable object
//! - `Session` / `Server`: per-connection teardown and accept glue
//! - `Context`: the poll-dispatch loop with a stop flag

mod acceptor;
pub mod buffer;
mod bus;
mod channel;
mod context;
mod endpoint;
mod error;
mod flags;
mod mio;
mod object;
mod server;
mod session;
mod socket;

#[cfg(test)]
pub(crate) mod testing;

pub use acceptor::{AcceptHandler, Acceptor};
pub use buffer::BipBuffer;
pub use bus::{Bus, BusCallback, ErrorCallback, Event, Poller};
pub use channel::{Channel, InputResult, Received, CHUNK_SIZE};
pub use context::{Context, StopToken, DEFAULT_MAX_EVENTS, DEFAULT_TIMEOUT};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use flags::Flags;
pub use mio::MioPoller;
pub use object::{IoObject, Readable, Writable};
pub use server::{Server, SessionFactory};
pub use session::Session;
pub use socket::TcpSocket;
