//! Query log: the reactor thread appends query text to a shared ring
//! buffer and a background thread copies it to a file.
//!
//! The reactor never blocks on the log. When the ring is full the bytes
//! that do not fit are dropped with a warning.

use crate::runtime::buffer::{self, Consumer, Producer};
use crate::runtime::StopToken;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Ring capacity used by the psql proxy unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 2048;

/// Appended after every logged query.
pub const SEPARATOR: u8 = b'\n';

/// Longest the writer sleeps when the ring is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Something that records the text of client queries.
pub trait QuerySink {
    fn add_message(&mut self, message: &str);
}

impl QuerySink for Vec<String> {
    fn add_message(&mut self, message: &str) {
        self.push(message.to_owned());
    }
}

/// Create a query log over a ring of `capacity` bytes.
///
/// # Panics
///
/// Panics when `capacity` is 2 or less.
pub fn query_log(capacity: usize) -> (QueryLog, QueryLogReader) {
    let (producer, consumer) = buffer::shared(capacity);
    (
        QueryLog {
            producer,
            chunk: (capacity / 2).max(1),
            dropped: 0,
        },
        QueryLogReader { consumer },
    )
}

/// Producer side, owned by the reactor thread.
pub struct QueryLog {
    producer: Producer,
    chunk: usize,
    dropped: u64,
}

impl QueryLog {
    /// Total bytes lost to a full ring so far.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped
    }

    fn append(&mut self, bytes: &[u8]) -> bool {
        match self.producer.write_acquire(bytes.len()) {
            Some(region) => {
                region.copy_from_slice(bytes);
                self.producer.write_release(bytes.len());
                true
            }
            None => false,
        }
    }
}

impl QuerySink for QueryLog {
    fn add_message(&mut self, message: &str) {
        let mut lost = 0;
        for piece in message.as_bytes().chunks(self.chunk) {
            if !self.append(piece) {
                lost += piece.len();
            }
        }
        if !self.append(&[SEPARATOR]) {
            lost += 1;
        }
        if lost > 0 {
            self.dropped += lost as u64;
            warn!(lost, "query log is full, dropping bytes");
        }
    }
}

/// Consumer side, moved to the writer thread.
pub struct QueryLogReader {
    consumer: Consumer,
}

impl QueryLogReader {
    /// Offer the longest contiguous readable run to `f` and release as
    /// many bytes as it reports consumed. An empty ring offers an empty
    /// slice.
    pub fn process<E>(
        &mut self,
        f: impl FnOnce(&[u8]) -> Result<usize, E>,
    ) -> Result<usize, E> {
        let consumed = f(self.consumer.read_acquire())?;
        self.consumer.read_release(consumed);
        Ok(consumed)
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }
}

/// Background thread copying the query log into a file.
///
/// The writer has its own stop flag. Stop it with [`FileWriter::finish`]
/// only after the reactor has returned, so that queries logged during the
/// last pass still reach the file.
pub struct FileWriter {
    stop: StopToken,
    handle: JoinHandle<io::Result<()>>,
}

impl FileWriter {
    /// Create (or truncate) `path` and start copying into it. Output is
    /// flushed at least every `flush_interval`.
    pub fn spawn(reader: QueryLogReader, path: &Path, flush_interval: Duration) -> io::Result<Self> {
        let file = File::create(path)?;
        debug!(path = %path.display(), "query log opened");
        let stop = StopToken::new();
        let writer_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("query-writer".to_string())
            .spawn(move || {
                copy_until_stopped(reader, BufWriter::new(file), writer_stop, flush_interval)
            })?;
        Ok(Self { stop, handle })
    }

    /// Stop the writer, wait for it to drain the ring and exit.
    pub fn finish(self) -> io::Result<()> {
        self.stop.stop();
        self.handle
            .join()
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "query writer panicked")))
    }
}

fn copy_until_stopped<W: Write>(
    mut reader: QueryLogReader,
    mut out: W,
    stop: StopToken,
    flush_interval: Duration,
) -> io::Result<()> {
    let idle = IDLE_SLEEP.min(flush_interval);
    let mut last_flush = Instant::now();
    while !stop.is_stopped() {
        if reader.process(|run| out.write(run))? == 0 {
            thread::sleep(idle);
        }
        if last_flush.elapsed() >= flush_interval {
            out.flush()?;
            last_flush = Instant::now();
        }
    }

    // Drain what the reactor logged before stopping.
    while reader.process(|run| out.write(run))? > 0 {}
    out.flush()
}
