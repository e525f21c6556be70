//! Top-level run loop with cooperative stop.

use crate::runtime::bus::Bus;
use crate::runtime::error::Error;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default poll timeout per pass.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10);

/// Default number of events fetched per poll.
pub const DEFAULT_MAX_EVENTS: usize = 1024;

/// Cloneable stop flag, safe to trigger from any thread.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct Context {
    bus: Rc<Bus>,
    timeout: Option<Duration>,
    max_events: usize,
    stop: StopToken,
}

impl Context {
    pub fn new(bus: Rc<Bus>) -> Self {
        Self::with_limits(bus, Some(DEFAULT_TIMEOUT), DEFAULT_MAX_EVENTS)
    }

    /// `timeout` of `None` blocks each poll until something is ready.
    pub fn with_limits(bus: Rc<Bus>, timeout: Option<Duration>, max_events: usize) -> Self {
        Self {
            bus,
            timeout,
            max_events,
            stop: StopToken::new(),
        }
    }

    pub fn bus(&self) -> &Rc<Bus> {
        &self.bus
    }

    /// Handle for stopping the loop from elsewhere.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Poll and dispatch until a stop is requested. The flag is checked
    /// between passes; a pass in progress always completes.
    pub fn run(&self, mut on_error: impl FnMut(&Rc<Bus>, &Error)) {
        debug!(timeout = ?self.timeout, max_events = self.max_events, "run loop started");
        while !self.is_stop_requested() {
            self.bus
                .wait_events(self.timeout, self.max_events, &mut on_error);
        }
        debug!("run loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::flags::Flags;
    use crate::runtime::testing::MockPoller;
    use std::cell::Cell;

    #[test]
    fn test_stop_from_callback_ends_run() {
        let bus = Bus::with_poller(Box::new(MockPoller::default()));
        let context = Context::new(Rc::clone(&bus));
        let stop = context.stop_token();
        let passes = Rc::new(Cell::new(0));
        let count = Rc::clone(&passes);

        bus.add_fd_callback(
            1,
            Box::new(move |bus, fd, _| {
                count.set(count.get() + 1);
                if count.get() == 3 {
                    stop.stop();
                } else {
                    bus.enqueue_event(fd, Flags::READABLE);
                }
                Ok(())
            }),
        )
        .unwrap();
        bus.enqueue_event(1, Flags::READABLE);

        context.run(|_, e| panic!("unexpected error: {e}"));
        assert_eq!(passes.get(), 3);
        assert!(context.is_stop_requested());
    }

    #[test]
    fn test_stop_from_other_thread() {
        let bus = Bus::with_poller(Box::new(MockPoller::default()));
        let context = Context::with_limits(bus, Some(Duration::from_millis(1)), 8);
        let stop = context.stop_token();

        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            stop.stop();
        });
        context.run(|_, _| {});
        stopper.join().unwrap();
        assert!(context.is_stop_requested());
    }
}
