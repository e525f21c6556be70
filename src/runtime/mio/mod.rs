//! mio-backed poller.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! Descriptors are registered edge-triggered for both directions, with the
//! descriptor itself as the token.

mod poller;

pub use poller::MioPoller;
