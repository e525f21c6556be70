//! relay: an edge-triggered reactor and the services built on it.
//!
//! The `runtime` module holds the event bus, non-blocking sockets and the
//! channel that pumps bytes between them. `protocols` builds the echo,
//! TCP proxy and PostgreSQL query-logging proxy sessions on top.

pub mod config;
pub mod protocols;
pub mod runtime;
pub mod service;
