//! Per-connection state: the descriptors of one logical connection and
//! the channels pumping between them.
//!
//! A session is inert until [`Session::start`] moves it behind an `Rc` and
//! installs one shared callback on each of its descriptors. The first
//! error-flagged event on any of them removes the callbacks of all of
//! them. The channels and sockets are then released as the bus sweeps the
//! registrations, and the sockets close when the last reference goes.

use crate::runtime::bus::Bus;
use crate::runtime::channel::Channel;
use crate::runtime::error::Result;
use crate::runtime::flags::Flags;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use tracing::{debug, info};

pub struct Session {
    name: &'static str,
    fds: Vec<RawFd>,
    channels: Vec<Rc<Channel>>,
}

impl Session {
    pub fn new(name: &'static str, fds: Vec<RawFd>, channels: Vec<Rc<Channel>>) -> Self {
        Self {
            name,
            fds,
            channels,
        }
    }

    pub fn fds(&self) -> &[RawFd] {
        &self.fds
    }

    pub fn channels(&self) -> &[Rc<Channel>] {
        &self.channels
    }

    /// Arm the session: any error on one descriptor tears down all of them.
    pub fn start(self, bus: &Bus) -> Result<Rc<Session>> {
        let session = Rc::new(self);
        for &fd in &session.fds {
            let this = Rc::clone(&session);
            let armed = bus.add_fd_callback(
                fd,
                Box::new(move |bus, fd, flags| {
                    if flags.contains(Flags::ERROR) {
                        debug!(fd, %flags, session = this.name, "tearing down session");
                        this.teardown(bus);
                    }
                    Ok(())
                }),
            );
            if let Err(e) = armed {
                session.teardown(bus);
                return Err(e);
            }
        }
        Ok(session)
    }

    fn teardown(&self, bus: &Bus) {
        for &fd in &self.fds {
            bus.del_fd_callbacks(fd);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        info!(fds = ?self.fds, session = self.name, "client has closed its connection");
    }
}
