//! Capabilities shared by everything that owns a descriptor on a bus.
//!
//! A socket is both [`Readable`] and [`Writable`]; a channel only needs one
//! side of each endpoint, so it holds them as separate trait objects.

use crate::runtime::bus::{Bus, BusCallback};
use crate::runtime::error::{Error, Result};
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// An object owning one descriptor registered on a bus.
pub trait IoObject {
    fn fd(&self) -> RawFd;

    /// The bus this object was created on, if it is still alive.
    fn bus(&self) -> Option<Rc<Bus>>;

    fn add_bus_callback(&self, callback: BusCallback) -> Result<()> {
        let fd = self.fd();
        self.bus()
            .ok_or(Error::Detached { fd })?
            .add_fd_callback(fd, callback)
    }

    fn del_bus_fd(&self) -> Result<()> {
        match self.bus() {
            Some(bus) => bus.del_fd(self.fd()),
            None => Ok(()),
        }
    }

    fn del_bus_fd_callbacks(&self) {
        if let Some(bus) = self.bus() {
            bus.del_fd_callbacks(self.fd());
        }
    }
}

/// Source side of a channel.
pub trait Readable: IoObject {
    /// One non-blocking read attempt. `Ok(0)` means nothing was available.
    fn read_some(&self, buf: &mut [u8]) -> Result<usize>;
}

/// Sink side of a channel.
pub trait Writable: IoObject {
    /// One non-blocking write attempt. `Ok(0)` means no room right now.
    fn write_some(&self, buf: &[u8]) -> Result<usize>;
}
