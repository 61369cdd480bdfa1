//! Poll engines.
//!
//! An [`EventManager`] owns socket registrations and waits for readiness. The
//! dispatcher drives it in two phases: [`EventManager::poll`] collects the
//! ready registrations, then each callback is checked out with
//! [`EventManager::take_callback`], invoked with no borrow of the engine
//! held, and handed back with [`EventManager::restore_callback`]. Callbacks
//! are therefore free to register or deregister events (including their own)
//! while they run.

use std::io;
use std::time::Duration;

use crate::config::{Backend, Config};
use crate::error::Error;
use crate::event::{EventType, SocketCallback, SocketHandle};

#[cfg(feature = "uring")]
pub(crate) mod completion;
#[cfg(target_os = "linux")]
pub mod epoll;
pub mod poll;
pub(crate) mod registry;
#[cfg(feature = "uring")]
pub mod uring;

/// Readiness a socket is waiting for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }
}

/// Readiness reported by the kernel for one socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Error, hang-up, or invalid descriptor. Fires every registered event.
    pub error: bool,
}

impl Readiness {
    pub fn readable() -> Self {
        Self {
            readable: true,
            ..Self::default()
        }
    }

    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable && !self.error
    }
}

/// A registration found ready by [`EventManager::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub handle: SocketHandle,
    pub event: EventType,
    /// Registration id; distinguishes a registration from a later one on the same pair.
    pub id: u64,
}

/// A socket readiness engine.
///
/// Engines are single-threaded: the manager only touches one from the
/// dispatcher thread, or while it holds exclusive access when disabled.
pub trait EventManager: Send {
    /// Register `callback` for `event` on `handle`, replacing any existing
    /// callback for the same pair.
    fn register_socket_event(
        &mut self,
        handle: SocketHandle,
        event: EventType,
        callback: SocketCallback,
    ) -> Result<(), Error>;

    /// Remove one registration. Returns `true` if it existed.
    fn deregister_socket_event(&mut self, handle: SocketHandle, event: EventType) -> bool;

    /// Remove every registration on `handle`. Returns how many were removed.
    fn deregister_socket(&mut self, handle: SocketHandle) -> usize;

    /// Remove every registration.
    fn deregister_all(&mut self);

    /// Total (socket, event) registrations.
    fn num_events(&self) -> usize;

    /// Registrations on one socket.
    fn num_socket_events(&self, handle: SocketHandle) -> usize;

    fn is_registered(&self, handle: SocketHandle, event: EventType) -> bool;

    /// Whether the engine can only track a bounded number of sockets.
    fn has_limited_socket_capacity(&self) -> bool {
        false
    }

    /// Whether another socket could be registered right now.
    fn can_register_sockets(&self) -> bool {
        true
    }

    /// Wait up to `timeout` (`None` = indefinitely) and append the ready
    /// registrations to `ready`. An interrupted wait yields `Ok(0)`.
    fn poll(&mut self, timeout: Option<Duration>, ready: &mut Vec<ReadyEvent>) -> io::Result<usize>;

    /// Check out the callback of a ready registration. `None` if it was
    /// removed or replaced since `poll` reported it.
    fn take_callback(&mut self, ready: &ReadyEvent) -> Option<SocketCallback>;

    /// Return a callback obtained from `take_callback`.
    fn restore_callback(&mut self, ready: &ReadyEvent, callback: SocketCallback);
}

/// Build the engine selected by `config`.
pub fn from_config(config: &Config) -> Result<Box<dyn EventManager>, Error> {
    let engine: Box<dyn EventManager> = match config.resolved_backend() {
        Backend::Poll => Box::new(poll::PollEventManager::new(config.max_sockets)),
        #[cfg(target_os = "linux")]
        Backend::Epoll => Box::new(epoll::EpollEventManager::new(config.events_capacity)?),
        #[cfg(feature = "uring")]
        Backend::Uring => Box::new(uring::UringEventManager::new(
            config.uring_entries,
            config.events_capacity,
        )?),
    };
    Ok(engine)
}

/// Convert a poll timeout to the millisecond argument of poll(2)/epoll_wait(2),
/// rounding up so a sub-millisecond deadline does not spin.
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if d.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_rounds_up() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(25))), 25);
        assert_eq!(timeout_ms(Some(Duration::from_secs(u64::MAX))), libc::c_int::MAX);
    }
}
