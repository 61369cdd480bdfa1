//! poll(2) engine.

use std::io;
use std::time::Duration;

use crate::error::Error;
use crate::event::{EventType, SocketCallback, SocketHandle};
use crate::poller::registry::Registry;
use crate::poller::{EventManager, Readiness, ReadyEvent, timeout_ms};

/// Portable engine built on poll(2).
///
/// The `pollfd` array is rebuilt lazily, only when the set of registrations
/// changed since the previous wait.
pub struct PollEventManager {
    registry: Registry,
    pollfds: Vec<libc::pollfd>,
    dirty: bool,
    max_sockets: Option<usize>,
}

impl PollEventManager {
    /// Create an engine. `max_sockets` caps the number of distinct sockets.
    pub fn new(max_sockets: Option<usize>) -> Self {
        Self {
            registry: Registry::new(),
            pollfds: Vec::new(),
            dirty: false,
            max_sockets,
        }
    }

    fn rebuild(&mut self) {
        self.pollfds.clear();
        for (fd, interest) in self.registry.sockets() {
            let mut events: libc::c_short = 0;
            if interest.readable {
                events |= libc::POLLIN;
            }
            if interest.writable {
                events |= libc::POLLOUT;
            }
            self.pollfds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
        }
        self.dirty = false;
    }
}

impl Default for PollEventManager {
    fn default() -> Self {
        Self::new(None)
    }
}

fn readiness(revents: libc::c_short) -> Readiness {
    Readiness {
        readable: revents & libc::POLLIN != 0,
        writable: revents & libc::POLLOUT != 0,
        error: revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
    }
}

impl EventManager for PollEventManager {
    fn register_socket_event(
        &mut self,
        handle: SocketHandle,
        event: EventType,
        callback: SocketCallback,
    ) -> Result<(), Error> {
        if !self.registry.contains_socket(handle) && !self.can_register_sockets() {
            return Err(Error::SocketCapacity);
        }
        self.registry.insert(handle, event, callback)?;
        self.dirty = true;
        Ok(())
    }

    fn deregister_socket_event(&mut self, handle: SocketHandle, event: EventType) -> bool {
        let removed = self.registry.remove(handle, event);
        self.dirty |= removed;
        removed
    }

    fn deregister_socket(&mut self, handle: SocketHandle) -> usize {
        let n = self.registry.remove_socket(handle);
        self.dirty |= n > 0;
        n
    }

    fn deregister_all(&mut self) {
        self.registry.clear();
        self.dirty = true;
    }

    fn num_events(&self) -> usize {
        self.registry.len()
    }

    fn num_socket_events(&self, handle: SocketHandle) -> usize {
        self.registry.count(handle)
    }

    fn is_registered(&self, handle: SocketHandle, event: EventType) -> bool {
        self.registry.contains(handle, event)
    }

    fn has_limited_socket_capacity(&self) -> bool {
        self.max_sockets.is_some()
    }

    fn can_register_sockets(&self) -> bool {
        self.max_sockets
            .is_none_or(|max| self.registry.num_sockets() < max)
    }

    fn poll(&mut self, timeout: Option<Duration>, ready: &mut Vec<ReadyEvent>) -> io::Result<usize> {
        if self.dirty {
            self.rebuild();
        }
        let rc = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(0);
        }
        let mut n = 0;
        for pfd in &self.pollfds {
            if pfd.revents == 0 {
                continue;
            }
            n += self
                .registry
                .collect_ready(pfd.fd, readiness(pfd.revents), ready);
        }
        Ok(n)
    }

    fn take_callback(&mut self, ready: &ReadyEvent) -> Option<SocketCallback> {
        self.registry.take(ready)
    }

    fn restore_callback(&mut self, ready: &ReadyEvent, callback: SocketCallback) {
        self.registry.restore(ready, callback);
    }
}
