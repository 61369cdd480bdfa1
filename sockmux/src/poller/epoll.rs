//! Level-triggered epoll(7) engine.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use crate::error::Error;
use crate::event::{EventType, SocketCallback, SocketHandle};
use crate::poller::registry::Registry;
use crate::poller::{EventManager, Interest, Readiness, ReadyEvent, timeout_ms};

/// Engine that keeps socket interest in the kernel. Suited to long-lived
/// registrations (`Hint::InfrequentRegistration`).
pub struct EpollEventManager {
    epfd: OwnedFd,
    registry: Registry,
    events: Vec<libc::epoll_event>,
}

impl EpollEventManager {
    /// Create an engine harvesting up to `capacity` ready sockets per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: epoll_create1 returned a fresh descriptor we now own.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            epfd,
            registry: Registry::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
        })
    }

    fn ctl(&self, op: libc::c_int, handle: SocketHandle, interest: Interest) -> io::Result<()> {
        let mut flags = 0u32;
        if interest.readable {
            flags |= libc::EPOLLIN as u32;
        }
        if interest.writable {
            flags |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event {
            events: flags,
            u64: handle as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, handle, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Bring the kernel interest set in line with the registry after a removal.
    fn sync_after_removal(&self, handle: SocketHandle) {
        let interest = self.registry.interest(handle);
        let result = if interest.is_empty() {
            self.ctl(libc::EPOLL_CTL_DEL, handle, interest)
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, handle, interest)
        };
        // A socket closed before deregistration has already left the set.
        if let Err(e) = result {
            tracing::trace!(handle, error = %e, "epoll_ctl after removal");
        }
    }
}

fn readiness(flags: u32) -> Readiness {
    Readiness {
        readable: flags & libc::EPOLLIN as u32 != 0,
        writable: flags & libc::EPOLLOUT as u32 != 0,
        error: flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0,
    }
}

impl EventManager for EpollEventManager {
    fn register_socket_event(
        &mut self,
        handle: SocketHandle,
        event: EventType,
        callback: SocketCallback,
    ) -> Result<(), Error> {
        let before = self.registry.interest(handle);
        self.registry.insert(handle, event, callback)?;
        let after = self.registry.interest(handle);
        if before == after {
            return Ok(());
        }
        let op = if before.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        if let Err(e) = self.ctl(op, handle, after) {
            self.registry.remove(handle, event);
            return Err(e.into());
        }
        Ok(())
    }

    fn deregister_socket_event(&mut self, handle: SocketHandle, event: EventType) -> bool {
        if !self.registry.remove(handle, event) {
            return false;
        }
        self.sync_after_removal(handle);
        true
    }

    fn deregister_socket(&mut self, handle: SocketHandle) -> usize {
        let n = self.registry.remove_socket(handle);
        if n > 0 {
            self.sync_after_removal(handle);
        }
        n
    }

    fn deregister_all(&mut self) {
        let handles: Vec<SocketHandle> = self.registry.sockets().map(|(fd, _)| fd).collect();
        self.registry.clear();
        for handle in handles {
            self.sync_after_removal(handle);
        }
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

    fn poll(&mut self, timeout: Option<Duration>, ready: &mut Vec<ReadyEvent>) -> io::Result<usize> {
        let rc = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
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
        let mut n = 0;
        for ev in &self.events[..rc as usize] {
            // epoll_event is packed on x86_64; copy the fields out.
            let flags = ev.events;
            let handle = ev.u64 as SocketHandle;
            n += self.registry.collect_ready(handle, readiness(flags), ready);
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn level_triggered_until_drained() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let mut engine = EpollEventManager::new(8).unwrap();
        engine
            .register_socket_event(b.as_raw_fd(), EventType::Read, Box::new(|| {}))
            .unwrap();
        a.write_all(b"xy").unwrap();

        let mut ready = Vec::new();
        let wait = Some(Duration::from_secs(5));
        assert_eq!(engine.poll(wait, &mut ready).unwrap(), 1);
        ready.clear();
        // Still unread: fires again.
        assert_eq!(engine.poll(wait, &mut ready).unwrap(), 1);
        ready.clear();

        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(
            engine
                .poll(Some(Duration::from_millis(20)), &mut ready)
                .unwrap(),
            0
        );
    }

    #[test]
    fn interest_follows_registrations() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let mut engine = EpollEventManager::new(8).unwrap();
        engine
            .register_socket_event(fd, EventType::Read, Box::new(|| {}))
            .unwrap();
        engine
            .register_socket_event(fd, EventType::Write, Box::new(|| {}))
            .unwrap();

        let mut ready = Vec::new();
        engine.poll(Some(Duration::from_secs(5)), &mut ready).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].event, EventType::Write);

        assert!(engine.deregister_socket_event(fd, EventType::Write));
        ready.clear();
        engine
            .poll(Some(Duration::from_millis(20)), &mut ready)
            .unwrap();
        assert!(ready.is_empty());
        assert_eq!(engine.num_socket_events(fd), 1);
    }

    #[test]
    fn bad_descriptor_rolls_back() {
        let mut engine = EpollEventManager::new(8).unwrap();
        // Far above any descriptor this test process has open.
        let err = engine
            .register_socket_event(1 << 20, EventType::Read, Box::new(|| {}))
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(engine.num_events(), 0);
    }
}
