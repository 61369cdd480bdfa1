//! io_uring engine.
//!
//! Each registered socket has at most one armed one-shot `POLL_ADD` covering
//! its combined interest. A completion disarms the socket; it is re-armed at
//! the start of the next [`poll`](EventManager::poll), after its callbacks
//! ran, which gives the same level-triggered behavior as poll(2). Interest
//! changes cancel the armed poll with `POLL_REMOVE` and arm a new one under a
//! fresh generation, so late completions of the old poll are ignored.

use std::collections::{HashMap, HashSet};
use std::io;
use std::time::Duration;

use io_uring::types::{Fd, SubmitArgs, Timespec};
use io_uring::{IoUring, opcode, squeue};

use crate::error::Error;
use crate::event::{EventType, SocketCallback, SocketHandle};
use crate::poller::completion::{OpTag, UserData};
use crate::poller::registry::Registry;
use crate::poller::{EventManager, Interest, Readiness, ReadyEvent};

#[derive(Debug, Clone, Copy)]
struct Armed {
    generation: u32,
    interest: Interest,
}

/// Engine built on io_uring `POLL_ADD`.
pub struct UringEventManager {
    ring: IoUring,
    registry: Registry,
    armed: HashMap<SocketHandle, Armed>,
    /// Sockets whose armed poll no longer matches the registry.
    stale: HashSet<SocketHandle>,
    next_generation: u32,
    cqe_batch: Vec<(u64, i32)>,
}

impl UringEventManager {
    pub fn new(entries: u32, events_capacity: usize) -> io::Result<Self> {
        let ring = IoUring::new(entries)?;
        Ok(Self {
            ring,
            registry: Registry::new(),
            armed: HashMap::new(),
            stale: HashSet::new(),
            next_generation: 0,
            cqe_batch: Vec::with_capacity(events_capacity),
        })
    }

    /// Push an SQE, submitting first if the queue is full.
    ///
    /// # Safety
    /// The SQE must reference valid memory for the lifetime of the operation.
    unsafe fn push_sqe(&mut self, entry: squeue::Entry) -> io::Result<()> {
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
                if self.ring.submission().push(&entry).is_err() {
                    return Err(io::Error::other("SQ still full after submit"));
                }
            }
        }
        Ok(())
    }

    fn arm(&mut self, handle: SocketHandle, interest: Interest) -> io::Result<()> {
        let generation = self.next_generation & UserData::GENERATION_MASK;
        self.next_generation = self.next_generation.wrapping_add(1);
        let mut mask = 0u32;
        if interest.readable {
            mask |= libc::POLLIN as u32;
        }
        if interest.writable {
            mask |= libc::POLLOUT as u32;
        }
        let entry = opcode::PollAdd::new(Fd(handle), mask)
            .build()
            .user_data(UserData::encode(OpTag::PollAdd, generation, handle).raw());
        // Safety: POLL_ADD references no user memory.
        unsafe { self.push_sqe(entry)? };
        self.armed.insert(
            handle,
            Armed {
                generation,
                interest,
            },
        );
        Ok(())
    }

    fn disarm(&mut self, handle: SocketHandle) -> io::Result<()> {
        let Some(armed) = self.armed.remove(&handle) else {
            return Ok(());
        };
        let target = UserData::encode(OpTag::PollAdd, armed.generation, handle).raw();
        let entry = opcode::PollRemove::new(target)
            .build()
            .user_data(UserData::encode(OpTag::PollRemove, armed.generation, handle).raw());
        // Safety: POLL_REMOVE references no user memory.
        unsafe { self.push_sqe(entry) }
    }

    /// Make the armed poll for `handle` match its registrations.
    fn sync(&mut self, handle: SocketHandle) -> io::Result<()> {
        let want = self.registry.interest(handle);
        if let Some(armed) = self.armed.get(&handle) {
            if armed.interest == want {
                return Ok(());
            }
            self.disarm(handle)?;
        }
        if want.is_empty() {
            return Ok(());
        }
        self.arm(handle, want)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let result = match timeout {
            Some(d) if d.is_zero() => self.ring.submit(),
            Some(d) => {
                let ts = Timespec::new().sec(d.as_secs()).nsec(d.subsec_nanos());
                let args = SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args)
            }
            None => self.ring.submit_and_wait(1),
        };
        match result {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.raw_os_error(), Some(libc::ETIME | libc::EINTR | libc::EBUSY)) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn readiness(result: i32) -> Readiness {
    if result < 0 {
        return Readiness {
            error: true,
            ..Readiness::default()
        };
    }
    let mask = result as u32;
    Readiness {
        readable: mask & libc::POLLIN as u32 != 0,
        writable: mask & libc::POLLOUT as u32 != 0,
        error: mask & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) as u32 != 0,
    }
}

impl EventManager for UringEventManager {
    fn register_socket_event(
        &mut self,
        handle: SocketHandle,
        event: EventType,
        callback: SocketCallback,
    ) -> Result<(), Error> {
        self.registry.insert(handle, event, callback)?;
        self.stale.insert(handle);
        Ok(())
    }

    fn deregister_socket_event(&mut self, handle: SocketHandle, event: EventType) -> bool {
        let removed = self.registry.remove(handle, event);
        if removed {
            self.stale.insert(handle);
        }
        removed
    }

    fn deregister_socket(&mut self, handle: SocketHandle) -> usize {
        let n = self.registry.remove_socket(handle);
        if n > 0 {
            self.stale.insert(handle);
        }
        n
    }

    fn deregister_all(&mut self) {
        self.registry.clear();
        self.stale.extend(self.armed.keys().copied());
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
        let pending: Vec<SocketHandle> = self.stale.drain().collect();
        for handle in pending {
            self.sync(handle)?;
        }
        self.wait(timeout)?;

        let mut batch = std::mem::take(&mut self.cqe_batch);
        batch.extend(self.ring.completion().map(|cqe| (cqe.user_data(), cqe.result())));

        let mut n = 0;
        for &(raw, result) in &batch {
            let ud = UserData(raw);
            if ud.tag() != Some(OpTag::PollAdd) {
                continue;
            }
            let handle = ud.fd();
            match self.armed.get(&handle) {
                Some(armed) if armed.generation == ud.generation() => {}
                _ => continue,
            }
            self.armed.remove(&handle);
            self.stale.insert(handle);
            if result == -libc::ECANCELED {
                continue;
            }
            n += self.registry.collect_ready(handle, readiness(result), ready);
        }
        batch.clear();
        self.cqe_batch = batch;
        Ok(n)
    }

    fn take_callback(&mut self, ready: &ReadyEvent) -> Option<SocketCallback> {
        self.registry.take(ready)
    }

    fn restore_callback(&mut self, ready: &ReadyEvent, callback: SocketCallback) {
        self.registry.restore(ready, callback);
    }
}
