//! Per-socket registration table shared by every poll backend.
//!
//! Each socket has one slot per [`EventType`]. A slot owns its callback and a
//! registration id; the id lets the dispatcher return a checked-out callback
//! to the exact registration it came from, and drop it if that registration
//! was removed or replaced while the callback ran.

use std::collections::HashMap;

use crate::error::Error;
use crate::event::{EventType, SocketCallback, SocketHandle};
use crate::poller::{Interest, ReadyEvent, Readiness};

struct Slot {
    id: u64,
    /// `None` while checked out to the dispatcher.
    callback: Option<SocketCallback>,
}

type SocketSlots = [Option<Slot>; 4];

#[derive(Default)]
pub(crate) struct Registry {
    sockets: HashMap<SocketHandle, SocketSlots>,
    len: usize,
    next_id: u64,
}

/// Outcome of [`Registry::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Inserted {
    /// A new (socket, event) pair; `new_socket` is set for the socket's first event.
    New { new_socket: bool },
    /// An existing registration's callback was replaced.
    Replaced,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `(handle, event)`.
    pub(crate) fn insert(
        &mut self,
        handle: SocketHandle,
        event: EventType,
        callback: SocketCallback,
    ) -> Result<Inserted, Error> {
        if handle < 0 {
            return Err(Error::InvalidSocket(handle));
        }
        let id = self.next_id;
        let new_socket = !self.sockets.contains_key(&handle);
        let slots = self.sockets.entry(handle).or_default();
        let conflict = EventType::ALL
            .iter()
            .any(|other| slots[other.index()].is_some() && event.conflicts_with(*other));
        if conflict {
            if new_socket {
                self.sockets.remove(&handle);
            }
            return Err(Error::IncompatibleEvent { handle, event });
        }
        self.next_id += 1;
        let slot = &mut slots[event.index()];
        let replaced = slot.is_some();
        *slot = Some(Slot {
            id,
            callback: Some(callback),
        });
        if replaced {
            Ok(Inserted::Replaced)
        } else {
            self.len += 1;
            Ok(Inserted::New { new_socket })
        }
    }

    /// Remove one registration. Returns `true` if it existed.
    pub(crate) fn remove(&mut self, handle: SocketHandle, event: EventType) -> bool {
        let Some(slots) = self.sockets.get_mut(&handle) else {
            return false;
        };
        if slots[event.index()].take().is_none() {
            return false;
        }
        self.len -= 1;
        if slots.iter().all(Option::is_none) {
            self.sockets.remove(&handle);
        }
        true
    }

    /// Remove every registration on `handle`. Returns how many were removed.
    pub(crate) fn remove_socket(&mut self, handle: SocketHandle) -> usize {
        let Some(slots) = self.sockets.remove(&handle) else {
            return 0;
        };
        let n = slots.iter().filter(|s| s.is_some()).count();
        self.len -= n;
        n
    }

    pub(crate) fn clear(&mut self) {
        self.sockets.clear();
        self.len = 0;
    }

    /// Total (socket, event) registrations.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Number of distinct sockets.
    pub(crate) fn num_sockets(&self) -> usize {
        self.sockets.len()
    }

    pub(crate) fn contains_socket(&self, handle: SocketHandle) -> bool {
        self.sockets.contains_key(&handle)
    }

    pub(crate) fn count(&self, handle: SocketHandle) -> usize {
        self.sockets
            .get(&handle)
            .map_or(0, |slots| slots.iter().filter(|s| s.is_some()).count())
    }

    pub(crate) fn contains(&self, handle: SocketHandle, event: EventType) -> bool {
        self.sockets
            .get(&handle)
            .is_some_and(|slots| slots[event.index()].is_some())
    }

    /// Readiness the socket currently waits for.
    pub(crate) fn interest(&self, handle: SocketHandle) -> Interest {
        let mut interest = Interest::default();
        if let Some(slots) = self.sockets.get(&handle) {
            for event in EventType::ALL {
                if slots[event.index()].is_some() {
                    interest.readable |= event.is_readable();
                    interest.writable |= event.is_writable();
                }
            }
        }
        interest
    }

    /// Every registered socket with its interest.
    pub(crate) fn sockets(&self) -> impl Iterator<Item = (SocketHandle, Interest)> + '_ {
        self.sockets.keys().map(|&fd| (fd, self.interest(fd)))
    }

    /// Append the registrations satisfied by `readiness` on `handle`.
    pub(crate) fn collect_ready(
        &self,
        handle: SocketHandle,
        readiness: Readiness,
        out: &mut Vec<ReadyEvent>,
    ) -> usize {
        let Some(slots) = self.sockets.get(&handle) else {
            return 0;
        };
        let mut n = 0;
        for event in EventType::ALL {
            let Some(slot) = &slots[event.index()] else {
                continue;
            };
            let fire = readiness.error
                || (event.is_readable() && readiness.readable)
                || (event.is_writable() && readiness.writable);
            if fire {
                out.push(ReadyEvent {
                    handle,
                    event,
                    id: slot.id,
                });
                n += 1;
            }
        }
        n
    }

    /// Check out the callback for a ready registration.
    pub(crate) fn take(&mut self, ready: &ReadyEvent) -> Option<SocketCallback> {
        let slot = self.sockets.get_mut(&ready.handle)?[ready.event.index()].as_mut()?;
        if slot.id != ready.id {
            return None;
        }
        slot.callback.take()
    }

    /// Return a checked-out callback. Dropped if its registration is gone.
    pub(crate) fn restore(&mut self, ready: &ReadyEvent, callback: SocketCallback) {
        let slot = self
            .sockets
            .get_mut(&ready.handle)
            .and_then(|slots| slots[ready.event.index()].as_mut());
        if let Some(slot) = slot
            && slot.id == ready.id
            && slot.callback.is_none()
        {
            slot.callback = Some(callback);
        }
    }
}
