//! Socket event model shared by the poll engines and the facade.

use std::os::fd::RawFd;

/// OS socket descriptor. The manager never owns or closes registered sockets.
pub type SocketHandle = RawFd;

/// Callback invoked on the dispatcher thread each time its socket event is ready.
pub type SocketCallback = Box<dyn FnMut() + Send + 'static>;

/// One-shot callback used for timers and the execute queue.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Readiness condition a callback is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    /// Listening socket has a pending connection.
    Accept,
    /// Non-blocking connect completed (writable).
    Connect,
    /// Socket is readable.
    Read,
    /// Socket is writable.
    Write,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::Accept,
        EventType::Connect,
        EventType::Read,
        EventType::Write,
    ];

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            EventType::Accept => 0,
            EventType::Connect => 1,
            EventType::Read => 2,
            EventType::Write => 3,
        }
    }

    /// True for events satisfied by readability.
    #[inline]
    pub fn is_readable(self) -> bool {
        matches!(self, EventType::Accept | EventType::Read)
    }

    /// True for events satisfied by writability.
    #[inline]
    pub fn is_writable(self) -> bool {
        matches!(self, EventType::Connect | EventType::Write)
    }

    /// Whether `self` and `other` may not be registered on the same socket.
    ///
    /// A listening socket only ever accepts, and a connecting socket's
    /// writability means "connect finished", so it cannot also mean "send".
    pub fn conflicts_with(self, other: EventType) -> bool {
        if self == other {
            return false;
        }
        match (self, other) {
            (EventType::Accept, _) | (_, EventType::Accept) => true,
            (EventType::Connect, EventType::Write) | (EventType::Write, EventType::Connect) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_is_exclusive() {
        for other in [EventType::Connect, EventType::Read, EventType::Write] {
            assert!(EventType::Accept.conflicts_with(other));
            assert!(other.conflicts_with(EventType::Accept));
        }
        assert!(!EventType::Accept.conflicts_with(EventType::Accept));
    }

    #[test]
    fn connect_and_write_share_writability() {
        assert!(EventType::Connect.conflicts_with(EventType::Write));
        assert!(!EventType::Connect.conflicts_with(EventType::Read));
        assert!(!EventType::Read.conflicts_with(EventType::Write));
    }

    #[test]
    fn indices_are_distinct() {
        let mut seen = [false; 4];
        for ev in EventType::ALL {
            assert!(!seen[ev.index()]);
            seen[ev.index()] = true;
        }
    }
}
