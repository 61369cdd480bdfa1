//! Requests marshaled from producer threads to the dispatcher.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam_channel::Sender;

use crate::event::{EventType, Job, SocketCallback, SocketHandle};

/// A unit of work for the dispatcher thread.
///
/// Synchronous requests carry a one-shot reply sender; the producer blocks on
/// the paired receiver. If the dispatcher drops the request unanswered, the
/// receiver disconnects instead of blocking forever.
pub(crate) enum Request {
    /// Wake-up or barrier. `ack` is answered once every earlier request has been applied.
    NoOp { ack: Option<Sender<()>> },
    /// Stop the dispatcher after the current iteration.
    Terminate,
    RegisterSocketEvent {
        handle: SocketHandle,
        event: EventType,
        callback: SocketCallback,
    },
    DeregisterSocketEvent {
        handle: SocketHandle,
        event: EventType,
    },
    DeregisterSocket {
        handle: SocketHandle,
    },
    DeregisterAllSocketEvents,
    /// Append a job to the execute queue.
    Execute(Job),
    IsRegistered {
        handle: SocketHandle,
        event: EventType,
        reply: Sender<bool>,
    },
    NumSocketEvents {
        handle: SocketHandle,
        reply: Sender<usize>,
    },
    CanRegisterSockets {
        reply: Sender<bool>,
    },
}

impl Request {
    /// Short name for logs.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Request::NoOp { .. } => "no_op",
            Request::Terminate => "terminate",
            Request::RegisterSocketEvent { .. } => "register_socket_event",
            Request::DeregisterSocketEvent { .. } => "deregister_socket_event",
            Request::DeregisterSocket { .. } => "deregister_socket",
            Request::DeregisterAllSocketEvents => "deregister_all_socket_events",
            Request::Execute(_) => "execute",
            Request::IsRegistered { .. } => "is_registered",
            Request::NumSocketEvents { .. } => "num_socket_events",
            Request::CanRegisterSockets { .. } => "can_register_sockets",
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::RegisterSocketEvent { handle, event, .. }
            | Request::DeregisterSocketEvent { handle, event }
            | Request::IsRegistered { handle, event, .. } => f
                .debug_struct(self.kind())
                .field("handle", handle)
                .field("event", event)
                .finish(),
            Request::DeregisterSocket { handle } | Request::NumSocketEvents { handle, .. } => f
                .debug_struct(self.kind())
                .field("handle", handle)
                .finish(),
            _ => f.write_str(self.kind()),
        }
    }
}

/// Ticket returned by [`RequestQueue::push`], used to withdraw the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ticket(u64);

#[derive(Default)]
struct Inner {
    queue: VecDeque<(Ticket, Request)>,
    next_ticket: u64,
}

/// FIFO shared by all producers and the dispatcher.
#[derive(Default)]
pub(crate) struct RequestQueue {
    inner: Mutex<Inner>,
}

impl RequestQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, request: Request) -> Ticket {
        let mut inner = self.lock();
        let ticket = Ticket(inner.next_ticket);
        inner.next_ticket += 1;
        inner.queue.push_back((ticket, request));
        ticket
    }

    pub(crate) fn pop(&self) -> Option<Request> {
        self.lock().queue.pop_front().map(|(_, request)| request)
    }

    /// Remove a request that was never announced to the dispatcher.
    /// `None` if the dispatcher already took it.
    pub(crate) fn withdraw(&self, ticket: Ticket) -> Option<Request> {
        let mut inner = self.lock();
        let pos = inner.queue.iter().rposition(|(t, _)| *t == ticket)?;
        inner.queue.remove(pos).map(|(_, request)| request)
    }

    /// Requests pushed and not yet taken.
    pub(crate) fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Take every queued request.
    pub(crate) fn drain(&self) -> Vec<Request> {
        self.lock().queue.drain(..).map(|(_, request)| request).collect()
    }
}
