//! Thread-safe deadline-ordered timer queue.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use slab::Slab;

use crate::error::Error;
use crate::event::Job;

/// Expired timers are popped in batches of this many callbacks, so the queue
/// lock is never held while a callback runs.
pub(crate) const TIMER_BATCH: usize = 16;

/// Opaque handle to a pending timer.
///
/// Carries the slab key and the registration sequence number; a handle whose
/// timer already fired or was removed never matches a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    key: usize,
    seq: u64,
}

struct Entry {
    deadline: Instant,
    seq: u64,
    callback: Job,
}

#[derive(Default)]
struct Inner {
    entries: Slab<Entry>,
    /// (deadline, seq) -> slab key. `seq` keeps equal deadlines in registration order.
    order: BTreeMap<(Instant, u64), usize>,
    next_seq: u64,
}

impl Inner {
    fn is_min(&self, deadline: Instant, seq: u64) -> bool {
        self.order
            .first_key_value()
            .is_some_and(|(&first, _)| first == (deadline, seq))
    }

    fn lookup(&self, handle: TimerHandle) -> Option<&Entry> {
        self.entries
            .get(handle.key)
            .filter(|entry| entry.seq == handle.seq)
    }
}

/// Callback popped by [`TimerQueue::pop_expired`].
pub(crate) type ExpiredBatch = [Option<Job>; TIMER_BATCH];

/// Deadline-ordered queue of one-shot callbacks. Every method may be called
/// from any thread.
#[derive(Default)]
pub struct TimerQueue {
    inner: Mutex<Inner>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a timer. Returns its handle and whether it is now the earliest deadline.
    pub fn add(&self, deadline: Instant, callback: Job) -> (TimerHandle, bool) {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let key = inner.entries.insert(Entry {
            deadline,
            seq,
            callback,
        });
        inner.order.insert((deadline, seq), key);
        (TimerHandle { key, seq }, inner.is_min(deadline, seq))
    }

    /// Move a pending timer to `deadline`. Returns whether it is now the earliest.
    pub fn update(&self, handle: TimerHandle, deadline: Instant) -> Result<bool, Error> {
        let mut inner = self.lock();
        let old = inner.lookup(handle).ok_or(Error::UnknownTimer)?.deadline;
        inner.order.remove(&(old, handle.seq));
        inner.order.insert((deadline, handle.seq), handle.key);
        if let Some(entry) = inner.entries.get_mut(handle.key) {
            entry.deadline = deadline;
        }
        Ok(inner.is_min(deadline, handle.seq))
    }

    /// Remove a pending timer, dropping its callback. Returns `true` if it was pending.
    pub fn remove(&self, handle: TimerHandle) -> bool {
        let removed = {
            let mut inner = self.lock();
            let Some(deadline) = inner.lookup(handle).map(|e| e.deadline) else {
                return false;
            };
            inner.order.remove(&(deadline, handle.seq));
            inner.entries.remove(handle.key)
        };
        drop(removed);
        true
    }

    /// Remove every timer. Returns how many were removed.
    pub fn remove_all(&self) -> usize {
        let drained = {
            let mut inner = self.lock();
            inner.order.clear();
            std::mem::take(&mut inner.entries)
        };
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest pending deadline.
    pub fn min_time(&self) -> Option<Instant> {
        self.lock().order.first_key_value().map(|(&(deadline, _), _)| deadline)
    }

    /// Pop up to [`TIMER_BATCH`] timers with `deadline <= now` into `out`, in
    /// deadline order. Returns how many were popped.
    pub(crate) fn pop_expired(&self, now: Instant, out: &mut ExpiredBatch) -> usize {
        let mut inner = self.lock();
        let mut n = 0;
        while n < TIMER_BATCH {
            let Some((&(deadline, _), &key)) = inner.order.first_key_value() else {
                break;
            };
            if deadline > now {
                break;
            }
            inner.order.pop_first();
            let entry = inner.entries.remove(key);
            out[n] = Some(entry.callback);
            n += 1;
        }
        n
    }
}
