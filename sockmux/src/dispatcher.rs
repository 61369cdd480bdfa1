//! The dispatcher thread.
//!
//! Each iteration:
//!
//! 1. computes the poll timeout: zero with jobs queued, else the time to the
//!    earliest timer, else unbounded;
//! 2. waits in the engine and invokes every ready socket callback (the
//!    control channel's callback applies marshaled requests);
//! 3. runs the jobs queued before this step;
//! 4. fires expired timers in deadline order;
//! 5. exits if a terminate request was applied.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use crate::channel::ControlChannel;
use crate::manager::{MAX_CHANNEL_REINITIALIZATIONS, Shared, lock};
use crate::metrics;
use crate::poller::ReadyEvent;
use crate::request::Request;
use crate::time_metrics::TimeCategory;
use crate::timer::{ExpiredBatch, TIMER_BATCH};

/// Log and abort the process. A panic would only take down the dispatcher
/// thread and leave producers waiting on a dead channel.
pub(crate) fn fatal(message: &str) -> ! {
    error!("{message}; aborting");
    std::process::abort()
}

/// Clears the dispatcher identity and releases stranded requests when the
/// loop exits, including by unwinding out of a callback.
struct ExitGuard<'a> {
    shared: &'a Shared,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        let leftover = self.shared.requests.drain();
        if !leftover.is_empty() {
            debug!(count = leftover.len(), "dropping requests queued after terminate");
        }
        drop(leftover);
        self.shared.set_dispatcher_thread(None);
    }
}

impl Shared {
    pub(crate) fn run(self: Arc<Self>) {
        self.set_dispatcher_thread(Some(thread::current().id()));
        let _exit = ExitGuard { shared: &self };
        debug!("dispatcher started");

        let collect = self.config.collect_time_metrics;
        let mut ready: Vec<ReadyEvent> = Vec::with_capacity(self.config.events_capacity);
        let mut expired: ExpiredBatch = std::array::from_fn(|_| None);

        loop {
            let timeout = self.poll_timeout();
            if collect {
                self.time_metrics.switch_to(TimeCategory::IoBound);
            }
            let polled = self.lock_engine().poll(timeout, &mut ready);
            if collect {
                self.time_metrics.switch_to(TimeCategory::CpuBound);
            }

            match polled {
                Ok(_) => {
                    for event in ready.drain(..) {
                        self.dispatch_ready(&event);
                    }
                }
                Err(e) => {
                    ready.clear();
                    warn!(error = %e, "poll failed");
                    let healthy = self
                        .current_channel()
                        .is_some_and(|channel| channel.is_server_connected());
                    if !healthy {
                        self.reinitialize_control_channel();
                    }
                }
            }

            self.run_execute_queue();
            self.fire_expired_timers(&mut expired);

            if self.terminate.load(Ordering::Acquire) {
                break;
            }
        }
        debug!("dispatcher stopped");
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if !lock(&self.execute_queue).is_empty() {
            return Some(Duration::ZERO);
        }
        self.timers
            .min_time()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn dispatch_ready(&self, event: &ReadyEvent) {
        let Some(mut callback) = self.lock_engine().take_callback(event) else {
            return;
        };
        metrics::SOCKET_CALLBACKS.increment();
        callback();
        self.lock_engine().restore_callback(event, callback);
    }

    fn run_execute_queue(&self) {
        let jobs = std::mem::take(&mut *lock(&self.execute_queue));
        for job in jobs {
            metrics::EXECUTED_JOBS.increment();
            job();
        }
    }

    fn fire_expired_timers(&self, batch: &mut ExpiredBatch) {
        let now = Instant::now();
        loop {
            let n = self.timers.pop_expired(now, batch);
            for callback in batch[..n].iter_mut().filter_map(Option::take) {
                metrics::TIMER_CALLBACKS.increment();
                callback();
            }
            if n < TIMER_BATCH {
                break;
            }
        }
    }

    // ── Requests ─────────────────────────────────────────────────────

    pub(crate) fn on_control_channel_readable(self: &Arc<Self>) {
        let Some(channel) = self.current_channel() else {
            return;
        };
        match channel.server_read() {
            Ok(owed) => {
                // `owed` is only a lower bound: a producer whose wake coalesced
                // onto a failing write has no byte of its own.
                let mut applied = 0usize;
                while let Some(request) = self.requests.pop() {
                    self.apply(request);
                    applied += 1;
                }
                trace!(owed, applied, "drained control channel");
            }
            Err(e) => {
                warn!(error = %e, "control channel read failed");
                self.reinitialize_control_channel();
            }
        }
    }

    fn apply(self: &Arc<Self>, request: Request) {
        metrics::REQUESTS_APPLIED.increment();
        trace!(request = ?request, "applying request");
        match request {
            Request::NoOp { ack } => {
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Request::Terminate => self.terminate.store(true, Ordering::Release),
            Request::RegisterSocketEvent {
                handle,
                event,
                callback,
            } => {
                if let Err(e) = self.register_direct(handle, event, callback) {
                    warn!(handle, ?event, error = %e, "socket event registration rejected");
                }
            }
            Request::DeregisterSocketEvent { handle, event } => {
                self.deregister_event_direct(handle, event);
            }
            Request::DeregisterSocket { handle } => {
                self.deregister_socket_direct(handle);
            }
            Request::DeregisterAllSocketEvents => self.deregister_all_direct(),
            Request::Execute(job) => lock(&self.execute_queue).push(job),
            Request::IsRegistered {
                handle,
                event,
                reply,
            } => {
                let registered = self.lock_engine().is_registered(handle, event);
                let _ = reply.send(registered);
            }
            Request::NumSocketEvents { handle, reply } => {
                let n = self.lock_engine().num_socket_events(handle);
                let _ = reply.send(n);
            }
            Request::CanRegisterSockets { reply } => {
                let ok = self.lock_engine().can_register_sockets();
                let _ = reply.send(ok);
            }
        }
    }

    // ── Self-healing ─────────────────────────────────────────────────

    /// Replace a broken control channel. Runs on the dispatcher thread.
    ///
    /// Requests still queued lost their wake-up with the old channel, so they
    /// are applied here. A helper thread then confirms the new channel with a
    /// barrier round trip.
    pub(crate) fn reinitialize_control_channel(self: &Arc<Self>) {
        let attempt = self.reinitializations.load(Ordering::Acquire) + 1;
        metrics::CHANNEL_REINITIALIZATIONS.increment();
        if attempt > MAX_CHANNEL_REINITIALIZATIONS {
            fatal(&format!(
                "control channel failed {attempt} times (limit {MAX_CHANNEL_REINITIALIZATIONS})"
            ));
        }
        warn!(
            attempt,
            limit = MAX_CHANNEL_REINITIALIZATIONS,
            "control channel broken; reinitializing"
        );

        let channel = match ControlChannel::open(self.config.channel_transport) {
            Ok(channel) => Arc::new(channel),
            Err(e) => fatal(&format!("cannot reopen control channel: {e}")),
        };
        let old = self.replace_channel(Some(Arc::clone(&channel)));
        {
            let mut engine = self.lock_engine();
            if let Some(old) = &old {
                // Producers still holding the old channel now fail their write and withdraw.
                old.shutdown();
                engine.deregister_socket(old.server_fd());
            }
            self.register_control_channel(&mut **engine, &channel);
        }
        drop(old);

        for request in self.requests.drain() {
            self.apply(request);
        }
        // Published last: an observer of the new count only ever sees the new channel.
        self.reinitializations.store(attempt, Ordering::Release);

        let weak = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-reinit", self.config.dispatcher.name))
            .spawn(move || {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                match shared.barrier() {
                    Ok(()) => debug!("control channel reinitialized"),
                    Err(e) => warn!(error = %e, "barrier after reinitialization failed"),
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "cannot spawn reinitialization barrier thread");
        }
    }
}
