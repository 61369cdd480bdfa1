//! The thread-safe facade.
//!
//! Every public operation picks one of three paths:
//!
//! - on the dispatcher thread it acts on the poll engine directly;
//! - while enabled, from any other thread, it marshals a [`Request`] through
//!   the control channel (synchronous queries block on a one-shot reply);
//! - while disabled it takes the state lock exclusively and acts directly.
//!
//! Timers bypass marshaling: the timer queue is thread-safe, and a change of
//! the earliest deadline only needs a wake-up so the dispatcher recomputes its
//! poll timeout.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::channel::ControlChannel;
use crate::config::Config;
use crate::error::Error;
use crate::event::{EventType, Job, SocketCallback, SocketHandle};
use crate::metrics;
use crate::poller::{self, EventManager};
use crate::request::{Request, RequestQueue};
use crate::time_metrics::{TimeCategory, TimeMetrics};
use crate::timer::{TimerHandle, TimerQueue};

/// Control channel rebuilds tolerated over a manager's lifetime. One more
/// failure aborts the process.
pub const MAX_CHANNEL_REINITIALIZATIONS: usize = 3;

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disabled,
    Enabled,
}

pub(crate) struct Lifecycle {
    state: State,
    dispatcher: Option<JoinHandle<()>>,
}

/// How a facade call reaches the engine.
enum Route<'a> {
    Dispatcher,
    Enabled {
        _guard: RwLockReadGuard<'a, Lifecycle>,
        channel: Arc<ControlChannel>,
    },
    Disabled {
        _guard: RwLockWriteGuard<'a, Lifecycle>,
    },
}

/// State shared between the facade and the dispatcher thread.
pub(crate) struct Shared {
    pub(crate) config: Config,
    lifecycle: RwLock<Lifecycle>,
    enabled: AtomicBool,
    dispatcher_thread: Mutex<Option<ThreadId>>,
    engine: Mutex<Box<dyn EventManager>>,
    limited_capacity: bool,
    pub(crate) timers: TimerQueue,
    pub(crate) requests: RequestQueue,
    channel: Mutex<Option<Arc<ControlChannel>>>,
    pub(crate) execute_queue: Mutex<Vec<Job>>,
    /// Engine registrations minus the control channel's own.
    num_user_events: AtomicUsize,
    internal_events: AtomicUsize,
    pub(crate) reinitializations: AtomicUsize,
    pub(crate) terminate: AtomicBool,
    pub(crate) time_metrics: TimeMetrics,
}

impl Shared {
    fn read_lifecycle(&self) -> RwLockReadGuard<'_, Lifecycle> {
        self.lifecycle.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lifecycle(&self) -> RwLockWriteGuard<'_, Lifecycle> {
        self.lifecycle.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_engine(&self) -> MutexGuard<'_, Box<dyn EventManager>> {
        lock(&self.engine)
    }

    pub(crate) fn current_channel(&self) -> Option<Arc<ControlChannel>> {
        lock(&self.channel).clone()
    }

    pub(crate) fn replace_channel(&self, channel: Option<Arc<ControlChannel>>) -> Option<Arc<ControlChannel>> {
        std::mem::replace(&mut *lock(&self.channel), channel)
    }

    pub(crate) fn set_dispatcher_thread(&self, id: Option<ThreadId>) {
        *lock(&self.dispatcher_thread) = id;
    }

    pub(crate) fn is_dispatcher_thread(&self) -> bool {
        *lock(&self.dispatcher_thread) == Some(thread::current().id())
    }

    fn mark_enabled(&self) {
        if !self.enabled.swap(true, Ordering::AcqRel) {
            metrics::MANAGERS_ENABLED.increment();
        }
    }

    /// Clear the enabled flag; the gauge follows the flag exactly.
    fn mark_disabled(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            metrics::MANAGERS_ENABLED.decrement();
        }
    }

    fn route(&self) -> Result<Route<'_>, Error> {
        loop {
            if self.is_dispatcher_thread() {
                return Ok(Route::Dispatcher);
            }
            {
                let guard = self.read_lifecycle();
                if guard.state == State::Enabled {
                    let channel = self.current_channel().ok_or(Error::NotEnabled)?;
                    return Ok(Route::Enabled {
                        _guard: guard,
                        channel,
                    });
                }
            }
            let guard = self.write_lifecycle();
            if guard.state == State::Disabled {
                return Ok(Route::Disabled { _guard: guard });
            }
            // Enabled between the two lock acquisitions; marshal instead.
        }
    }

    // ── Marshaling ───────────────────────────────────────────────────

    /// Queue `request` and wake the dispatcher. On a failed write the request
    /// is withdrawn and dropped here, unless the dispatcher already took it.
    pub(crate) fn submit(&self, channel: &ControlChannel, request: Request, force: bool) -> Result<(), Error> {
        let ticket = self.requests.push(request);
        if let Err(e) = channel.client_write(force) {
            let Some(request) = self.requests.withdraw(ticket) else {
                debug!(error = %e, "wake failed after the dispatcher took the request");
                return Ok(());
            };
            metrics::REQUESTS_WITHDRAWN.increment();
            debug!(request = ?request, error = %e, "withdrew request after failed wake");
            return Err(Error::ChannelWrite(e));
        }
        Ok(())
    }

    /// Submit a synchronous request and block until the dispatcher answers.
    pub(crate) fn call<T>(
        &self,
        channel: &ControlChannel,
        make: impl FnOnce(Sender<T>) -> Request,
    ) -> Result<T, Error> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.submit(channel, make(tx), true)?;
        rx.recv().map_err(|_| Error::RequestDropped)
    }

    /// Round trip through the current control channel from a non-dispatcher thread.
    pub(crate) fn barrier(&self) -> Result<(), Error> {
        let lifecycle = self.read_lifecycle();
        if lifecycle.state != State::Enabled {
            return Err(Error::NotEnabled);
        }
        let channel = self.current_channel().ok_or(Error::NotEnabled)?;
        self.call(&channel, |ack| Request::NoOp { ack: Some(ack) })
    }

    // ── Direct engine access (dispatcher thread, or disabled) ────────

    fn refresh_event_count(&self, engine: &dyn EventManager) {
        let internal = self.internal_events.load(Ordering::Acquire);
        self.num_user_events
            .store(engine.num_events().saturating_sub(internal), Ordering::Release);
    }

    pub(crate) fn register_direct(
        &self,
        handle: SocketHandle,
        event: EventType,
        callback: SocketCallback,
    ) -> Result<(), Error> {
        let mut engine = self.lock_engine();
        let result = engine.register_socket_event(handle, event, callback);
        self.refresh_event_count(&**engine);
        result
    }

    pub(crate) fn deregister_event_direct(&self, handle: SocketHandle, event: EventType) -> bool {
        let mut engine = self.lock_engine();
        let removed = engine.deregister_socket_event(handle, event);
        self.refresh_event_count(&**engine);
        removed
    }

    pub(crate) fn deregister_socket_direct(&self, handle: SocketHandle) -> usize {
        let mut engine = self.lock_engine();
        let n = engine.deregister_socket(handle);
        self.refresh_event_count(&**engine);
        n
    }

    /// Drop every socket registration. While a control channel is live its
    /// registration is restored.
    pub(crate) fn deregister_all_direct(self: &Arc<Self>) {
        let mut engine = self.lock_engine();
        engine.deregister_all();
        self.internal_events.store(0, Ordering::Release);
        if let Some(channel) = self.current_channel() {
            self.register_control_channel(&mut **engine, &channel);
        }
        self.refresh_event_count(&**engine);
    }

    /// Register the channel's server end for `Read`. Aborts the process if the
    /// engine refuses: without it the dispatcher can never be woken.
    pub(crate) fn register_control_channel(
        self: &Arc<Self>,
        engine: &mut dyn EventManager,
        channel: &ControlChannel,
    ) {
        if let Err(e) = self.try_register_control_channel(engine, channel) {
            crate::dispatcher::fatal(&format!("cannot register control channel: {e}"));
        }
    }

    fn try_register_control_channel(
        self: &Arc<Self>,
        engine: &mut dyn EventManager,
        channel: &ControlChannel,
    ) -> Result<(), Error> {
        engine.register_socket_event(
            channel.server_fd(),
            EventType::Read,
            control_channel_callback(Arc::downgrade(self)),
        )?;
        self.internal_events.store(1, Ordering::Release);
        self.refresh_event_count(engine);
        Ok(())
    }

    /// Deregister and close the control channel.
    fn teardown_channel(&self) {
        let channel = self.replace_channel(None);
        let mut engine = self.lock_engine();
        if let Some(channel) = &channel {
            engine.deregister_socket(channel.server_fd());
        }
        self.internal_events.store(0, Ordering::Release);
        self.refresh_event_count(&**engine);
    }

    /// Stop the dispatcher and return to the disabled state. Caller holds
    /// the state lock exclusively.
    fn stop_dispatcher(&self, lifecycle: &mut Lifecycle) {
        let sent = match self.current_channel() {
            Some(channel) => self.submit(&channel, Request::Terminate, true),
            None => Err(Error::NotEnabled),
        };
        if let Err(e) = sent {
            // The dispatcher will notice the broken channel and see the flag.
            warn!(error = %e, "terminate request not delivered; using stop flag");
            self.terminate.store(true, Ordering::Release);
        }
        if let Some(handle) = lifecycle.dispatcher.take()
            && handle.join().is_err()
        {
            warn!("dispatcher thread panicked");
        }
        self.teardown_channel();
        lifecycle.state = State::Disabled;
        self.mark_disabled();
    }
}

fn control_channel_callback(shared: Weak<Shared>) -> SocketCallback {
    Box::new(move || {
        if let Some(shared) = shared.upgrade() {
            shared.on_control_channel_readable();
        }
    })
}

/// Socket-event and timer multiplexer with a single dispatcher thread.
///
/// All callbacks (socket events, timers, executed jobs) run on the dispatcher
/// thread, one at a time. Every method may be called from any thread,
/// including from inside a callback.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::{Duration, Instant};
/// use sockmux::{Config, TimerEventManager};
///
/// let manager = TimerEventManager::new(Config::default())?;
/// manager.enable()?;
/// manager.register_timer(Instant::now() + Duration::from_millis(50), || {
///     println!("fired");
/// })?;
/// manager.execute(|| println!("on the dispatcher"))?;
/// # Ok::<(), sockmux::Error>(())
/// ```
pub struct TimerEventManager {
    shared: Arc<Shared>,
}

impl TimerEventManager {
    /// Create a disabled manager with the engine selected by `config`.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let engine = poller::from_config(&config)?;
        Self::with_event_manager(config, engine)
    }

    /// Create a disabled manager driving a caller-supplied engine.
    pub fn with_event_manager(config: Config, engine: Box<dyn EventManager>) -> Result<Self, Error> {
        config.validate()?;
        let limited_capacity = engine.has_limited_socket_capacity();
        let num_user_events = engine.num_events();
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                lifecycle: RwLock::new(Lifecycle {
                    state: State::Disabled,
                    dispatcher: None,
                }),
                enabled: AtomicBool::new(false),
                dispatcher_thread: Mutex::new(None),
                engine: Mutex::new(engine),
                limited_capacity,
                timers: TimerQueue::new(),
                requests: RequestQueue::new(),
                channel: Mutex::new(None),
                execute_queue: Mutex::new(Vec::new()),
                num_user_events: AtomicUsize::new(num_user_events),
                internal_events: AtomicUsize::new(0),
                reinitializations: AtomicUsize::new(0),
                terminate: AtomicBool::new(false),
                time_metrics: TimeMetrics::new(TimeCategory::CpuBound),
            }),
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Open the control channel and start the dispatcher thread.
    ///
    /// Returns once the dispatcher has answered a barrier request. A no-op
    /// when already enabled or when called on the dispatcher thread.
    pub fn enable(&self) -> Result<(), Error> {
        let shared = &self.shared;
        if shared.is_dispatcher_thread() {
            return Ok(());
        }
        let mut lifecycle = shared.write_lifecycle();
        if lifecycle.state == State::Enabled {
            return Ok(());
        }

        let channel = Arc::new(ControlChannel::open(shared.config.channel_transport)?);
        shared.try_register_control_channel(&mut **shared.lock_engine(), &channel)?;
        shared.replace_channel(Some(Arc::clone(&channel)));
        shared.terminate.store(false, Ordering::Release);
        lifecycle.state = State::Enabled;
        shared.mark_enabled();

        let mut builder = thread::Builder::new().name(shared.config.dispatcher.name.clone());
        if let Some(size) = shared.config.dispatcher.stack_size {
            builder = builder.stack_size(size);
        }
        let runner = Arc::clone(shared);
        match builder.spawn(move || runner.run()) {
            Ok(handle) => lifecycle.dispatcher = Some(handle),
            Err(e) => {
                shared.teardown_channel();
                lifecycle.state = State::Disabled;
                shared.mark_disabled();
                return Err(e.into());
            }
        }

        if let Err(e) = shared.call(&channel, |ack| Request::NoOp { ack: Some(ack) }) {
            shared.stop_dispatcher(&mut lifecycle);
            return Err(e);
        }
        debug!(
            thread = %shared.config.dispatcher.name,
            backend = ?shared.config.resolved_backend(),
            "event manager enabled"
        );
        Ok(())
    }

    /// Stop the dispatcher thread after it applies every request queued so
    /// far, then close the control channel. Registrations and timers are kept.
    pub fn disable(&self) -> Result<(), Error> {
        let shared = &self.shared;
        if shared.is_dispatcher_thread() {
            return Err(Error::DispatcherThread);
        }
        let mut lifecycle = shared.write_lifecycle();
        if lifecycle.state == State::Disabled {
            return Ok(());
        }
        shared.stop_dispatcher(&mut lifecycle);
        debug!("event manager disabled");
        Ok(())
    }

    /// Whether a dispatcher thread is running.
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    // ── Socket events ────────────────────────────────────────────────

    /// Invoke `callback` on the dispatcher thread whenever `event` is ready on
    /// `handle`. Replaces an existing callback for the same pair.
    ///
    /// From a non-dispatcher thread while enabled the registration is applied
    /// asynchronously, before any request submitted after this call returns;
    /// an engine rejection at that point is logged.
    pub fn register_socket_event<F>(&self, handle: SocketHandle, event: EventType, callback: F) -> Result<(), Error>
    where
        F: FnMut() + Send + 'static,
    {
        if handle < 0 {
            return Err(Error::InvalidSocket(handle));
        }
        let callback: SocketCallback = Box::new(callback);
        match self.shared.route()? {
            Route::Dispatcher | Route::Disabled { .. } => {
                self.shared.register_direct(handle, event, callback)
            }
            Route::Enabled { channel, .. } => self.shared.submit(
                &channel,
                Request::RegisterSocketEvent {
                    handle,
                    event,
                    callback,
                },
                false,
            ),
        }
    }

    pub fn deregister_socket_event(&self, handle: SocketHandle, event: EventType) -> Result<(), Error> {
        match self.shared.route()? {
            Route::Dispatcher | Route::Disabled { .. } => {
                self.shared.deregister_event_direct(handle, event);
                Ok(())
            }
            Route::Enabled { channel, .. } => self.shared.submit(
                &channel,
                Request::DeregisterSocketEvent { handle, event },
                false,
            ),
        }
    }

    /// Remove every event registered on `handle`.
    pub fn deregister_socket(&self, handle: SocketHandle) -> Result<(), Error> {
        match self.shared.route()? {
            Route::Dispatcher | Route::Disabled { .. } => {
                self.shared.deregister_socket_direct(handle);
                Ok(())
            }
            Route::Enabled { channel, .. } => {
                self.shared
                    .submit(&channel, Request::DeregisterSocket { handle }, false)
            }
        }
    }

    pub fn deregister_all_socket_events(&self) -> Result<(), Error> {
        match self.shared.route()? {
            Route::Dispatcher | Route::Disabled { .. } => {
                self.shared.deregister_all_direct();
                Ok(())
            }
            Route::Enabled { channel, .. } => {
                self.shared
                    .submit(&channel, Request::DeregisterAllSocketEvents, false)
            }
        }
    }

    /// Whether `event` is registered on `handle`, observing every request
    /// submitted before this call.
    pub fn is_registered(&self, handle: SocketHandle, event: EventType) -> Result<bool, Error> {
        match self.shared.route()? {
            Route::Dispatcher | Route::Disabled { .. } => {
                Ok(self.shared.lock_engine().is_registered(handle, event))
            }
            Route::Enabled { channel, .. } => self.shared.call(&channel, |reply| {
                Request::IsRegistered {
                    handle,
                    event,
                    reply,
                }
            }),
        }
    }

    /// Number of events registered on `handle`.
    pub fn num_socket_events(&self, handle: SocketHandle) -> Result<usize, Error> {
        match self.shared.route()? {
            Route::Dispatcher | Route::Disabled { .. } => {
                Ok(self.shared.lock_engine().num_socket_events(handle))
            }
            Route::Enabled { channel, .. } => self
                .shared
                .call(&channel, |reply| Request::NumSocketEvents { handle, reply }),
        }
    }

    /// Registered (socket, event) pairs, excluding the internal control channel.
    pub fn num_events(&self) -> usize {
        self.shared.num_user_events.load(Ordering::Acquire)
    }

    pub fn has_limited_socket_capacity(&self) -> bool {
        self.shared.limited_capacity
    }

    /// Whether the engine can take another socket. Always `true` for engines
    /// without a capacity limit.
    pub fn can_register_sockets(&self) -> bool {
        if !self.shared.limited_capacity {
            return true;
        }
        match self.shared.route() {
            Ok(Route::Dispatcher | Route::Disabled { .. }) => {
                self.shared.lock_engine().can_register_sockets()
            }
            Ok(Route::Enabled { channel, .. }) => self
                .shared
                .call(&channel, |reply| Request::CanRegisterSockets { reply })
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    // ── Timers ───────────────────────────────────────────────────────

    /// Invoke `callback` once on the dispatcher thread at or after `deadline`.
    /// Timers with equal deadlines fire in registration order.
    pub fn register_timer<F>(&self, deadline: Instant, callback: F) -> Result<TimerHandle, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let (handle, earliest) = self.shared.timers.add(deadline, Box::new(callback));
        if earliest && let Err(e) = self.wake_for_new_deadline() {
            self.shared.timers.remove(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Move a pending timer to `deadline`.
    pub fn reschedule_timer(&self, handle: TimerHandle, deadline: Instant) -> Result<(), Error> {
        if self.shared.timers.update(handle, deadline)? {
            self.wake_for_new_deadline()?;
        }
        Ok(())
    }

    /// Cancel a pending timer. Returns `false` if it already fired or was removed.
    pub fn deregister_timer(&self, handle: TimerHandle) -> bool {
        self.shared.timers.remove(handle)
    }

    /// Cancel every pending timer. Returns how many were cancelled.
    pub fn deregister_all_timers(&self) -> usize {
        self.shared.timers.remove_all()
    }

    pub fn num_timers(&self) -> usize {
        self.shared.timers.len()
    }

    /// Let the dispatcher recompute its poll timeout.
    fn wake_for_new_deadline(&self) -> Result<(), Error> {
        if self.shared.is_dispatcher_thread() || !self.is_enabled() {
            return Ok(());
        }
        match self.shared.route()? {
            Route::Enabled { channel, .. } => {
                self.shared
                    .submit(&channel, Request::NoOp { ack: None }, false)
            }
            Route::Dispatcher | Route::Disabled { .. } => Ok(()),
        }
    }

    /// Remove every socket registration and every timer.
    pub fn deregister_all(&self) -> Result<(), Error> {
        self.deregister_all_socket_events()?;
        self.deregister_all_timers();
        Ok(())
    }

    // ── Execute queue ────────────────────────────────────────────────

    /// Run `job` on the dispatcher thread.
    ///
    /// Jobs run in submission order. A job submitted from another job runs in
    /// the next dispatcher iteration. While disabled, jobs wait for `enable`.
    pub fn execute<F>(&self, job: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        match self.shared.route()? {
            Route::Dispatcher | Route::Disabled { .. } => {
                lock(&self.shared.execute_queue).push(job);
                Ok(())
            }
            Route::Enabled { channel, .. } => {
                self.shared.submit(&channel, Request::Execute(job), false)
            }
        }
    }

    /// Discard jobs waiting in the execute queue.
    pub fn clear_execute_queue(&self) {
        let jobs = std::mem::take(&mut *lock(&self.shared.execute_queue));
        drop(jobs);
    }

    // ── Introspection ────────────────────────────────────────────────

    /// Id of the running dispatcher thread.
    pub fn dispatcher_thread(&self) -> Option<ThreadId> {
        *lock(&self.shared.dispatcher_thread)
    }

    /// Whether the calling thread is this manager's dispatcher.
    pub fn is_dispatcher_thread(&self) -> bool {
        self.shared.is_dispatcher_thread()
    }

    /// Dispatcher CPU-bound vs I/O-bound time split. Only updated when
    /// `collect_time_metrics` is set.
    pub fn time_metrics(&self) -> &TimeMetrics {
        &self.shared.time_metrics
    }

    /// Control channel rebuilds performed so far.
    pub fn num_control_channel_reinitializations(&self) -> usize {
        self.shared.reinitializations.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Break the control channel's receiving end. The dispatcher rebuilds the
    /// channel on its next wake-up. Returns `false` when disabled.
    #[doc(hidden)]
    pub fn sever_control_channel(&self) -> bool {
        match self.shared.current_channel() {
            Some(channel) => {
                channel.sever();
                true
            }
            None => false,
        }
    }

    /// (wake reads, bytes read) on the current control channel.
    #[doc(hidden)]
    pub fn control_channel_read_stats(&self) -> Option<(u64, u64)> {
        self.shared.current_channel().map(|c| c.read_stats())
    }
}

impl Drop for TimerEventManager {
    fn drop(&mut self) {
        if self.shared.is_dispatcher_thread() {
            // Cannot join ourselves: the loop ends after this iteration.
            self.shared.terminate.store(true, Ordering::Release);
            self.shared.mark_disabled();
            return;
        }
        if let Err(e) = self.disable() {
            warn!(error = %e, "disable on drop failed");
        }
    }
}
