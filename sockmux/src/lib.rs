//! sockmux: socket-event and timer multiplexing on one dispatcher thread.
//!
//! A [`TimerEventManager`] owns a poll engine, a timer queue, and an execute
//! queue, all serviced by a single dispatcher thread. Any thread may register
//! socket events or timers at any time: calls made on the dispatcher thread
//! act directly, calls from other threads are marshaled to the dispatcher
//! through a control channel (a connected socket pair whose server end is
//! registered with the engine). A control channel that breaks is rebuilt up
//! to [`MAX_CHANNEL_REINITIALIZATIONS`] times.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::net::TcpListener;
//! use std::os::fd::AsRawFd;
//! use std::sync::Arc;
//! use std::time::{Duration, Instant};
//!
//! use sockmux::{ConfigBuilder, EventType, Hint, TimerEventManager};
//!
//! fn main() -> Result<(), sockmux::Error> {
//!     let config = ConfigBuilder::new()
//!         .hint(Hint::InfrequentRegistration)
//!         .build()?;
//!     let manager = Arc::new(TimerEventManager::new(config)?);
//!     manager.enable()?;
//!
//!     let listener = TcpListener::bind("127.0.0.1:0")?;
//!     listener.set_nonblocking(true)?;
//!     let fd = listener.as_raw_fd();
//!     manager.register_socket_event(fd, EventType::Accept, move || {
//!         while let Ok((stream, peer)) = listener.accept() {
//!             println!("accepted {peer}");
//!             drop(stream);
//!         }
//!     })?;
//!
//!     let m = Arc::clone(&manager);
//!     manager.register_timer(Instant::now() + Duration::from_secs(5), move || {
//!         let _ = m.deregister_socket(fd);
//!     })?;
//!     std::thread::sleep(Duration::from_secs(6));
//!     manager.disable()
//! }
//! ```
//!
//! # Platform
//!
//! Unix. The epoll backend is Linux-only; the io_uring backend needs the
//! `uring` feature and Linux 5.11+.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod channel;
pub(crate) mod dispatcher;
pub(crate) mod manager;
pub(crate) mod metrics;
pub(crate) mod request;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod error;
pub mod event;
pub mod poller;
pub mod time_metrics;
pub mod timer;

// ── Re-exports ──────────────────────────────────────────────────────────

/// Validated configuration and its builder.
pub use config::{Backend, ChannelTransport, Config, ConfigBuilder, DispatcherConfig, Hint};
/// Errors returned by every fallible operation.
pub use error::Error;
/// Socket event model.
pub use event::{EventType, Job, SocketCallback, SocketHandle};
/// The facade and its reinitialization bound.
pub use manager::{MAX_CHANNEL_REINITIALIZATIONS, TimerEventManager};
/// Poll engine interface, for custom engines.
pub use poller::{EventManager, ReadyEvent};
/// Dispatcher CPU/I-O time split.
pub use time_metrics::{TimeCategory, TimeMetrics};
/// Opaque timer handle.
pub use timer::TimerHandle;
