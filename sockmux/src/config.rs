use crate::error::Error;

/// Registration-pattern hint used to pick a poll backend when none is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hint {
    /// No particular pattern; sockets come and go frequently.
    #[default]
    NoHint,
    /// Sockets are long-lived; a kernel-side interest set pays off.
    InfrequentRegistration,
}

/// Poll engine implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// poll(2). Rebuilds its descriptor array only when registrations change.
    Poll,
    /// Level-triggered epoll(7).
    #[cfg(target_os = "linux")]
    Epoll,
    /// io_uring `POLL_ADD`, re-armed after each completion.
    #[cfg(feature = "uring")]
    Uring,
}

/// Socket pair used to wake the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelTransport {
    /// Connected TCP pair on 127.0.0.1 with `TCP_NODELAY`.
    #[default]
    Loopback,
    /// `AF_UNIX` stream socketpair.
    UnixPair,
}

/// Attributes of the dispatcher thread spawned by `enable()`.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Thread name.
    pub name: String,
    /// Stack size in bytes. `None` uses the platform default.
    pub stack_size: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "sockmux-dispatch".to_string(),
            stack_size: None,
        }
    }
}

/// Minimum accepted dispatcher stack size.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// Configuration for a [`TimerEventManager`](crate::TimerEventManager).
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend selection hint. Ignored when `backend` is set.
    pub hint: Hint,
    /// Explicit poll backend.
    pub backend: Option<Backend>,
    /// Track the dispatcher's CPU-bound vs I/O-bound time split.
    pub collect_time_metrics: bool,
    /// Control channel transport.
    pub channel_transport: ChannelTransport,
    /// Dispatcher thread attributes.
    pub dispatcher: DispatcherConfig,
    /// Ready events harvested per poll call (epoll/io_uring event buffer).
    pub events_capacity: usize,
    /// Cap on distinct sockets for the poll(2) backend. `None` = unlimited.
    pub max_sockets: Option<usize>,
    /// Submission queue size for the io_uring backend. Must be a power of two.
    pub uring_entries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hint: Hint::NoHint,
            backend: None,
            collect_time_metrics: true,
            channel_transport: ChannelTransport::Loopback,
            dispatcher: DispatcherConfig::default(),
            events_capacity: 256,
            max_sockets: None,
            uring_entries: 256,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.events_capacity == 0 {
            return Err(Error::InvalidConfig("events_capacity must be > 0".into()));
        }
        if self.events_capacity > i32::MAX as usize {
            return Err(Error::InvalidConfig(
                "events_capacity must fit in an i32".into(),
            ));
        }
        if self.max_sockets == Some(0) {
            return Err(Error::InvalidConfig("max_sockets must be > 0".into()));
        }
        if self.dispatcher.name.is_empty() || self.dispatcher.name.contains('\0') {
            return Err(Error::InvalidConfig(
                "dispatcher name must be non-empty and free of NUL bytes".into(),
            ));
        }
        if let Some(size) = self.dispatcher.stack_size
            && size < MIN_STACK_SIZE
        {
            return Err(Error::InvalidConfig(format!(
                "dispatcher stack_size must be >= {MIN_STACK_SIZE}"
            )));
        }
        if self.uring_entries == 0 || !self.uring_entries.is_power_of_two() {
            return Err(Error::InvalidConfig(
                "uring_entries must be > 0 and a power of two".into(),
            ));
        }
        Ok(())
    }

    /// The backend this configuration resolves to.
    pub fn resolved_backend(&self) -> Backend {
        if let Some(backend) = self.backend {
            return backend;
        }
        match self.hint {
            Hint::NoHint => Backend::Poll,
            #[cfg(target_os = "linux")]
            Hint::InfrequentRegistration => Backend::Epoll,
            #[cfg(not(target_os = "linux"))]
            Hint::InfrequentRegistration => Backend::Poll,
        }
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use sockmux::{ConfigBuilder, Hint};
///
/// let config = ConfigBuilder::new()
///     .hint(Hint::InfrequentRegistration)
///     .thread_name("io-dispatch")
///     .stack_size(256 * 1024)
///     .collect_time_metrics(true)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Backend settings ─────────────────────────────────────────────

    /// Set the registration-pattern hint.
    pub fn hint(mut self, hint: Hint) -> Self {
        self.config.hint = hint;
        self
    }

    /// Force a specific poll backend.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = Some(backend);
        self
    }

    /// Set the number of ready events harvested per poll call.
    pub fn events_capacity(mut self, n: usize) -> Self {
        self.config.events_capacity = n;
        self
    }

    /// Cap the number of distinct sockets (poll backend only).
    pub fn max_sockets(mut self, n: usize) -> Self {
        self.config.max_sockets = Some(n);
        self
    }

    /// Set the io_uring submission queue size.
    pub fn uring_entries(mut self, n: u32) -> Self {
        self.config.uring_entries = n;
        self
    }

    // ── Dispatcher settings ──────────────────────────────────────────

    /// Set the dispatcher thread name.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.dispatcher.name = name.into();
        self
    }

    /// Set the dispatcher thread stack size in bytes.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.dispatcher.stack_size = Some(bytes);
        self
    }

    /// Enable or disable CPU/I-O time accounting.
    pub fn collect_time_metrics(mut self, enable: bool) -> Self {
        self.config.collect_time_metrics = enable;
        self
    }

    // ── Control channel ──────────────────────────────────────────────

    /// Set the control channel transport.
    pub fn channel_transport(mut self, transport: ChannelTransport) -> Self {
        self.config.channel_transport = transport;
        self
    }

    /// Validate and return the config.
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_events_capacity() {
        let err = ConfigBuilder::new().events_capacity(0).build().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn rejects_small_stack() {
        let err = ConfigBuilder::new().stack_size(4096).build().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn rejects_bad_thread_name() {
        assert!(ConfigBuilder::new().thread_name("").build().is_err());
        assert!(ConfigBuilder::new().thread_name("a\0b").build().is_err());
    }

    #[test]
    fn rejects_non_power_of_two_uring_entries() {
        assert!(ConfigBuilder::new().uring_entries(100).build().is_err());
    }

    #[test]
    fn hint_selects_backend() {
        assert_eq!(Config::default().resolved_backend(), Backend::Poll);
        let config = ConfigBuilder::new()
            .hint(Hint::InfrequentRegistration)
            .build()
            .unwrap();
        #[cfg(target_os = "linux")]
        assert_eq!(config.resolved_backend(), Backend::Epoll);
        #[cfg(not(target_os = "linux"))]
        assert_eq!(config.resolved_backend(), Backend::Poll);
    }

    #[test]
    fn explicit_backend_wins_over_hint() {
        let config = ConfigBuilder::new()
            .hint(Hint::InfrequentRegistration)
            .backend(Backend::Poll)
            .build()
            .unwrap();
        assert_eq!(config.resolved_backend(), Backend::Poll);
    }
}
