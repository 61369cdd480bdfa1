//! sockmux runtime metrics.
//!
//! Process-wide counters for request marshaling, control channel traffic,
//! and dispatched callbacks. Exposed through metriken's registry.

use metriken::{Counter, Gauge, metric};

// ── Lifecycle ────────────────────────────────────────────────────

#[metric(
    name = "sockmux/managers/enabled",
    description = "Event managers with a running dispatcher thread"
)]
pub static MANAGERS_ENABLED: Gauge = Gauge::new();

// ── Requests ─────────────────────────────────────────────────────

#[metric(
    name = "sockmux/requests/applied",
    description = "Requests applied by a dispatcher thread"
)]
pub static REQUESTS_APPLIED: Counter = Counter::new();

#[metric(
    name = "sockmux/requests/withdrawn",
    description = "Requests withdrawn after a failed control channel write"
)]
pub static REQUESTS_WITHDRAWN: Counter = Counter::new();

// ── Control channel ──────────────────────────────────────────────

#[metric(
    name = "sockmux/channel/wakes",
    description = "Wake-up bytes written to a control channel"
)]
pub static CHANNEL_WAKES: Counter = Counter::new();

#[metric(
    name = "sockmux/channel/coalesced",
    description = "Client writes skipped because a wake was already pending"
)]
pub static CHANNEL_COALESCED: Counter = Counter::new();

#[metric(
    name = "sockmux/channel/server_reads",
    description = "Wake-up reads performed by dispatcher threads"
)]
pub static CHANNEL_SERVER_READS: Counter = Counter::new();

#[metric(
    name = "sockmux/channel/reinitializations",
    description = "Control channels rebuilt after a failure"
)]
pub static CHANNEL_REINITIALIZATIONS: Counter = Counter::new();

// ── Callbacks ────────────────────────────────────────────────────

#[metric(
    name = "sockmux/callbacks/socket",
    description = "Socket event callbacks invoked"
)]
pub static SOCKET_CALLBACKS: Counter = Counter::new();

#[metric(
    name = "sockmux/callbacks/timer",
    description = "Timer callbacks invoked"
)]
pub static TIMER_CALLBACKS: Counter = Counter::new();

#[metric(
    name = "sockmux/callbacks/execute",
    description = "Execute-queue jobs invoked"
)]
pub static EXECUTED_JOBS: Counter = Counter::new();
