//! Echo server that closes connections idle for too long.
//!
//! Every connection gets a read callback and an idle timer. Each read pushes
//! the timer out; when it fires, the connection is deregistered and closed.
//!
//! Usage:
//!   RUST_LOG=debug cargo run --example idle_echo [BIND_ADDR] [IDLE_SECS]
//!   # defaults: 127.0.0.1:7878, 10

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sockmux::{ConfigBuilder, EventType, Hint, TimerEventManager, TimerHandle};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct Conn {
    stream: TcpStream,
    idle: TimerHandle,
}

type Conns = Arc<Mutex<HashMap<RawFd, Conn>>>;

fn close(manager: &TimerEventManager, conns: &Conns, fd: RawFd, reason: &str) {
    let _ = manager.deregister_socket(fd);
    if let Some(conn) = conns.lock().unwrap().remove(&fd) {
        manager.deregister_timer(conn.idle);
        info!(fd, reason, "connection closed");
    }
}

fn on_readable(manager: &Arc<TimerEventManager>, conns: &Conns, fd: RawFd, idle: Duration) {
    let mut buf = [0u8; 4096];
    loop {
        let mut guard = conns.lock().unwrap();
        let Some(conn) = guard.get_mut(&fd) else {
            return;
        };
        match conn.stream.read(&mut buf) {
            Ok(0) => {
                drop(guard);
                close(manager, conns, fd, "peer closed");
                return;
            }
            Ok(n) => {
                if let Err(e) = conn.stream.write_all(&buf[..n]) {
                    warn!(fd, error = %e, "write failed");
                    drop(guard);
                    close(manager, conns, fd, "write error");
                    return;
                }
                let _ = manager.reschedule_timer(conn.idle, Instant::now() + idle);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(fd, error = %e, "read failed");
                drop(guard);
                close(manager, conns, fd, "read error");
                return;
            }
        }
    }
}

fn on_accept(manager: &Arc<TimerEventManager>, listener: &TcpListener, conns: &Conns, idle: Duration) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(%peer, error = %e, "cannot set nonblocking");
            continue;
        }
        let fd = stream.as_raw_fd();

        let timer = {
            let (m, c) = (Arc::clone(manager), Arc::clone(conns));
            manager.register_timer(Instant::now() + idle, move || close(&m, &c, fd, "idle"))
        };
        let idle_handle = match timer {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%peer, error = %e, "cannot arm idle timer");
                continue;
            }
        };
        conns
            .lock()
            .unwrap()
            .insert(fd, Conn { stream, idle: idle_handle });

        let (m, c) = (Arc::clone(manager), Arc::clone(conns));
        let registered =
            manager.register_socket_event(fd, EventType::Read, move || on_readable(&m, &c, fd, idle));
        match registered {
            Ok(()) => info!(%peer, fd, "connection accepted"),
            Err(e) => {
                warn!(%peer, error = %e, "cannot register connection");
                close(manager, conns, fd, "registration failed");
            }
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let bind_addr = args.next().unwrap_or_else(|| "127.0.0.1:7878".to_string());
    let idle = Duration::from_secs(args.next().map(|s| s.parse()).transpose()?.unwrap_or(10));

    let config = ConfigBuilder::new()
        .hint(Hint::InfrequentRegistration)
        .thread_name("idle-echo")
        .build()?;
    let manager = Arc::new(TimerEventManager::new(config)?);
    manager.enable()?;

    let listener = TcpListener::bind(&bind_addr)?;
    listener.set_nonblocking(true)?;
    let conns: Conns = Arc::default();
    let fd = listener.as_raw_fd();
    let m = Arc::clone(&manager);
    manager.register_socket_event(fd, EventType::Accept, move || {
        on_accept(&m, &listener, &conns, idle)
    })?;

    info!(%bind_addr, idle_secs = idle.as_secs(), "idle echo server listening");
    loop {
        std::thread::sleep(Duration::from_secs(60));
        let metrics = manager.time_metrics();
        info!(
            timers = manager.num_timers(),
            events = manager.num_events(),
            io_pct = metrics.percentage(sockmux::TimeCategory::IoBound),
            "status"
        );
    }
}
