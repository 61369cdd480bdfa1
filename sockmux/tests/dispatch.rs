//! Integration tests: socket events, timers, and the execute queue driven by a
//! live dispatcher thread over real sockets.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, bounded, unbounded};
use proptest::prelude::*;
use sockmux::{
    Backend, ChannelTransport, Config, ConfigBuilder, Error, EventType, TimeCategory,
    TimerEventManager,
};

const WAIT: Duration = Duration::from_secs(5);

// ── Helpers ─────────────────────────────────────────────────────────

fn backends() -> Vec<Backend> {
    let mut backends = vec![Backend::Poll];
    #[cfg(target_os = "linux")]
    backends.push(Backend::Epoll);
    #[cfg(feature = "uring")]
    backends.push(Backend::Uring);
    backends
}

/// Enabled manager on `backend`, or `None` when the backend is unavailable here.
fn enabled_with(backend: Backend) -> Option<Arc<TimerEventManager>> {
    let config = ConfigBuilder::new().backend(backend).build().unwrap();
    let manager = TimerEventManager::new(config).ok()?;
    manager.enable().unwrap();
    Some(Arc::new(manager))
}

fn enabled() -> Arc<TimerEventManager> {
    let manager = TimerEventManager::new(Config::default()).unwrap();
    manager.enable().unwrap();
    Arc::new(manager)
}

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached within {WAIT:?}");
}

fn collect<T>(rx: &Receiver<T>, n: usize) -> Vec<T> {
    (0..n).map(|_| rx.recv_timeout(WAIT).unwrap()).collect()
}

// ── Socket events ───────────────────────────────────────────────────

#[test]
fn read_callback_receives_data_on_every_backend() {
    for backend in backends() {
        let Some(manager) = enabled_with(backend) else {
            continue;
        };
        let (mut client, mut server) = tcp_pair();
        server.set_nonblocking(true).unwrap();
        let fd = server.as_raw_fd();
        let (tx, rx) = unbounded();
        manager
            .register_socket_event(fd, EventType::Read, move || {
                let mut buf = [0u8; 64];
                loop {
                    match server.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let _ = tx.send(buf[..n].to_vec());
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => panic!("read error: {e}"),
                    }
                }
            })
            .unwrap();

        client.write_all(b"hello").unwrap();
        let mut got = Vec::new();
        while got.len() < 5 {
            got.extend(rx.recv_timeout(WAIT).unwrap());
        }
        assert_eq!(got, b"hello", "backend {backend:?}");
        manager.deregister_socket(fd).unwrap();
    }
}

#[test]
fn accept_callback_accepts_connections() {
    let manager = enabled();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let fd = listener.as_raw_fd();
    let accepted = Arc::new(AtomicUsize::new(0));
    let count = accepted.clone();
    manager
        .register_socket_event(fd, EventType::Accept, move || {
            while let Ok((stream, _)) = listener.accept() {
                drop(stream);
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    let _a = TcpStream::connect(addr).unwrap();
    let _b = TcpStream::connect(addr).unwrap();
    wait_until(|| accepted.load(Ordering::SeqCst) == 2);
}

#[test]
fn callback_can_deregister_itself() {
    let manager = enabled();
    let (mut a, mut b) = UnixStream::pair().unwrap();
    b.set_nonblocking(true).unwrap();
    let fd = b.as_raw_fd();
    let calls = Arc::new(AtomicUsize::new(0));
    let (m, c) = (manager.clone(), calls.clone());
    manager
        .register_socket_event(fd, EventType::Read, move || {
            let mut buf = [0u8; 16];
            let _ = b.read(&mut buf);
            c.fetch_add(1, Ordering::SeqCst);
            assert!(m.is_dispatcher_thread());
            m.deregister_socket_event(fd, EventType::Read).unwrap();
            assert!(!m.is_registered(fd, EventType::Read).unwrap());
        })
        .unwrap();

    a.write_all(b"1").unwrap();
    wait_until(|| calls.load(Ordering::SeqCst) == 1);
    assert!(!manager.is_registered(fd, EventType::Read).unwrap());
    a.write_all(b"2").unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.num_events(), 0);
}

#[test]
fn registration_is_visible_to_another_thread() {
    let manager = enabled();
    let (a, _b) = UnixStream::pair().unwrap();
    let fd = a.as_raw_fd();
    let (done_tx, done_rx) = bounded::<bool>(0);

    let querier = {
        let manager = manager.clone();
        thread::spawn(move || {
            while let Ok(expected) = done_rx.recv() {
                assert_eq!(manager.is_registered(fd, EventType::Read).unwrap(), expected);
            }
        })
    };
    for _ in 0..50 {
        manager
            .register_socket_event(fd, EventType::Read, || {})
            .unwrap();
        done_tx.send(true).unwrap();
        manager.deregister_socket_event(fd, EventType::Read).unwrap();
        done_tx.send(false).unwrap();
    }
    drop(done_tx);
    querier.join().unwrap();
}

#[derive(Debug, Clone, Copy)]
struct Op {
    socket: usize,
    event: EventType,
    register: bool,
}

fn op() -> impl Strategy<Value = Op> {
    (0usize..4, any::<bool>(), any::<bool>()).prop_map(|(socket, write, register)| Op {
        socket,
        event: if write { EventType::Write } else { EventType::Read },
        register,
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    // Calls from several threads interleave; the order in which they
    // returned is recorded under a lock and replayed against a set.
    #[test]
    fn concurrent_registrations_match_serial_order(
        per_thread in proptest::collection::vec(proptest::collection::vec(op(), 0..24), 4),
    ) {
        let manager = enabled();
        let pairs: Vec<_> = (0..4).map(|_| UnixStream::pair().unwrap()).collect();
        let fds: Vec<_> = pairs.iter().map(|(a, _)| a.as_raw_fd()).collect();
        let log = Arc::new(Mutex::new(Vec::new()));

        let workers: Vec<_> = per_thread
            .into_iter()
            .map(|ops| {
                let (manager, log, fds) = (manager.clone(), log.clone(), fds.clone());
                thread::spawn(move || {
                    for op in ops {
                        let mut log = log.lock().unwrap();
                        let fd = fds[op.socket];
                        if op.register {
                            manager.register_socket_event(fd, op.event, || {}).unwrap();
                        } else {
                            manager.deregister_socket_event(fd, op.event).unwrap();
                        }
                        log.push(op);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let mut model = BTreeSet::new();
        for op in log.lock().unwrap().iter() {
            let key = (op.socket, op.event);
            if op.register {
                model.insert(key);
            } else {
                model.remove(&key);
            }
        }
        for (socket, &fd) in fds.iter().enumerate() {
            for event in [EventType::Read, EventType::Write] {
                prop_assert_eq!(
                    manager.is_registered(fd, event).unwrap(),
                    model.contains(&(socket, event))
                );
            }
        }
        prop_assert_eq!(manager.num_events(), model.len());
        manager.disable().unwrap();
    }
}

#[test]
fn registration_is_visible_to_the_next_query() {
    let manager = enabled();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            thread::spawn(move || {
                let (a, _b) = UnixStream::pair().unwrap();
                let fd = a.as_raw_fd();
                for _ in 0..20 {
                    manager
                        .register_socket_event(fd, EventType::Read, || {})
                        .unwrap();
                    assert!(manager.is_registered(fd, EventType::Read).unwrap());
                    assert_eq!(manager.num_socket_events(fd).unwrap(), 1);
                    manager.deregister_socket(fd).unwrap();
                    assert!(!manager.is_registered(fd, EventType::Read).unwrap());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(manager.num_events(), 0);
}

#[test]
fn num_events_excludes_control_channel() {
    let manager = enabled();
    assert_eq!(manager.num_events(), 0);
    let (a, b) = UnixStream::pair().unwrap();
    manager
        .register_socket_event(a.as_raw_fd(), EventType::Read, || {})
        .unwrap();
    manager
        .register_socket_event(b.as_raw_fd(), EventType::Write, || {})
        .unwrap();
    // Barrier: both registrations applied.
    assert!(manager.is_registered(b.as_raw_fd(), EventType::Write).unwrap());
    assert_eq!(manager.num_events(), 2);

    manager.disable().unwrap();
    assert_eq!(manager.num_events(), 2);
    manager.enable().unwrap();
    assert_eq!(manager.num_events(), 2);

    manager.deregister_all_socket_events().unwrap();
    assert!(!manager.is_registered(a.as_raw_fd(), EventType::Read).unwrap());
    assert_eq!(manager.num_events(), 0);

    // The dispatcher is still reachable after everything was deregistered.
    let (tx, rx) = unbounded();
    manager.execute(move || tx.send(()).unwrap()).unwrap();
    rx.recv_timeout(WAIT).unwrap();
}

#[test]
fn conflicting_event_is_rejected_on_dispatcher() {
    let manager = enabled();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let fd = listener.as_raw_fd();
    manager
        .register_socket_event(fd, EventType::Accept, || {})
        .unwrap();
    // Marshaled: the dispatcher rejects and logs it.
    manager
        .register_socket_event(fd, EventType::Read, || {})
        .unwrap();
    assert!(!manager.is_registered(fd, EventType::Read).unwrap());
    assert_eq!(manager.num_socket_events(fd).unwrap(), 1);

    let (tx, rx) = unbounded();
    let m = manager.clone();
    manager
        .execute(move || {
            let direct = m.register_socket_event(fd, EventType::Write, || {});
            let _ = tx.send(matches!(direct, Err(Error::IncompatibleEvent { .. })));
        })
        .unwrap();
    assert!(rx.recv_timeout(WAIT).unwrap());
}

// ── Timers ──────────────────────────────────────────────────────────

#[test]
fn timers_fire_in_deadline_order() {
    let manager = enabled();
    let (tx, rx) = unbounded();
    let t0 = Instant::now();
    for ms in [50u64, 10, 30] {
        let tx = tx.clone();
        manager
            .register_timer(t0 + Duration::from_millis(ms), move || {
                let _ = tx.send(ms);
            })
            .unwrap();
    }
    assert_eq!(manager.num_timers(), 3);
    assert_eq!(collect(&rx, 3), vec![10, 30, 50]);
    assert!(t0.elapsed() >= Duration::from_millis(50));
    assert_eq!(manager.num_timers(), 0);
}

#[test]
fn timer_registered_while_idle_wakes_dispatcher() {
    let manager = enabled();
    // Let the dispatcher settle into an unbounded wait.
    thread::sleep(Duration::from_millis(30));
    let (tx, rx) = unbounded();
    let start = Instant::now();
    manager
        .register_timer(start + Duration::from_millis(20), move || {
            let _ = tx.send(Instant::now());
        })
        .unwrap();
    let fired = rx.recv_timeout(WAIT).unwrap();
    assert!(fired >= start + Duration::from_millis(20));
}

#[test]
fn reschedule_and_cancel() {
    let manager = enabled();
    let (tx, rx) = unbounded();
    let far = Instant::now() + Duration::from_secs(3600);
    let tx1 = tx.clone();
    let moved = manager
        .register_timer(far, move || {
            let _ = tx1.send("moved");
        })
        .unwrap();
    let cancelled = manager
        .register_timer(far, move || {
            let _ = tx.send("cancelled");
        })
        .unwrap();

    assert!(manager.deregister_timer(cancelled));
    assert!(!manager.deregister_timer(cancelled));
    manager
        .reschedule_timer(moved, Instant::now() + Duration::from_millis(10))
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "moved");
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(matches!(
        manager.reschedule_timer(moved, far),
        Err(Error::UnknownTimer)
    ));
}

#[test]
fn timer_callback_can_schedule_another() {
    let manager = enabled();
    let (tx, rx) = unbounded();
    let m = manager.clone();
    manager
        .register_timer(Instant::now(), move || {
            let tx = tx.clone();
            m.register_timer(Instant::now() + Duration::from_millis(5), move || {
                let _ = tx.send("second");
            })
            .unwrap();
        })
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "second");
}

#[test]
fn deregister_all_clears_timers_and_sockets() {
    let manager = enabled();
    let (a, _b) = UnixStream::pair().unwrap();
    manager
        .register_socket_event(a.as_raw_fd(), EventType::Read, || {})
        .unwrap();
    manager
        .register_timer(Instant::now() + Duration::from_secs(60), || {})
        .unwrap();
    manager.deregister_all().unwrap();
    assert_eq!(manager.num_timers(), 0);
    assert_eq!(manager.num_socket_events(a.as_raw_fd()).unwrap(), 0);
}

// ── Execute queue ───────────────────────────────────────────────────

#[test]
fn execute_preserves_submission_order() {
    let manager = enabled();
    let (tx, rx) = unbounded();
    for i in 0..200 {
        let tx = tx.clone();
        manager
            .execute(move || {
                let _ = tx.send(i);
            })
            .unwrap();
    }
    assert_eq!(collect(&rx, 200), (0..200).collect::<Vec<_>>());
}

#[test]
fn nested_execute_runs_in_a_later_batch() {
    let manager = enabled();
    let log = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = unbounded();

    let (m, l) = (manager.clone(), log.clone());
    manager
        .execute(move || {
            l.lock().unwrap().push("outer");
            let (m2, l2) = (m.clone(), l.clone());
            m.execute(move || {
                l2.lock().unwrap().push("a");
                let l3 = l2.clone();
                m2.execute(move || {
                    l3.lock().unwrap().push("c");
                    let _ = done_tx.send(());
                })
                .unwrap();
            })
            .unwrap();
            let l4 = l.clone();
            m.execute(move || l4.lock().unwrap().push("b")).unwrap();
            // Nothing queued from here runs inside this batch.
            assert_eq!(l.lock().unwrap().len(), 1);
        })
        .unwrap();

    done_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["outer", "a", "b", "c"]);
}

#[test]
fn execute_is_ordered_after_earlier_registration() {
    let manager = enabled();
    let (a, _b) = UnixStream::pair().unwrap();
    let fd = a.as_raw_fd();
    manager
        .register_socket_event(fd, EventType::Read, || {})
        .unwrap();
    let (tx, rx) = unbounded();
    let m = manager.clone();
    manager
        .execute(move || {
            let _ = tx.send(m.is_registered(fd, EventType::Read).unwrap());
        })
        .unwrap();
    assert!(rx.recv_timeout(WAIT).unwrap());
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[test]
fn enable_disable_round_trip() {
    let config = ConfigBuilder::new()
        .thread_name("dispatch-test")
        .stack_size(256 * 1024)
        .build()
        .unwrap();
    let manager = Arc::new(TimerEventManager::new(config).unwrap());
    for _ in 0..3 {
        manager.enable().unwrap();
        let (tx, rx) = unbounded();
        manager
            .execute(move || {
                let _ = tx.send(thread::current().name().map(str::to_owned));
            })
            .unwrap();
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap().as_deref(),
            Some("dispatch-test")
        );
        assert!(manager.dispatcher_thread().is_some());
        manager.disable().unwrap();
        assert!(!manager.is_enabled());
        assert!(manager.dispatcher_thread().is_none());
    }
}

#[test]
fn disable_applies_pending_requests_first() {
    let manager = enabled();
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let ran = ran.clone();
        manager
            .execute(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    manager.disable().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 50);
}

#[test]
fn lifecycle_calls_from_the_dispatcher() {
    let manager = enabled();
    let (tx, rx) = unbounded();
    let m = manager.clone();
    manager
        .execute(move || {
            let disabled = m.disable();
            let enabled = m.enable();
            let _ = tx.send((
                matches!(disabled, Err(Error::DispatcherThread)),
                enabled.is_ok(),
                m.is_enabled(),
            ));
        })
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (true, true, true));
}

#[test]
fn last_handle_dropped_on_dispatcher() {
    let manager = enabled();
    let (go_tx, go_rx) = crossbeam_channel::bounded::<()>(0);
    let (done_tx, done_rx) = unbounded();
    let inner = manager.clone();
    manager
        .execute(move || {
            let _ = go_rx.recv();
            // Last handle: dropping it here must not try to join this thread.
            drop(inner);
            let _ = done_tx.send(());
        })
        .unwrap();
    drop(manager);
    go_tx.send(()).unwrap();
    done_rx.recv_timeout(WAIT).unwrap();
}

#[test]
fn unix_pair_transport() {
    let config = ConfigBuilder::new()
        .channel_transport(ChannelTransport::UnixPair)
        .build()
        .unwrap();
    let manager = TimerEventManager::new(config).unwrap();
    manager.enable().unwrap();
    let (tx, rx) = unbounded();
    manager.execute(move || tx.send(7).unwrap()).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 7);
}

#[test]
fn time_metrics_split_dispatcher_time() {
    let manager = enabled();
    manager.time_metrics().reset_all();
    thread::sleep(Duration::from_millis(50));
    let io = manager.time_metrics().percentage(TimeCategory::IoBound);
    let cpu = manager.time_metrics().percentage(TimeCategory::CpuBound);
    assert!(io > 0, "idle dispatcher should be waiting in poll");
    assert!((98..=100).contains(&(io + cpu)), "io={io} cpu={cpu}");
}
