//! Control channel: a connected socket pair used to wake the dispatcher.
//!
//! Producers write to the client end; the dispatcher registers the server end
//! for `Read` with its poll engine. A signed counter coalesces wake-ups: only a
//! producer that raises the counter from a non-positive value writes a byte,
//! and the dispatcher swaps the counter to zero to learn how many queued
//! requests it owes at least. Once the channel is shut down every write fails,
//! coalesced or not, so no request is left waiting on a channel that will
//! never be read again.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::config::ChannelTransport;
use crate::metrics;

const WAKE_BYTE: u8 = 0xFF;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

pub(crate) struct ControlChannel {
    client: OwnedFd,
    server: OwnedFd,
    pending: AtomicI64,
    closed: AtomicBool,
    server_reads: AtomicU64,
    server_bytes: AtomicU64,
}

impl ControlChannel {
    /// Open a connected pair over `transport`.
    pub(crate) fn open(transport: ChannelTransport) -> io::Result<Self> {
        let (client, server) = match transport {
            ChannelTransport::Loopback => {
                let (client, server) = loopback_pair()?;
                (OwnedFd::from(client), OwnedFd::from(server))
            }
            ChannelTransport::UnixPair => {
                let (client, server) = UnixStream::pair()?;
                client.set_nonblocking(true)?;
                (OwnedFd::from(client), OwnedFd::from(server))
            }
        };
        Ok(Self {
            client,
            server,
            pending: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            server_reads: AtomicU64::new(0),
            server_bytes: AtomicU64::new(0),
        })
    }

    pub(crate) fn server_fd(&self) -> RawFd {
        self.server.as_raw_fd()
    }

    /// Signal the dispatcher that a request was queued.
    ///
    /// Skips the write when a wake is already pending, unless `force` is set.
    /// On failure the counter is rolled back and the error returned; the
    /// caller must withdraw its request.
    pub(crate) fn client_write(&self, force: bool) -> io::Result<()> {
        if self.pending.fetch_add(1, Ordering::SeqCst) > 0 && !force {
            if self.closed.load(Ordering::SeqCst) {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "control channel shut down",
                ));
            }
            metrics::CHANNEL_COALESCED.increment();
            return Ok(());
        }
        let buf = [WAKE_BYTE];
        loop {
            let rc = unsafe {
                libc::send(
                    self.client.as_raw_fd(),
                    buf.as_ptr().cast(),
                    buf.len(),
                    SEND_FLAGS,
                )
            };
            if rc == 1 {
                metrics::CHANNEL_WAKES.increment();
                return Ok(());
            }
            let err = if rc < 0 {
                io::Error::last_os_error()
            } else {
                io::Error::new(io::ErrorKind::WriteZero, "control channel accepted no data")
            };
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                // Send buffer full: the server end is already readable.
                io::ErrorKind::WouldBlock => return Ok(()),
                _ => {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
    }

    /// Consume one wake byte. Returns how many wake-ups were coalesced into it,
    /// a lower bound on the requests queued behind it.
    ///
    /// End-of-stream or any error other than `EINTR` means the channel is broken.
    pub(crate) fn server_read(&self) -> io::Result<usize> {
        let owed = self.pending.swap(0, Ordering::SeqCst);
        let mut buf = [0u8; 1];
        loop {
            let rc = unsafe {
                libc::recv(
                    self.server.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    0,
                )
            };
            if rc > 0 {
                self.server_reads.fetch_add(1, Ordering::Relaxed);
                self.server_bytes.fetch_add(rc as u64, Ordering::Relaxed);
                metrics::CHANNEL_SERVER_READS.increment();
                return Ok(owed.max(0) as usize);
            }
            if rc == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "control channel closed",
                ));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Whether the server end still has a connected peer.
    pub(crate) fn is_server_connected(&self) -> bool {
        let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getpeername(
                self.server.as_raw_fd(),
                (&mut addr as *mut libc::sockaddr_storage).cast(),
                &mut len,
            )
        };
        rc == 0
    }

    /// Shut down both ends so any further client write fails.
    pub(crate) fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        unsafe {
            libc::shutdown(self.client.as_raw_fd(), libc::SHUT_RDWR);
            libc::shutdown(self.server.as_raw_fd(), libc::SHUT_RDWR);
        }
    }

    /// Shut down only the server end, as a failing environment would.
    pub(crate) fn sever(&self) {
        unsafe {
            libc::shutdown(self.server.as_raw_fd(), libc::SHUT_RDWR);
        }
    }

    /// Leave a wake outstanding, as a producer stalled mid-write would.
    #[cfg(test)]
    pub(crate) fn hold_pending(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// (wake reads, bytes read) on the server end.
    pub(crate) fn read_stats(&self) -> (u64, u64) {
        (
            self.server_reads.load(Ordering::Relaxed),
            self.server_bytes.load(Ordering::Relaxed),
        )
    }
}

/// Connected TCP pair on the loopback interface.
fn loopback_pair() -> io::Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let client = TcpStream::connect(listener.local_addr()?)?;
    let local = client.local_addr()?;
    let server = loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        // Anything else that raced onto the ephemeral port is dropped.
        if peer == local {
            break stream;
        }
    };
    client.set_nodelay(true)?;
    server.set_nodelay(true)?;
    client.set_nonblocking(true)?;
    Ok((client, server))
}
