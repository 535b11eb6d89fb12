//! One relayed connection: accepted client socket paired with a dialed
//! remote socket.
//!
//! A [`RelaySession`] is spawned by the tunnel's accept loop for every
//! accepted connection. It dials the target captured at accept time, then
//! pumps bytes in both directions until both are done, the tunnel shuts
//! down, or one of the optional bounds in [`RelaySettings`] fires.
//!
//! ## Shutdown of the two directions
//!
//! - A direction that reaches EOF shuts down the write side of its
//!   destination so the peer sees the FIN. The sibling direction keeps
//!   running for at most `half_close_timeout`, or until it finishes when
//!   that is unset.
//! - A direction that fails tears the session down immediately.
//! - Tunnel shutdown tears the session down immediately.
//!
//! Both sockets are owned by the session future. Every exit path drops them,
//! so each socket is closed exactly once.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::target::RemoteTarget;
use crate::activity::ActivityLog;
use crate::error::RelayError;

/// Read buffer per copy direction.
const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Optional bounds on a single relayed connection.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// Abort the dial after this long. `None` waits for the OS.
    pub dial_timeout: Option<Duration>,
    /// Close a session after this long without bytes in either direction.
    pub idle_timeout: Option<Duration>,
    /// How long the second direction may keep running after the first one
    /// reached EOF. `None` lets it run until it finishes on its own.
    pub half_close_timeout: Option<Duration>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            dial_timeout: Some(Duration::from_secs(10)),
            idle_timeout: None,
            half_close_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Decrements the owning tunnel's active-session count on drop.
pub(crate) struct SessionGuard(Arc<AtomicUsize>);

impl SessionGuard {
    pub(crate) fn new(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(active))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How a dialed session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Both directions finished on their own.
    Completed,
    /// One direction failed; the other was dropped.
    Aborted,
    Shutdown,
    Idle,
    HalfCloseTimeout,
}

pub(crate) struct RelaySession {
    pub(crate) client: TcpStream,
    pub(crate) peer: SocketAddr,
    pub(crate) target: RemoteTarget,
    pub(crate) log: Arc<ActivityLog>,
    pub(crate) settings: RelaySettings,
    pub(crate) shutdown: CancellationToken,
    pub(crate) guard: SessionGuard,
}

impl RelaySession {
    /// Dial the target and relay until done. Never returns an error: every
    /// failure is recorded in the tunnel's activity log.
    pub(crate) async fn run(self) {
        let Self {
            client,
            peer,
            target,
            log,
            settings,
            shutdown,
            guard,
        } = self;

        let dialed = tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            res = dial(&target, settings.dial_timeout) => res,
        };
        let remote = match dialed {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %peer, "{e}");
                log.record(e.to_string()).await;
                return;
            }
        };

        let remote_addr = remote
            .peer_addr()
            .map_or_else(|_| target.to_string(), |a| a.to_string());
        let peer_addr = peer.to_string();
        debug!(peer = %peer, remote = %remote_addr, "Relay session started");

        let end = relay(client, remote, &peer_addr, &remote_addr, &log, &settings, &shutdown).await;

        match end {
            SessionEnd::Shutdown => {
                log.record(format!("Connection from {peer} closed by tunnel shutdown"))
                    .await;
            }
            SessionEnd::Idle => {
                let limit = settings.idle_timeout.unwrap_or_default();
                log.record(format!("Connection from {peer} idle for {limit:?}, closing"))
                    .await;
            }
            SessionEnd::HalfCloseTimeout => {
                let limit = settings.half_close_timeout.unwrap_or_default();
                log.record(format!("Connection from {peer} half-closed for {limit:?}, closing"))
                    .await;
            }
            SessionEnd::Completed | SessionEnd::Aborted => {}
        }
        log.record(format!("Closed connection from {peer}")).await;
        drop(guard);
    }
}

/// Dial `target`, bounded by `timeout` when set. Hostnames are resolved and
/// IPv4/IPv6 literals are dialed over their own address family.
async fn dial(target: &RemoteTarget, timeout: Option<Duration>) -> Result<TcpStream, RelayError> {
    let connect = TcpStream::connect((target.host(), target.port()));
    let res = match timeout {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| RelayError::DialTimeout {
                target: target.to_string(),
                timeout_ms: limit.as_millis(),
            })?,
        None => connect.await,
    };
    res.map_err(|source| RelayError::DialFailed {
        target: target.to_string(),
        source,
    })
}

/// Run both copy directions. Owns both sockets; they are closed when this
/// returns.
async fn relay(
    client: TcpStream,
    remote: TcpStream,
    peer_addr: &str,
    remote_addr: &str,
    log: &ActivityLog,
    settings: &RelaySettings,
    shutdown: &CancellationToken,
) -> SessionEnd {
    let _ = client.set_nodelay(true);
    let _ = remote.set_nodelay(true);

    let (mut client_rd, mut client_wr) = client.into_split();
    let (mut remote_rd, mut remote_wr) = remote.into_split();

    let clock = IdleClock::new();
    let upstream = pipe(&mut client_rd, &mut remote_wr, &clock);
    let downstream = pipe(&mut remote_rd, &mut client_wr, &clock);
    let idle = idle_watch(&clock, settings.idle_timeout);
    tokio::pin!(upstream, downstream, idle);

    let mut upstream_done = false;
    let mut downstream_done = false;
    let mut linger: Option<Instant> = None;
    let mut lingering = false;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return SessionEnd::Shutdown,
            () = &mut idle => return SessionEnd::Idle,
            () = sleep_until_opt(linger) => return SessionEnd::HalfCloseTimeout,
            res = &mut upstream, if !upstream_done => {
                upstream_done = true;
                if !record_copy(log, res, peer_addr, remote_addr).await {
                    return SessionEnd::Aborted;
                }
            }
            res = &mut downstream, if !downstream_done => {
                downstream_done = true;
                if !record_copy(log, res, remote_addr, peer_addr).await {
                    return SessionEnd::Aborted;
                }
            }
        }

        if upstream_done && downstream_done {
            return SessionEnd::Completed;
        }
        if !lingering {
            lingering = true;
            // An unset or unrepresentable deadline leaves the linger unbounded.
            linger = settings
                .half_close_timeout
                .and_then(|limit| Instant::now().checked_add(limit));
        }
    }
}

/// Log the outcome of one copy direction. Returns `false` on error.
async fn record_copy(log: &ActivityLog, res: io::Result<u64>, from: &str, to: &str) -> bool {
    match res {
        Ok(n) => {
            log.record(format!("Copied {n} bytes from {from} to {to}")).await;
            true
        }
        Err(e) => {
            log.record(format!("Relay {from} -> {to} failed: {e}")).await;
            false
        }
    }
}

/// Copy `src` into `dst` until EOF, then shut down `dst`'s write side.
async fn pipe<R, W>(src: &mut R, dst: &mut W, clock: &IdleClock) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            // Peer may already be gone; the FIN is best-effort.
            let _ = dst.shutdown().await;
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
        clock.touch();
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Resolves once the session has seen no traffic for `timeout`.
async fn idle_watch(clock: &IdleClock, timeout: Option<Duration>) {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };
    loop {
        let idle_for = clock.idle_for();
        if idle_for >= timeout {
            return;
        }
        tokio::time::sleep(timeout - idle_for).await;
    }
}

/// Last-traffic timestamp shared by both directions, as ms since `epoch`.
struct IdleClock {
    epoch: Instant,
    last_ms: AtomicU64,
}

impl IdleClock {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        #[allow(clippy::cast_possible_truncation)]
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.store(now_ms, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipe_copies_and_shuts_down() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let (mut c, mut d) = tokio::io::duplex(64);
        let clock = IdleClock::new();

        let writer = tokio::spawn(async move {
            a.write_all(b"hello relay").await.unwrap();
            a.shutdown().await.unwrap();
            a
        });

        let n = pipe(&mut b, &mut c, &clock).await.unwrap();
        assert_eq!(n, 11);

        let mut out = Vec::new();
        d.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello relay");
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_watch_fires_after_timeout() {
        let clock = IdleClock::new();
        let started = Instant::now();
        idle_watch(&clock, Some(Duration::from_secs(5))).await;
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_watch_without_timeout_never_fires() {
        let clock = IdleClock::new();
        let res = tokio::time::timeout(Duration::from_secs(3600), idle_watch(&clock, None)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_dial_failure_is_reported() {
        // Bind then drop to get a port that refuses connections.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = RemoteTarget::parse("127.0.0.1", port).unwrap();
        let err = dial(&target, Some(Duration::from_secs(2))).await.unwrap_err();
        assert!(matches!(err, RelayError::DialFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_far_deadline_never_fires() {
        let deadline = Instant::now().checked_add(Duration::from_secs(u64::MAX));
        assert!(deadline.is_none());
        let res = tokio::time::timeout(Duration::from_secs(3600), sleep_until_opt(deadline)).await;
        assert!(res.is_err());
    }

    #[test]
    fn test_session_guard_counts() {
        let active = Arc::new(AtomicUsize::new(0));
        let g1 = SessionGuard::new(&active);
        let g2 = SessionGuard::new(&active);
        assert_eq!(active.load(Ordering::SeqCst), 2);
        drop(g1);
        assert_eq!(active.load(Ordering::SeqCst), 1);
        drop(g2);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }
}
