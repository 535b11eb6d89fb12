//! 4-in-6 tunnels: IPv4 listeners relayed to (usually IPv6) remote endpoints.
//!
//! - [`Tunnel`] owns one bound listener and runs its accept loop.
//! - [`session`] relays one accepted connection to the remote target.
//! - [`broker`] is the registry that creates, looks up and reclaims tunnels.
//!
//! ## Concurrency
//!
//! Each tunnel tracks every task it spawns (the accept loop and one task per
//! relayed connection) in a [`TaskTracker`]. Shutdown is a
//! [`CancellationToken`]: every task holds a clone and observes the same
//! cancellation without consuming it. [`Tunnel::close`] cancels the token and
//! then waits on the tracker, so it only returns once every socket the
//! tunnel ever opened has been closed.

pub mod broker;
pub mod session;
pub mod target;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::activity::ActivityLog;
use crate::error::BrokerError;
use session::{RelaySession, RelaySettings, SessionGuard};
use target::RemoteTarget;

/// Pause after a failed `accept()` so a persistent error (e.g. fd
/// exhaustion) does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Mutable part of a tunnel, swapped atomically by [`Tunnel::update`].
struct TargetState {
    target: RemoteTarget,
    updated_at: Option<DateTime<Utc>>,
}

/// A named IPv4 listener relaying every accepted connection to a remote
/// endpoint.
pub struct Tunnel {
    id: u32,
    name: String,
    local_port: u16,
    created_at: DateTime<Utc>,
    state: RwLock<TargetState>,
    log: Arc<ActivityLog>,
    settings: RelaySettings,
    /// Epoch for `last_activity_ms`.
    epoch: Instant,
    /// Most recent accept, as ms since `epoch`.
    last_activity_ms: AtomicU64,
    active_sessions: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    closed: AtomicBool,
}

/// Point-in-time view of a tunnel, serialized by the management API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub id: u32,
    pub name: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub message_log: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub active_sessions: usize,
}

impl Tunnel {
    /// Build a tunnel around an already bound listener. Nothing runs until
    /// [`Tunnel::start`].
    pub(crate) fn new(
        id: u32,
        name: String,
        local_port: u16,
        target: RemoteTarget,
        settings: RelaySettings,
        max_log_entries: usize,
    ) -> Self {
        Self {
            id,
            name,
            local_port,
            created_at: Utc::now(),
            state: RwLock::new(TargetState {
                target,
                updated_at: None,
            }),
            log: Arc::new(ActivityLog::new(id, max_log_entries)),
            settings,
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            active_sessions: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The port the listener is actually bound to.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn activity_log(&self) -> &ActivityLog {
        &self.log
    }

    /// Current relay target (applies to connections accepted from now on).
    pub async fn target(&self) -> RemoteTarget {
        self.state.read().await.target.clone()
    }

    pub async fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.updated_at
    }

    /// Number of relay sessions currently running.
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Time since the last accepted connection (or since creation).
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        let idle = chrono::Duration::from_std(self.idle_for())
            .unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() - idle
    }

    /// Reclaimable by the idle reaper: no live sessions and no accept within
    /// `idle_timeout`.
    pub fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.active_sessions() == 0 && self.idle_for() > idle_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Spawn the accept loop onto the tunnel's task tracker.
    pub(crate) fn start(self: &Arc<Self>, listener: TcpListener) {
        let tunnel = Arc::clone(self);
        self.tasks.spawn(async move {
            tunnel.accept_loop(listener).await;
        });
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        self.log.record("Tunnel started").await;
        info!(tunnel_id = self.id, port = self.local_port, "Tunnel listening");

        loop {
            let accepted = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                res = listener.accept() => res,
            };

            match accepted {
                Ok((client, peer)) => self.spawn_session(client, peer).await,
                Err(e) => {
                    warn!(tunnel_id = self.id, "Accept error: {e}");
                    self.log.record(format!("Accept error: {e}")).await;
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        drop(listener);
        self.log.record("Tunnel stopped").await;
    }

    async fn spawn_session(&self, client: tokio::net::TcpStream, peer: SocketAddr) {
        self.touch();
        self.log
            .record(format!("Accept connection from {peer}"))
            .await;

        // Target is read once per accepted connection; later updates do not
        // affect this session.
        let target = self.target().await;
        let session = RelaySession {
            client,
            peer,
            target,
            log: Arc::clone(&self.log),
            settings: self.settings,
            shutdown: self.shutdown.clone(),
            guard: SessionGuard::new(&self.active_sessions),
        };
        self.tasks.spawn(session.run());
    }

    fn touch(&self) {
        #[allow(clippy::cast_possible_truncation)]
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Change the relay target for connections accepted after this call.
    pub async fn update(&self, remote_host: &str, remote_port: u16) -> Result<(), BrokerError> {
        let target = RemoteTarget::parse(remote_host, remote_port)?;
        let message = format!("Remote target changed to {target}");
        {
            let mut state = self.state.write().await;
            state.target = target;
            state.updated_at = Some(Utc::now());
        }
        self.log.record(message).await;
        Ok(())
    }

    /// Stop accepting, close every live session and wait until all of the
    /// tunnel's tasks have exited. Safe to call more than once.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(
                tunnel_id = self.id,
                sessions = self.active_sessions(),
                "Closing tunnel"
            );
            self.log.record("Tunnel closing").await;
        }
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Snapshot for API responses.
    pub async fn info(&self) -> TunnelInfo {
        let (target, updated_at) = {
            let state = self.state.read().await;
            (state.target.clone(), state.updated_at)
        };
        TunnelInfo {
            id: self.id,
            name: self.name.clone(),
            local_port: self.local_port,
            remote_host: target.host().to_string(),
            remote_port: target.port(),
            message_log: self.log.lines().await,
            created_at: self.created_at,
            updated_at,
            last_activity_at: self.last_activity_at(),
            active_sessions: self.active_sessions(),
        }
    }
}
