//! Tunnel registry.
//!
//! [`Broker`] is the single authority for creating, looking up, updating and
//! destroying tunnels. It also runs the idle reaper that reclaims tunnels
//! nobody has connected to for `idle_timeout`.
//!
//! ## Concurrency
//!
//! The id→tunnel map sits behind one `RwLock` that is only held for map
//! mutation, lookup and snapshotting. Binding a listener happens before the
//! lock is taken and draining a tunnel happens after it is released, so no
//! socket I/O ever runs under the registry lock. `delete` and the reaper
//! remove a tunnel from the map first and close it afterwards, which makes a
//! concurrent second `delete` of the same id a clean `NotFound`.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::session::RelaySettings;
use super::target::RemoteTarget;
use super::Tunnel;
use crate::activity::DEFAULT_MAX_ENTRIES;
use crate::error::BrokerError;

/// Floor for the reaper tick; `tokio::time::interval` rejects zero.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Registry-wide settings, usually built from [`crate::config::BrokerConfig`].
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// IPv4 address every tunnel listener binds to.
    pub bind_address: Ipv4Addr,
    /// Reclaim tunnels idle for longer than this. `None` disables reaping.
    pub idle_timeout: Option<Duration>,
    /// Bounds applied to every relayed connection.
    pub relay: RelaySettings,
    /// Per-tunnel activity log cap (0 = unbounded).
    pub max_log_entries: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            bind_address: Ipv4Addr::UNSPECIFIED,
            idle_timeout: Some(Duration::from_secs(86_400)),
            relay: RelaySettings::default(),
            max_log_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

struct Registry {
    tunnels: HashMap<u32, Arc<Tunnel>>,
    next_id: u32,
}

struct Inner {
    registry: RwLock<Registry>,
    settings: BrokerSettings,
    /// Cancelled by [`Broker::close`]; stops the reaper and refuses new tunnels.
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Owns every tunnel in the process.
///
/// Cloneable — all clones share the same registry.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(Registry {
                    tunnels: HashMap::new(),
                    next_id: 0,
                }),
                settings,
                shutdown: CancellationToken::new(),
                reaper: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.inner.settings
    }

    /// Bind an IPv4 listener on `local_port` and start relaying it to
    /// `remote_host:remote_port`.
    ///
    /// `local_port = 0` binds an OS-assigned port; the returned tunnel reports
    /// the port actually bound. No id is consumed when validation or the bind
    /// fails.
    pub async fn add(
        &self,
        name: &str,
        remote_host: &str,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Arc<Tunnel>, BrokerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(BrokerError::InvalidName);
        }
        let target = RemoteTarget::parse(remote_host, remote_port)?;

        let addr = SocketAddrV4::new(self.inner.settings.bind_address, local_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BrokerError::BindFailed {
                port: local_port,
                source,
            })?;
        let bound_port = listener
            .local_addr()
            .map_err(|source| BrokerError::BindFailed {
                port: local_port,
                source,
            })?
            .port();

        let mut registry = self.inner.registry.write().await;
        // close() may have run while we were binding.
        if self.inner.shutdown.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        let id = registry.next_id;
        registry.next_id += 1;

        let tunnel = Arc::new(Tunnel::new(
            id,
            name.to_string(),
            bound_port,
            target.clone(),
            self.inner.settings.relay,
            self.inner.settings.max_log_entries,
        ));
        tunnel.start(listener);
        registry.tunnels.insert(id, Arc::clone(&tunnel));
        let total = registry.tunnels.len();
        drop(registry);

        info!(
            tunnel_id = id,
            tunnel_name = name,
            "Tunnel created: {}:{bound_port} -> {target}, total: {total}",
            self.inner.settings.bind_address
        );
        Ok(tunnel)
    }

    /// Look up a tunnel by id.
    pub async fn get(&self, id: u32) -> Result<Arc<Tunnel>, BrokerError> {
        self.inner
            .registry
            .read()
            .await
            .tunnels
            .get(&id)
            .cloned()
            .ok_or(BrokerError::NotFound(id))
    }

    /// Change a tunnel's remote target. Sessions already running keep their
    /// original target.
    pub async fn update(
        &self,
        id: u32,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Arc<Tunnel>, BrokerError> {
        let tunnel = self.get(id).await?;
        tunnel.update(remote_host, remote_port).await?;
        info!(tunnel_id = id, "Tunnel target updated to {remote_host}:{remote_port}");
        Ok(tunnel)
    }

    /// Remove a tunnel and wait until it has fully drained.
    pub async fn delete(&self, id: u32) -> Result<(), BrokerError> {
        let tunnel = {
            let mut registry = self.inner.registry.write().await;
            registry
                .tunnels
                .remove(&id)
                .ok_or(BrokerError::NotFound(id))?
        };
        // Lock released before the potentially slow drain.
        tunnel.close().await;
        info!(tunnel_id = id, "Tunnel deleted");
        Ok(())
    }

    /// Snapshot of all tunnels, ordered by id.
    pub async fn list(&self) -> Vec<Arc<Tunnel>> {
        let mut tunnels: Vec<Arc<Tunnel>> = self
            .inner
            .registry
            .read()
            .await
            .tunnels
            .values()
            .cloned()
            .collect();
        tunnels.sort_by_key(|t| t.id());
        tunnels
    }

    pub async fn len(&self) -> usize {
        self.inner.registry.read().await.tunnels.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Start the periodic idle sweep. Calling it again replaces the previous
    /// reaper. Does nothing once the broker is closed. Intervals below 1ms
    /// are raised to 1ms.
    pub async fn start_reaper(&self, interval: Duration) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_SWEEP_INTERVAL));
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                Broker { inner }.reap_idle().await;
            }
        });

        if let Some(old) = self.inner.reaper.lock().await.replace(handle) {
            old.abort();
        }
    }

    /// Delete every tunnel that has no live sessions and no accept within
    /// `idle_timeout`. Returns the reclaimed ids.
    pub async fn reap_idle(&self) -> Vec<u32> {
        let Some(idle_timeout) = self.inner.settings.idle_timeout else {
            return Vec::new();
        };

        let expired: Vec<Arc<Tunnel>> = {
            let mut registry = self.inner.registry.write().await;
            let ids: Vec<u32> = registry
                .tunnels
                .iter()
                .filter(|(_, t)| t.is_idle(idle_timeout))
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| registry.tunnels.remove(id))
                .collect()
        };

        let mut reaped = Vec::with_capacity(expired.len());
        for tunnel in expired {
            warn!(
                tunnel_id = tunnel.id(),
                "Reaping idle tunnel (no activity for {}s)",
                tunnel.idle_for().as_secs()
            );
            tunnel
                .activity_log()
                .record("Tunnel reclaimed by idle reaper")
                .await;
            tunnel.close().await;
            reaped.push(tunnel.id());
        }
        reaped
    }

    /// Stop the reaper and close every tunnel. Later `add` calls fail with
    /// [`BrokerError::Closed`]. Safe to call more than once.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let reaper = self.inner.reaper.lock().await.take();
        if let Some(handle) = reaper {
            let _ = handle.await;
        }

        let tunnels: Vec<Arc<Tunnel>> = {
            let mut registry = self.inner.registry.write().await;
            registry.tunnels.drain().map(|(_, t)| t).collect()
        };
        if tunnels.is_empty() {
            return;
        }

        let count = tunnels.len();
        join_all(tunnels.iter().map(|t| t.close())).await;
        for tunnel in &tunnels {
            info!(tunnel_id = tunnel.id(), tunnel_name = tunnel.name(), "Closed tunnel");
        }
        info!("Shut down {count} tunnel(s)");
    }
}
