//! Provisioners turn a client mapping into an actual forwarding path.
//!
//! The control service only knows the [`Provisioner`] trait. Two
//! implementations exist:
//!
//! - [`BrokerProvisioner`] programs the in-process tunnel [`Broker`]; one
//!   tunnel per client, named by the client id.
//! - [`HelperProvisioner`] runs one external forwarding helper process per
//!   client (`<bin> -d <listen_port> <address> <target_port>`).

use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::message::ClientId;
use crate::error::{BrokerError, ControlError};
use crate::tunnel::broker::Broker;

/// A helper that exits within this window is treated as a failed start.
const HELPER_STARTUP_GRACE: Duration = Duration::from_millis(300);

/// One client's forwarding request: accept on `listen_port` here and relay
/// to `address:target_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub client_id: ClientId,
    pub address: IpAddr,
    pub listen_port: u16,
    pub target_port: u16,
}

/// Installs and tears down mappings.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the mapping, or replace the one already installed for the
    /// same client.
    async fn apply(&self, mapping: &Mapping) -> Result<(), ControlError>;

    /// Tear the client's mapping down. Removing an unknown mapping is not an
    /// error.
    async fn remove(&self, mapping: &Mapping) -> Result<(), ControlError>;
}

// ─── Broker ─────────────────────────────────────────────────────────────────

struct Installed {
    tunnel_id: u32,
    listen_port: u16,
}

/// Programs the in-process [`Broker`].
pub struct BrokerProvisioner {
    broker: Broker,
    tunnels: Mutex<HashMap<ClientId, Installed>>,
}

impl BrokerProvisioner {
    pub fn new(broker: Broker) -> Self {
        Self {
            broker,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Tunnel id currently serving `client_id`, if any.
    pub async fn tunnel_id(&self, client_id: &ClientId) -> Option<u32> {
        self.tunnels.lock().await.get(client_id).map(|i| i.tunnel_id)
    }
}

fn provision_error(e: &BrokerError) -> ControlError {
    ControlError::Provision(e.to_string())
}

#[async_trait]
impl Provisioner for BrokerProvisioner {
    async fn apply(&self, mapping: &Mapping) -> Result<(), ControlError> {
        let host = mapping.address.to_string();
        // Held across the broker calls so two updates from one client
        // cannot interleave.
        let mut tunnels = self.tunnels.lock().await;

        if let Some(existing) = tunnels.get(&mapping.client_id) {
            if existing.listen_port == mapping.listen_port {
                match self
                    .broker
                    .update(existing.tunnel_id, &host, mapping.target_port)
                    .await
                {
                    Ok(_) => return Ok(()),
                    // Reaped or deleted through the API; recreate below.
                    Err(BrokerError::NotFound(_)) => {}
                    Err(e) => return Err(provision_error(&e)),
                }
            } else {
                // The listen port of a tunnel is immutable.
                match self.broker.delete(existing.tunnel_id).await {
                    Ok(()) | Err(BrokerError::NotFound(_)) => {}
                    Err(e) => return Err(provision_error(&e)),
                }
            }
            tunnels.remove(&mapping.client_id);
        }

        let tunnel = self
            .broker
            .add(
                &mapping.client_id.to_string(),
                &host,
                mapping.target_port,
                mapping.listen_port,
            )
            .await
            .map_err(|e| provision_error(&e))?;
        tunnels.insert(
            mapping.client_id,
            Installed {
                tunnel_id: tunnel.id(),
                listen_port: tunnel.local_port(),
            },
        );
        Ok(())
    }

    async fn remove(&self, mapping: &Mapping) -> Result<(), ControlError> {
        let Some(installed) = self.tunnels.lock().await.remove(&mapping.client_id) else {
            return Ok(());
        };
        match self.broker.delete(installed.tunnel_id).await {
            Ok(()) | Err(BrokerError::NotFound(_)) => Ok(()),
            Err(e) => Err(provision_error(&e)),
        }
    }
}

// ─── External helper ────────────────────────────────────────────────────────

/// Supervises one external forwarding helper process per client.
///
/// Children are spawned with `kill_on_drop`, so dropping the provisioner
/// kills every helper it started.
pub struct HelperProvisioner {
    bin: String,
    children: Mutex<HashMap<ClientId, Child>>,
}

impl HelperProvisioner {
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Number of helpers currently supervised.
    pub async fn running(&self) -> usize {
        self.children.lock().await.len()
    }

    fn command(&self, mapping: &Mapping) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-d")
            .arg(mapping.listen_port.to_string())
            .arg(mapping.address.to_string())
            .arg(mapping.target_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

async fn stop_child(client_id: &ClientId, mut child: Child) {
    if let Err(e) = child.kill().await {
        debug!(client_id = %client_id, "Helper already gone: {e}");
    }
}

#[async_trait]
impl Provisioner for HelperProvisioner {
    async fn apply(&self, mapping: &Mapping) -> Result<(), ControlError> {
        // The lock only guards the map; starting a helper happens outside it
        // so one slow client does not hold up the others.
        let old = self.children.lock().await.remove(&mapping.client_id);
        if let Some(old) = old {
            stop_child(&mapping.client_id, old).await;
        }

        info!(
            client_id = %mapping.client_id,
            "{} -d {} {} {}",
            self.bin,
            mapping.listen_port,
            mapping.address,
            mapping.target_port
        );
        let mut child = self
            .command(mapping)
            .spawn()
            .map_err(|e| ControlError::Provision(format!("failed to start {}: {e}", self.bin)))?;

        // A helper that cannot bind exits straight away.
        match tokio::time::timeout(HELPER_STARTUP_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                return Err(ControlError::Provision(format!(
                    "{} exited immediately: {status}",
                    self.bin
                )));
            }
            Ok(Err(e)) => return Err(ControlError::Provision(e.to_string())),
            Err(_) => {}
        }

        // A concurrent apply for the same client may have won the race.
        let replaced = self.children.lock().await.insert(mapping.client_id, child);
        if let Some(replaced) = replaced {
            stop_child(&mapping.client_id, replaced).await;
        }
        Ok(())
    }

    async fn remove(&self, mapping: &Mapping) -> Result<(), ControlError> {
        let child = self.children.lock().await.remove(&mapping.client_id);
        if let Some(child) = child {
            stop_child(&mapping.client_id, child).await;
        } else {
            warn!(client_id = %mapping.client_id, "No helper running for client");
        }
        Ok(())
    }
}
