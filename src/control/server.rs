//! Control-protocol listener.
//!
//! [`ControlService`] owns everything the control plane needs (cipher,
//! provisioner and the table of live mappings) and is passed explicitly to
//! every connection handler. Each connection carries exactly one sealed
//! request frame and receives at most one sealed reply.
//!
//! Mappings expire `mapping_ttl` after their last `update`; clients are
//! expected to refresh them periodically. [`ControlService::sweep_expired`]
//! removes stale ones.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::cipher::{ControlCipher, FRAME_LEN};
use super::message::{ClientId, ControlMessage, MessageType};
use super::provisioner::{Mapping, Provisioner};
use crate::error::ControlError;

#[derive(Debug, Clone, Copy)]
pub struct ControlSettings {
    /// Time allowed for a client to deliver its request frame.
    pub read_timeout: Duration,
    /// Lifetime of a mapping after its last refresh.
    pub mapping_ttl: Duration,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            mapping_ttl: Duration::from_secs(12 * 60 * 60),
        }
    }
}

/// A live mapping and when it expires.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    pub mapping: Mapping,
    pub remove_at: DateTime<Utc>,
}

pub struct ControlService {
    cipher: ControlCipher,
    provisioner: Arc<dyn Provisioner>,
    settings: ControlSettings,
    mappings: Mutex<HashMap<ClientId, MappingEntry>>,
    tasks: TaskTracker,
}

impl ControlService {
    pub fn new(
        cipher: ControlCipher,
        provisioner: Arc<dyn Provisioner>,
        settings: ControlSettings,
    ) -> Self {
        Self {
            cipher,
            provisioner,
            settings,
            mappings: Mutex::new(HashMap::new()),
            tasks: TaskTracker::new(),
        }
    }

    /// Accept connections until `shutdown` fires, then wait for in-flight
    /// handlers to finish.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!("Control service listening on {addr}");
        }
        loop {
            let accepted = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                res = listener.accept() => res,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let svc = Arc::clone(&self);
                    self.tasks.spawn(async move {
                        if let Err(e) = svc.handle_connection(stream, peer).await {
                            warn!(peer = %peer, "Control request failed: {e}");
                        }
                    });
                }
                Err(e) => {
                    warn!("Control accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
        drop(listener);
        self.tasks.close();
        self.tasks.wait().await;
        info!("Control service stopped");
    }

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), ControlError> {
        let mut frame = [0u8; FRAME_LEN];
        tokio::time::timeout(self.settings.read_timeout, stream.read_exact(&mut frame))
            .await
            .map_err(|_| ControlError::Timeout)??;

        let msg = self.cipher.open(&frame)?;
        debug!(peer = %peer, client_id = %msg.client_id, kind = msg.kind.as_str(), "Control request");

        if let Some(reply) = self.handle(msg, peer.ip()).await {
            let sealed = self.cipher.seal(&reply)?;
            stream.write_all(&sealed).await?;
            stream.shutdown().await?;
        }
        Ok(())
    }

    /// Dispatch one decoded request from `peer`. Returns the reply to send,
    /// if any.
    pub async fn handle(&self, msg: ControlMessage, peer: IpAddr) -> Option<ControlMessage> {
        match msg.kind {
            MessageType::Update => Some(self.handle_update(msg, peer).await),
            MessageType::Delete => Some(self.handle_delete(msg).await),
            MessageType::Acknowledge | MessageType::ErrorNoTunnel => {
                warn!(
                    client_id = %msg.client_id,
                    "Ignoring unexpected {} message",
                    msg.kind.as_str()
                );
                None
            }
        }
    }

    async fn handle_update(&self, msg: ControlMessage, peer: IpAddr) -> ControlMessage {
        // The client's service listens on its local port; we accept on the
        // port it calls remote.
        let mapping = Mapping {
            client_id: msg.client_id,
            address: peer.to_canonical(),
            listen_port: msg.remote_port,
            target_port: msg.local_port,
        };

        if let Err(e) = self.provisioner.apply(&mapping).await {
            warn!(client_id = %msg.client_id, "Unable to provision mapping: {e}");
            // A failed replace may already have torn the old path down, so
            // forget the client entirely rather than keep a stale entry.
            let stale = self.mappings.lock().await.remove(&msg.client_id);
            if let Some(stale) = stale {
                if let Err(e) = self.provisioner.remove(&stale.mapping).await {
                    warn!(client_id = %msg.client_id, "Unable to remove mapping: {e}");
                }
            }
            return msg.reply(MessageType::ErrorNoTunnel);
        }

        let remove_at = Utc::now() + ttl(self.settings.mapping_ttl);
        info!(
            client_id = %msg.client_id,
            "Mapping :{} -> {}:{} until {}",
            mapping.listen_port,
            mapping.address,
            mapping.target_port,
            remove_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        );
        self.mappings
            .lock()
            .await
            .insert(msg.client_id, MappingEntry { mapping, remove_at });
        msg.reply(MessageType::Acknowledge)
    }

    async fn handle_delete(&self, msg: ControlMessage) -> ControlMessage {
        let entry = self.mappings.lock().await.remove(&msg.client_id);
        let Some(entry) = entry else {
            return msg.reply(MessageType::ErrorNoTunnel);
        };
        match self.provisioner.remove(&entry.mapping).await {
            Ok(()) => {
                info!(client_id = %msg.client_id, "Mapping removed");
                msg.reply(MessageType::Acknowledge)
            }
            Err(e) => {
                warn!(client_id = %msg.client_id, "Unable to remove mapping: {e}");
                msg.reply(MessageType::ErrorNoTunnel)
            }
        }
    }

    /// Snapshot of live mappings.
    pub async fn mappings(&self) -> Vec<MappingEntry> {
        self.mappings.lock().await.values().cloned().collect()
    }

    /// Remove every mapping whose `remove_at` has passed. Returns how many
    /// were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<MappingEntry> = {
            let mut mappings = self.mappings.lock().await;
            let ids: Vec<ClientId> = mappings
                .iter()
                .filter(|(_, e)| e.remove_at <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| mappings.remove(id)).collect()
        };

        for entry in &expired {
            info!(client_id = %entry.mapping.client_id, "Removing expired mapping");
            if let Err(e) = self.provisioner.remove(&entry.mapping).await {
                warn!(client_id = %entry.mapping.client_id, "Unable to remove mapping: {e}");
            }
        }
        expired.len()
    }

    /// Run [`Self::sweep_expired`] every `interval` (at least 1ms) until
    /// `shutdown` fires.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let removed = self.sweep_expired().await;
            if removed > 0 {
                info!("Expired {removed} control mapping(s)");
            }
        }
    }
}

fn ttl(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
