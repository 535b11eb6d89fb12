//! Per-tunnel activity journal.
//!
//! Every [`crate::tunnel::Tunnel`] owns one [`ActivityLog`]. Accept events,
//! dial failures, byte counts and lifecycle transitions are appended here and
//! handed back to API callers as the tunnel's `message_log`.
//!
//! ## Design
//!
//! - **Append-only**: entries are only ever pushed. Once the cap is reached
//!   the oldest entries are dropped. A cap of 0 lets the log grow for the
//!   life of the tunnel.
//! - **Monotonic sequence numbers**: each entry gets an always-increasing
//!   `seq`, assigned under the same lock as the push, so the order of `seq`
//!   is the order of the log.
//! - **Tunnel-local lock**: each log has its own lock, so tunnels never
//!   contend with each other when recording events.

use std::collections::VecDeque;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

/// A single activity log entry.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl ActivityEntry {
    /// Render as `"[<rfc3339>] <message>"`.
    pub fn render(&self) -> String {
        format!(
            "[{}] {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.message
        )
    }
}

/// Entries kept per tunnel unless configured otherwise.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

struct Entries {
    items: VecDeque<ActivityEntry>,
    next_seq: u64,
}

/// Ordered, timestamped event log scoped to one tunnel.
pub struct ActivityLog {
    tunnel_id: u32,
    entries: RwLock<Entries>,
    /// 0 = unbounded.
    max_entries: usize,
}

impl ActivityLog {
    pub fn new(tunnel_id: u32, max_entries: usize) -> Self {
        Self {
            tunnel_id,
            entries: RwLock::new(Entries {
                items: VecDeque::new(),
                next_seq: 1,
            }),
            max_entries,
        }
    }

    /// Append a timestamped entry and return its sequence number.
    pub async fn record(&self, message: impl Into<String>) -> u64 {
        let message = message.into();
        debug!(tunnel_id = self.tunnel_id, "{message}");

        let mut entries = self.entries.write().await;
        let seq = entries.next_seq;
        entries.next_seq += 1;
        if self.max_entries > 0 && entries.items.len() >= self.max_entries {
            entries.items.pop_front();
        }
        entries.items.push_back(ActivityEntry {
            seq,
            timestamp: Utc::now(),
            message,
        });
        seq
    }

    /// Copy of every retained entry, oldest first.
    pub async fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.read().await.items.iter().cloned().collect()
    }

    /// Rendered lines, oldest first.
    pub async fn lines(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .items
            .iter()
            .map(ActivityEntry::render)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
