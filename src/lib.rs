#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! ip6tun library — the tunnel broker and its two control planes.
//!
//! - `tunnel` — tunnels, relay sessions and the [`Broker`] registry
//! - `activity` — per-tunnel activity log
//! - `routes` — HTTP management API
//! - `auth` — API key middleware
//! - `control` — encrypted binary control protocol
//! - `client` — REST client for the management API
//! - `config` — configuration loading

pub mod activity;
pub mod auth;
pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod routes;
pub mod state;
pub mod tunnel;

pub use activity::ActivityLog;
pub use auth::ApiKey;
pub use config::Config;
pub use error::{BrokerError, ControlError, RelayError};
pub use state::AppState;
pub use tunnel::broker::{Broker, BrokerSettings};
pub use tunnel::session::RelaySettings;
pub use tunnel::{Tunnel, TunnelInfo};
