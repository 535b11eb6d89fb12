//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `IP6TUN_API_KEY`, `IP6TUN_LISTEN`,
//!    `IP6TUN_TLS_CERT`, `IP6TUN_TLS_KEY`, `IP6TUN_CONTROL_KEY`
//! 2. **Config file** — path via `--config <path>`, or `ip6tun.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "[::]:8080"
//! tls_cert = "/etc/ip6tun/cert.pem"
//! tls_key = "/etc/ip6tun/key.pem"
//! server_name = "localhost"
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [broker]
//! bind_address = "0.0.0.0"
//! idle_timeout_secs = 86400          # 0 = never reclaim idle tunnels
//! sweep_interval_secs = 30
//! dial_timeout_ms = 10000            # 0 = no dial timeout
//! session_idle_timeout_secs = 0      # 0 = sessions never idle out
//! half_close_timeout_secs = 60
//! max_log_entries = 1000             # 0 = unbounded
//!
//! [logging]
//! level = "info"
//!
//! # Optional — omit entirely to disable the control protocol listener
//! [control]
//! listen = "[::]:10026"
//! secret_key = "at-least-thirty-two-bytes-of-secret!"
//! provisioner = "broker"             # "broker" or "helper"
//! helper_bin = "/usr/bin/6tunnel"
//! mapping_ttl_secs = 43200
//! sweep_interval_secs = 900
//! ```

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::tunnel::broker::BrokerSettings;
use crate::tunnel::session::RelaySettings;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Optional encrypted control-protocol listener.
    pub control: Option<ControlConfig>,
}

/// Management API listener.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `[::]:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// PEM certificate chain. TLS is enabled when both cert and key are set.
    pub tls_cert: Option<String>,
    /// PEM private key.
    pub tls_key: Option<String>,
    /// Name advertised in the startup log (default `localhost`).
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Maximum in-flight API requests (default 64).
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared key expected in the `X-IP6TUN-AUTH` header. Override with
    /// `IP6TUN_API_KEY`. Defaults to `"change-me"` which triggers a startup
    /// warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Tunnel registry and relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// IPv4 address tunnel listeners bind to (default `0.0.0.0`).
    #[serde(default = "default_bind_address")]
    pub bind_address: Ipv4Addr,
    /// Seconds without an accepted connection before an unused tunnel is
    /// reclaimed (default 86400). 0 disables the reaper.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Seconds between idle sweeps (default 30).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Remote dial timeout in milliseconds (default 10 000). 0 = none.
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Close a relayed connection after this many seconds without traffic.
    /// 0 (default) = never.
    #[serde(default)]
    pub session_idle_timeout_secs: u64,
    /// Seconds the second direction may keep running after the first one hit
    /// EOF (default 60). 0 = until it finishes.
    #[serde(default = "default_half_close_timeout")]
    pub half_close_timeout_secs: u64,
    /// Activity log entries kept per tunnel (default 1000). 0 = unbounded.
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

/// Which [`crate::control::provisioner::Provisioner`] the control service uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionerKind {
    /// Program the in-process broker.
    #[default]
    Broker,
    /// Run an external forwarding helper per client.
    Helper,
}

/// Encrypted control-protocol listener.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Socket address to bind (default `[::]:10026`).
    #[serde(default = "default_control_listen")]
    pub listen: String,
    /// Pre-shared secret, at least 32 bytes. Override with `IP6TUN_CONTROL_KEY`.
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub provisioner: ProvisionerKind,
    /// Helper binary for `provisioner = "helper"` (default `6tunnel`).
    #[serde(default = "default_helper_bin")]
    pub helper_bin: String,
    /// Seconds a mapping lives without being refreshed (default 12 h).
    #[serde(default = "default_mapping_ttl")]
    pub mapping_ttl_secs: u64,
    /// Seconds between expiry sweeps (default 15 min).
    #[serde(default = "default_control_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "[::]:8080".to_string()
}
fn default_server_name() -> String {
    "localhost".to_string()
}
fn default_max_concurrent_requests() -> usize {
    64
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_bind_address() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}
fn default_idle_timeout() -> u64 {
    86_400
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_dial_timeout_ms() -> u64 {
    10_000
}
fn default_half_close_timeout() -> u64 {
    60
}
fn default_max_log_entries() -> usize {
    crate::activity::DEFAULT_MAX_ENTRIES
}
fn default_control_listen() -> String {
    "[::]:10026".to_string()
}
fn default_helper_bin() -> String {
    "6tunnel".to_string()
}
fn default_mapping_ttl() -> u64 {
    12 * 60 * 60
}
fn default_control_sweep_interval() -> u64 {
    15 * 60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tls_cert: None,
            tls_key: None,
            server_name: default_server_name(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            dial_timeout_ms: default_dial_timeout_ms(),
            session_idle_timeout_secs: 0,
            half_close_timeout_secs: default_half_close_timeout(),
            max_log_entries: default_max_log_entries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// `0` means "disabled" throughout the config.
fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl BrokerConfig {
    /// Registry settings derived from this section.
    pub fn settings(&self) -> BrokerSettings {
        BrokerSettings {
            bind_address: self.bind_address,
            idle_timeout: nonzero_secs(self.idle_timeout_secs),
            relay: RelaySettings {
                dial_timeout: (self.dial_timeout_ms > 0)
                    .then(|| Duration::from_millis(self.dial_timeout_ms)),
                idle_timeout: nonzero_secs(self.session_idle_timeout_secs),
                half_close_timeout: nonzero_secs(self.half_close_timeout_secs),
            },
            max_log_entries: self.max_log_entries,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl ServerConfig {
    /// Cert and key paths, when TLS is fully configured.
    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        match (self.tls_cert.as_deref(), self.tls_key.as_deref()) {
            (Some(cert), Some(key)) if !cert.is_empty() && !key.is_empty() => Some((cert, key)),
            _ => None,
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `ip6tun.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            Self::parse(&content).unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("ip6tun.toml").exists() {
            let content =
                std::fs::read_to_string("ip6tun.toml").expect("Failed to read ip6tun.toml");
            Self::parse(&content).expect("Failed to parse ip6tun.toml")
        } else {
            Config::default()
        };

        config.apply_env_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Parse a TOML document.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `IP6TUN_*` overrides looked up through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("IP6TUN_API_KEY") {
            self.auth.api_key = key;
        }
        if let Some(listen) = lookup("IP6TUN_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(cert) = lookup("IP6TUN_TLS_CERT") {
            self.server.tls_cert = Some(cert);
        }
        if let Some(key) = lookup("IP6TUN_TLS_KEY") {
            self.server.tls_key = Some(key);
        }
        if let Some(secret) = lookup("IP6TUN_CONTROL_KEY") {
            if let Some(ref mut control) = self.control {
                control.secret_key = secret;
            }
        }
    }
}
