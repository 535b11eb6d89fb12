#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # ip6tun
//!
//! 4-in-6 TCP tunnel broker. Each tunnel is an IPv4 listener whose
//! connections are relayed to a (usually IPv6) remote endpoint.
//!
//! ## Subcommands
//!
//! - `ip6tun serve` (default) — run the broker, the HTTP management API and,
//!   when `[control]` is configured, the encrypted control listener
//! - `ip6tun client <name> <local_port> <remote_port>` — create or update a
//!   tunnel back to this host through the management API
//! - `ip6tun notify <update|delete>` — send one control-protocol request
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, TLS, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! auth.rs          — X-IP6TUN-AUTH middleware
//! routes/          — management API handlers
//! tunnel/
//!   mod.rs         — Tunnel (accept loop, update, close)
//!   session.rs     — one relayed connection
//!   broker.rs      — registry + idle reaper
//! control/         — encrypted control protocol + provisioners
//! client.rs        — management API client
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ip6tun::client::{format_tunnel, ApiClient};
use ip6tun::config::{Config, ControlConfig, ProvisionerKind};
use ip6tun::control::{
    self, BrokerProvisioner, ClientId, ControlCipher, ControlMessage, ControlService,
    ControlSettings, HelperProvisioner, MessageType, Provisioner,
};
use ip6tun::{routes, AppState, Broker};

/// Grace period for in-flight API requests after a shutdown signal.
const HTTP_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// 4-in-6 TCP tunnel broker.
#[derive(Parser)]
#[command(name = "ip6tun", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker and its APIs (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Create a tunnel back to this host, or update every tunnel with this
    /// name, then list all tunnels.
    Client {
        /// Management API base URL.
        #[arg(long, env = "IP6TUN_SERVER", default_value = "https://localhost:8080")]
        server: String,
        #[arg(long, env = "IP6TUN_API_KEY")]
        api_key: String,
        /// Accept self-signed server certificates.
        #[arg(long)]
        insecure: bool,
        /// Tunnel name.
        name: String,
        /// Port the server listens on.
        local_port: u16,
        /// Port on this host the server relays to.
        remote_port: u16,
    },
    /// Send one control-protocol request and print the reply.
    Notify {
        action: NotifyAction,
        /// Control server address (host:port).
        #[arg(long, default_value = "localhost:10026")]
        server: String,
        #[arg(long, env = "IP6TUN_CONTROL_KEY")]
        secret: String,
        /// 64 hex chars. Derived from the hostname when omitted.
        #[arg(long)]
        client_id: Option<String>,
        /// Port of the service on this host.
        #[arg(long, default_value_t = 0)]
        local_port: u16,
        /// Port the server should accept on.
        #[arg(long, default_value_t = 0)]
        remote_port: u16,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum NotifyAction {
    Update,
    Delete,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Some(Commands::Serve { config }) => {
            run_server(config.as_deref()).await;
            0
        }
        None => {
            run_server(None).await;
            0
        }
        Some(Commands::Client {
            server,
            api_key,
            insecure,
            name,
            local_port,
            remote_port,
        }) => {
            init_tracing("warn");
            match run_client(&server, api_key, insecure, &name, local_port, remote_port).await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("Error: {e}");
                    1
                }
            }
        }
        Some(Commands::Notify {
            action,
            server,
            secret,
            client_id,
            local_port,
            remote_port,
        }) => {
            init_tracing("warn");
            match run_notify(action, &server, &secret, client_id.as_deref(), local_port, remote_port)
                .await
            {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("Error: {e}");
                    1
                }
            }
        }
    };
    std::process::exit(code);
}

fn init_tracing(default_level: &str) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

#[allow(clippy::too_many_lines)]
async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config.logging.level);

    info!("ip6tun v{} starting", env!("CARGO_PKG_VERSION"));

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set IP6TUN_API_KEY or update config");
    }

    let broker = Broker::new(config.broker.settings());
    broker.start_reaper(config.broker.sweep_interval()).await;

    let shutdown = CancellationToken::new();

    // Control protocol, if configured
    let control_tasks = match config.control.clone() {
        Some(cc) => match start_control(&cc, &broker, &shutdown).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Control service disabled: {e}");
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    let listen: SocketAddr = config
        .server
        .listen
        .parse()
        .unwrap_or_else(|e| panic!("Invalid listen address {}: {e}", config.server.listen));
    let tls = config
        .server
        .tls_paths()
        .map(|(c, k)| (c.to_string(), k.to_string()));
    let server_name = config.server.server_name.clone();

    let state = AppState::new(config, broker.clone());
    let app = routes::router(state).into_make_service_with_connect_info::<SocketAddr>();

    // Signal → cancel
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_token.cancel();
    });

    if let Some((cert, key)) = tls {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert, &key)
            .await
            .unwrap_or_else(|e| panic!("Failed to load TLS cert {cert} / key {key}: {e}"));

        let handle = axum_server::Handle::new();
        let h = handle.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            h.graceful_shutdown(Some(HTTP_SHUTDOWN_GRACE));
        });

        info!("Server running at https://{server_name}:{}", listen.port());
        if let Err(e) = axum_server::bind_rustls(listen, tls_config)
            .handle(handle)
            .serve(app)
            .await
        {
            error!("Server error: {e}");
        }
    } else {
        warn!("TLS not configured — serving the management API over plain HTTP");
        let listener = TcpListener::bind(listen).await.expect("Failed to bind");
        info!("Server running at http://{server_name}:{}", listen.port());
        let token = shutdown.clone();
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
        {
            error!("Server error: {e}");
        }
    }

    // Cleanup
    info!("Shutting down...");
    shutdown.cancel();
    for task in control_tasks {
        let _ = task.await;
    }
    broker.close().await;
    info!("Goodbye");
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

/// Bind the control listener and spawn it plus its expiry sweep.
async fn start_control(
    cc: &ControlConfig,
    broker: &Broker,
    shutdown: &CancellationToken,
) -> Result<Vec<tokio::task::JoinHandle<()>>, Box<dyn std::error::Error>> {
    let cipher = ControlCipher::new(cc.secret_key.as_bytes())?;
    let provisioner: Arc<dyn Provisioner> = match cc.provisioner {
        ProvisionerKind::Broker => Arc::new(BrokerProvisioner::new(broker.clone())),
        ProvisionerKind::Helper => Arc::new(HelperProvisioner::new(cc.helper_bin.clone())),
    };
    let settings = ControlSettings {
        mapping_ttl: Duration::from_secs(cc.mapping_ttl_secs),
        ..ControlSettings::default()
    };
    let service = Arc::new(ControlService::new(cipher, provisioner, settings));
    let listener = TcpListener::bind(&cc.listen).await?;

    let serve = tokio::spawn(Arc::clone(&service).serve(listener, shutdown.clone()));
    let sweep = tokio::spawn(service.run_sweeper(
        Duration::from_secs(cc.sweep_interval_secs.max(1)),
        shutdown.clone(),
    ));
    Ok(vec![serve, sweep])
}

async fn run_client(
    server: &str,
    api_key: String,
    insecure: bool,
    name: &str,
    local_port: u16,
    remote_port: u16,
) -> Result<(), ip6tun::client::ClientError> {
    let client = ApiClient::new(server, api_key, insecure)?;

    let mut updated = false;
    for tunnel in client.list().await? {
        if tunnel.name == name {
            client
                .update(tunnel.id, name, local_port, remote_port)
                .await?;
            println!("Tunnel {} updated", tunnel.id);
            updated = true;
        }
    }
    if !updated {
        let tunnel = client.create(name, local_port, remote_port).await?;
        println!("Tunnel {} created", tunnel.id);
    }

    println!("Listing all tunnels");
    for tunnel in client.list().await? {
        println!("{}", format_tunnel(&tunnel));
        println!("---------");
    }
    Ok(())
}

async fn run_notify(
    action: NotifyAction,
    server: &str,
    secret: &str,
    client_id: Option<&str>,
    local_port: u16,
    remote_port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let cipher = ControlCipher::new(secret.as_bytes())?;
    let client_id = match client_id {
        Some(hex) => ClientId::from_hex(hex)?,
        None => ClientId::from_label(&hostname()),
    };
    let kind = match action {
        NotifyAction::Update => MessageType::Update,
        NotifyAction::Delete => MessageType::Delete,
    };
    let msg = ControlMessage {
        kind,
        client_id,
        local_port,
        remote_port,
    };

    let reply = control::client::send(server, &cipher, &msg, Duration::from_secs(15)).await?;
    println!("{} ({client_id})", reply.kind.as_str());
    if reply.kind == MessageType::ErrorNoTunnel {
        return Err("server reported error-no-tunnel".into());
    }
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
