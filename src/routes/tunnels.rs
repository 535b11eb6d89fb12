//! Tunnel CRUD handlers.
//!
//! The remote host of a tunnel is never taken from the request body: it is
//! the address the request came from, so a caller can only ever point a
//! tunnel back at itself.

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::BrokerError;
use crate::state::AppState;
use crate::tunnel::TunnelInfo;

type ApiError = (StatusCode, Json<Value>);

/// Body of `POST /` and `PUT /{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub local_port: u16,
    #[serde(default)]
    pub remote_port: u16,
}

impl TunnelRequest {
    /// Name must be non-empty and both ports in `1..=65535`.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name may not be empty".to_string());
        }
        if self.local_port == 0 {
            return Err("local_port must be between 1 and 65535".to_string());
        }
        if self.remote_port == 0 {
            return Err("remote_port must be between 1 and 65535".to_string());
        }
        Ok(())
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.into(), "code": "INVALID_REQUEST"})),
    )
}

fn not_found(id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("Tunnel {id} not found"), "code": "TUNNEL_NOT_FOUND"})),
    )
}

fn broker_error(e: &BrokerError) -> ApiError {
    let status = match e {
        BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
        BrokerError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        BrokerError::BindFailed { .. }
        | BrokerError::InvalidTarget(_)
        | BrokerError::InvalidName => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({"error": e.to_string(), "code": e.code()})))
}

/// Decode and validate a request body. Every failure is a 400.
fn read_request(body: Result<Json<TunnelRequest>, JsonRejection>) -> Result<TunnelRequest, ApiError> {
    let Json(req) = body.map_err(|e| bad_request(e.body_text()))?;
    req.validate().map_err(bad_request)?;
    Ok(req)
}

/// Ids that do not parse can never exist.
fn parse_id(raw: &str) -> Result<u32, ApiError> {
    raw.parse().map_err(|_| not_found(raw))
}

/// The caller's address as a relay host. IPv4-mapped IPv6 peers (seen on
/// dual-stack listeners) become plain IPv4.
fn caller_host(peer: SocketAddr) -> String {
    let ip: IpAddr = peer.ip().to_canonical();
    ip.to_string()
}

/// `GET /` — all tunnels, ordered by id.
pub async fn list(State(state): State<AppState>) -> Json<Vec<TunnelInfo>> {
    let tunnels = state.broker.list().await;
    let mut out = Vec::with_capacity(tunnels.len());
    for tunnel in tunnels {
        out.push(tunnel.info().await);
    }
    Json(out)
}

/// `GET /{id}`
pub async fn view(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TunnelInfo>, ApiError> {
    let id = parse_id(&id)?;
    let tunnel = state.broker.get(id).await.map_err(|e| broker_error(&e))?;
    Ok(Json(tunnel.info().await))
}

/// `POST /` — create a tunnel from `local_port` to the caller's
/// `remote_port`.
pub async fn create(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Result<Json<TunnelRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TunnelInfo>), ApiError> {
    let req = read_request(body)?;
    let host = caller_host(peer);

    let tunnel = state
        .broker
        .add(&req.name, &host, req.remote_port, req.local_port)
        .await
        .map_err(|e| broker_error(&e))?;

    info!(tunnel_id = tunnel.id(), peer = %peer, "Tunnel created via API");
    Ok((StatusCode::CREATED, Json(tunnel.info().await)))
}

/// `PUT /{id}` — retarget a tunnel at the caller's `remote_port`. The
/// tunnel's name and local port are immutable; those body fields are only
/// validated.
pub async fn update(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    body: Result<Json<TunnelRequest>, JsonRejection>,
) -> Result<Json<TunnelInfo>, ApiError> {
    let req = read_request(body)?;
    let id = parse_id(&id)?;
    let host = caller_host(peer);

    let tunnel = state
        .broker
        .update(id, &host, req.remote_port)
        .await
        .map_err(|e| broker_error(&e))?;
    Ok(Json(tunnel.info().await))
}

/// `DELETE /{id}` — returns once the tunnel has fully drained.
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state
        .broker
        .delete(id)
        .await
        .map_err(|e| broker_error(&e))?;
    Ok(StatusCode::NO_CONTENT)
}
