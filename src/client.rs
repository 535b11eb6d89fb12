//! HTTP client for the ip6tun management API.
//!
//! [`ApiClient`] wraps `reqwest::Client` and provides typed methods for each
//! endpoint. It backs the `ip6tun client` subcommand.
//!
//! ## Error handling
//!
//! Non-2xx responses are parsed for an `error` field in the JSON body. If
//! parsing fails, the raw response body is returned as the error message.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;

use crate::auth::AUTH_HEADER;
use crate::routes::tunnels::TunnelRequest;
use crate::tunnel::TunnelInfo;

/// Errors from [`ApiClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP transport error (connection refused, timeout, TLS failure, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The server returned an unexpected HTTP status.
    #[error("Server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },
    /// The response body did not match the expected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Client for one ip6tun server.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ApiClient {
    /// Create a client for the server at `base_url` (e.g.
    /// `https://tun.example.org:8080`). `insecure` accepts self-signed
    /// certificates.
    pub fn new(base_url: &str, api_key: String, insecure: bool) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(90))
            .danger_accept_invalid_certs(insecure)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /`
    pub async fn list(&self) -> Result<Vec<TunnelInfo>, ClientError> {
        self.send(Method::GET, "", None, StatusCode::OK).await
    }

    /// `GET /{id}`
    pub async fn get(&self, id: u32) -> Result<TunnelInfo, ClientError> {
        self.send(Method::GET, &id.to_string(), None, StatusCode::OK)
            .await
    }

    /// `POST /` — the server relays `local_port` back to this host's
    /// `remote_port`.
    pub async fn create(
        &self,
        name: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<TunnelInfo, ClientError> {
        let body = TunnelRequest {
            name: name.to_string(),
            local_port,
            remote_port,
        };
        self.send(Method::POST, "", Some(&body), StatusCode::CREATED)
            .await
    }

    /// `PUT /{id}` — point the tunnel back at this host.
    pub async fn update(
        &self,
        id: u32,
        name: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<TunnelInfo, ClientError> {
        let body = TunnelRequest {
            name: name.to_string(),
            local_port,
            remote_port,
        };
        self.send(Method::PUT, &id.to_string(), Some(&body), StatusCode::OK)
            .await
    }

    /// `DELETE /{id}`
    pub async fn delete(&self, id: u32) -> Result<(), ClientError> {
        let resp = self.request(Method::DELETE, &id.to_string(), None).await?;
        Self::check_status(resp, StatusCode::NO_CONTENT).await?;
        Ok(())
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&TunnelRequest>,
        expected: StatusCode,
    ) -> Result<T, ClientError> {
        let resp = self.request(method, path, body).await?;
        let text = Self::check_status(resp, expected).await?;
        serde_json::from_str(&text)
            .map_err(|e| ClientError::Protocol(format!("Invalid JSON from server: {e}")))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&TunnelRequest>,
    ) -> Result<reqwest::Response, ClientError> {
        let mut req = self
            .http
            .request(method, format!("{}/{path}", self.base_url))
            .header(AUTH_HEADER, &self.api_key);
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }

    /// Return the body if the status matches, otherwise a
    /// [`ClientError::Server`] carrying the server's `error` message.
    async fn check_status(
        resp: reqwest::Response,
        expected: StatusCode,
    ) -> Result<String, ClientError> {
        let status = resp.status();
        let body = resp.text().await?;
        if status == expected {
            return Ok(body);
        }
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v["error"].as_str().map(String::from))
            .unwrap_or(body);
        Err(ClientError::Server {
            status: status.as_u16(),
            message,
        })
    }
}

/// Render a tunnel and its activity log for the terminal.
pub fn format_tunnel(t: &TunnelInfo) -> String {
    let mut out = format!(
        "#{} {} :{} -> {}:{} (sessions: {}, created {})",
        t.id,
        t.name,
        t.local_port,
        t.remote_host,
        t.remote_port,
        t.active_sessions,
        t.created_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    );
    for line in &t.message_log {
        out.push_str("\n    ");
        out.push_str(line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_base_url_trailing_slash() {
        let c = ApiClient::new("https://localhost:8080/", "k".into(), true).unwrap();
        assert_eq!(c.base_url(), "https://localhost:8080");
    }

    #[test]
    fn test_format_tunnel() {
        let info = TunnelInfo {
            id: 3,
            name: "web".into(),
            local_port: 9000,
            remote_host: "2001:db8::1".into(),
            remote_port: 8443,
            message_log: vec!["[2026-01-01T00:00:00Z] Tunnel started".into()],
            created_at: Utc::now(),
            updated_at: None,
            last_activity_at: Utc::now(),
            active_sessions: 0,
        };
        let text = format_tunnel(&info);
        assert!(text.starts_with("#3 web :9000 -> 2001:db8::1:8443"));
        assert!(text.contains("\n    [2026-01-01T00:00:00Z] Tunnel started"));
    }
}
