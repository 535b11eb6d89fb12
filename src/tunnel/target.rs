//! Remote endpoint validation.

use std::fmt;
use std::net::IpAddr;

use crate::error::BrokerError;

/// A validated relay target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    host: String,
    port: u16,
}

impl RemoteTarget {
    /// Validate a host/port pair.
    ///
    /// The host may be an IPv4 or IPv6 literal (IPv6 optionally wrapped in
    /// brackets) or a DNS name. Port 0 is rejected.
    pub fn parse(host: &str, port: u16) -> Result<Self, BrokerError> {
        if port == 0 {
            return Err(BrokerError::InvalidTarget(
                "remote port must be between 1 and 65535".to_string(),
            ));
        }

        let trimmed = host.trim();
        let unbracketed = trimmed
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(trimmed);

        if let Ok(ip) = unbracketed.parse::<IpAddr>() {
            return Ok(Self {
                host: ip.to_canonical().to_string(),
                port,
            });
        }

        if unbracketed.len() != trimmed.len() || !is_valid_hostname(unbracketed) {
            return Err(BrokerError::InvalidTarget(format!(
                "'{host}' is not an IP address or hostname"
            )));
        }

        Ok(Self {
            host: unbracketed.to_ascii_lowercase(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the host is an IPv6 literal.
    pub fn is_ipv6(&self) -> bool {
        matches!(self.host.parse::<IpAddr>(), Ok(IpAddr::V6(_)))
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// RFC 1123 hostname syntax: dot-separated labels of 1..=63 alphanumerics
/// and inner hyphens, 253 chars max. A single trailing dot is allowed.
fn is_valid_hostname(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}
