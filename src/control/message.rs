//! Fixed-layout control message.
//!
//! ```text
//! offset  size  field
//!      0     1  type (0 update, 1 delete, 2 acknowledge, 3 error-no-tunnel)
//!      1    32  client id
//!     33     2  local port  (big-endian)
//!     35     2  remote port (big-endian)
//! ```

use std::fmt;

use crate::error::ControlError;

/// Encoded size of a [`ControlMessage`].
pub const MESSAGE_LEN: usize = 37;

/// Size of a client identifier.
pub const CLIENT_ID_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Create or refresh the sender's mapping.
    Update = 0,
    /// Remove the sender's mapping.
    Delete = 1,
    /// Server reply: request applied.
    Acknowledge = 2,
    /// Server reply: no tunnel could be provisioned or found.
    ErrorNoTunnel = 3,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Acknowledge => "acknowledge",
            Self::ErrorNoTunnel => "error-no-tunnel",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ControlError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0 => Ok(Self::Update),
            1 => Ok(Self::Delete),
            2 => Ok(Self::Acknowledge),
            3 => Ok(Self::ErrorNoTunnel),
            other => Err(ControlError::UnknownType(other)),
        }
    }
}

/// Opaque 32-byte client identifier, displayed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub [u8; CLIENT_ID_LEN]);

impl ClientId {
    /// Parse 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut id = [0u8; CLIENT_ID_LEN];
        hex::decode_to_slice(s.trim(), &mut id)?;
        Ok(Self(id))
    }

    /// Derive an id from an arbitrary label (SHA-256 of the label).
    pub fn from_label(label: &str) -> Self {
        use sha2::{Digest, Sha256};
        Self(Sha256::digest(label.as_bytes()).into())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    pub kind: MessageType,
    pub client_id: ClientId,
    pub local_port: u16,
    pub remote_port: u16,
}

impl ControlMessage {
    pub fn encode(&self) -> [u8; MESSAGE_LEN] {
        let mut buf = [0u8; MESSAGE_LEN];
        buf[0] = self.kind as u8;
        buf[1..33].copy_from_slice(&self.client_id.0);
        buf[33..35].copy_from_slice(&self.local_port.to_be_bytes());
        buf[35..37].copy_from_slice(&self.remote_port.to_be_bytes());
        buf
    }

    /// Decode exactly [`MESSAGE_LEN`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        if buf.len() != MESSAGE_LEN {
            return Err(ControlError::Malformed {
                expected: MESSAGE_LEN,
                actual: buf.len(),
            });
        }
        let kind = MessageType::try_from(buf[0])?;
        let mut id = [0u8; CLIENT_ID_LEN];
        id.copy_from_slice(&buf[1..33]);
        Ok(Self {
            kind,
            client_id: ClientId(id),
            local_port: u16::from_be_bytes([buf[33], buf[34]]),
            remote_port: u16::from_be_bytes([buf[35], buf[36]]),
        })
    }

    /// Same message with a different type; replies echo the request this way.
    pub fn reply(&self, kind: MessageType) -> Self {
        Self { kind, ..*self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ControlMessage {
        ControlMessage {
            kind: MessageType::Update,
            client_id: ClientId([0xab; CLIENT_ID_LEN]),
            local_port: 0x1f90,
            remote_port: 443,
        }
    }

    #[test]
    fn test_wire_layout() {
        let buf = sample().encode();
        assert_eq!(buf.len(), MESSAGE_LEN);
        assert_eq!(buf[0], 0);
        assert!(buf[1..33].iter().all(|b| *b == 0xab));
        assert_eq!(&buf[33..35], &[0x1f, 0x90]);
        assert_eq!(&buf[35..37], &[0x01, 0xbb]);
        assert_eq!(ControlMessage::decode(&buf).unwrap(), sample());
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let buf = sample().encode();
        assert!(matches!(
            ControlMessage::decode(&buf[..36]),
            Err(ControlError::Malformed { expected: 37, actual: 36 })
        ));
        let mut long = buf.to_vec();
        long.push(0);
        assert!(ControlMessage::decode(&long).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut buf = sample().encode();
        buf[0] = 9;
        assert!(matches!(
            ControlMessage::decode(&buf),
            Err(ControlError::UnknownType(9))
        ));
    }

    #[test]
    fn test_reply_keeps_payload() {
        let reply = sample().reply(MessageType::ErrorNoTunnel);
        assert_eq!(reply.kind, MessageType::ErrorNoTunnel);
        assert_eq!(reply.client_id, sample().client_id);
        assert_eq!(reply.remote_port, 443);
    }

    #[test]
    fn test_client_id_hex() {
        let id = ClientId([0x01; CLIENT_ID_LEN]);
        let text = id.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(ClientId::from_hex(&text).unwrap(), id);
        assert!(ClientId::from_hex("abcd").is_err());
        assert_ne!(ClientId::from_label("a"), ClientId::from_label("b"));
    }
}
