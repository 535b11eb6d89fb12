//! AEAD sealing of control frames.
//!
//! Key: SHA-256 of the pre-shared secret. Frame: 12-byte random nonce
//! followed by the ChaCha20-Poly1305 ciphertext and 16-byte tag.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::message::{ControlMessage, MESSAGE_LEN};
use crate::error::ControlError;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Size of a sealed [`ControlMessage`] on the wire.
pub const FRAME_LEN: usize = NONCE_LEN + MESSAGE_LEN + TAG_LEN;

/// Secrets shorter than this are refused.
pub const MIN_SECRET_LEN: usize = 32;

/// Seals and opens control frames with a key derived from a shared secret.
#[derive(Clone)]
pub struct ControlCipher {
    aead: ChaCha20Poly1305,
}

impl ControlCipher {
    pub fn new(secret: &[u8]) -> Result<Self, ControlError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(ControlError::KeyTooShort {
                min: MIN_SECRET_LEN,
                actual: secret.len(),
            });
        }
        let digest = Sha256::digest(secret);
        Ok(Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&digest)),
        })
    }

    pub fn seal(&self, msg: &ControlMessage) -> Result<Vec<u8>, ControlError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), msg.encode().as_slice())
            .map_err(|_| ControlError::Crypto)?;

        let mut frame = Vec::with_capacity(FRAME_LEN);
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Authenticate, decrypt and decode one frame.
    pub fn open(&self, frame: &[u8]) -> Result<ControlMessage, ControlError> {
        if frame.len() != FRAME_LEN {
            return Err(ControlError::Malformed {
                expected: FRAME_LEN,
                actual: frame.len(),
            });
        }
        let (nonce, ciphertext) = frame.split_at(NONCE_LEN);
        let plain = self
            .aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ControlError::Crypto)?;
        ControlMessage::decode(&plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::message::{ClientId, MessageType, CLIENT_ID_LEN};

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn msg() -> ControlMessage {
        ControlMessage {
            kind: MessageType::Delete,
            client_id: ClientId([7; CLIENT_ID_LEN]),
            local_port: 2222,
            remote_port: 22,
        }
    }

    #[test]
    fn test_seal_open() {
        let cipher = ControlCipher::new(SECRET).unwrap();
        let frame = cipher.seal(&msg()).unwrap();
        assert_eq!(frame.len(), FRAME_LEN);
        assert_eq!(cipher.open(&frame).unwrap(), msg());
    }

    #[test]
    fn test_nonces_differ() {
        let cipher = ControlCipher::new(SECRET).unwrap();
        let a = cipher.seal(&msg()).unwrap();
        let b = cipher.seal(&msg()).unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let cipher = ControlCipher::new(SECRET).unwrap();
        let mut frame = cipher.seal(&msg()).unwrap();
        frame[NONCE_LEN + 3] ^= 0x01;
        assert!(matches!(cipher.open(&frame), Err(ControlError::Crypto)));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = ControlCipher::new(SECRET).unwrap().seal(&msg()).unwrap();
        let other = ControlCipher::new(b"ffffffffffffffffffffffffffffffff").unwrap();
        assert!(matches!(other.open(&sealed), Err(ControlError::Crypto)));
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(matches!(
            ControlCipher::new(b"too-short"),
            Err(ControlError::KeyTooShort { min: 32, actual: 9 })
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let cipher = ControlCipher::new(SECRET).unwrap();
        let frame = cipher.seal(&msg()).unwrap();
        assert!(matches!(
            cipher.open(&frame[..FRAME_LEN - 1]),
            Err(ControlError::Malformed { .. })
        ));
    }
}
