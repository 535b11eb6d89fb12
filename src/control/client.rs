//! Sending side of the control protocol.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::cipher::{ControlCipher, FRAME_LEN};
use super::message::ControlMessage;
use crate::error::ControlError;

/// Send `msg` to the control server at `addr` and wait for its reply. The
/// whole exchange is bounded by `timeout`.
pub async fn send(
    addr: &str,
    cipher: &ControlCipher,
    msg: &ControlMessage,
    timeout: Duration,
) -> Result<ControlMessage, ControlError> {
    tokio::time::timeout(timeout, exchange(addr, cipher, msg))
        .await
        .map_err(|_| ControlError::Timeout)?
}

async fn exchange(
    addr: &str,
    cipher: &ControlCipher,
    msg: &ControlMessage,
) -> Result<ControlMessage, ControlError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&cipher.seal(msg)?).await?;

    let mut frame = [0u8; FRAME_LEN];
    stream.read_exact(&mut frame).await?;
    cipher.open(&frame)
}
