//! TCP wire format.
//!
//! ```text
//! HANDSHAKE (client -> server):
//!   [2 bytes BE: identity_len]
//!   [identity_len bytes: identity UTF-8]
//!
//! PER MESSAGE (either direction):
//!   [2 bytes BE: message type tag]
//!   [4 bytes BE: payload_len]
//!   [payload_len bytes: payload]
//! ```

use assetcache_protocol::{Message, MessageType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{MAX_PAYLOAD_SIZE, TransportError};

/// Writes the identity handshake.
pub async fn write_identity<W: AsyncWrite + Unpin>(
    writer: &mut W,
    identity: &str,
) -> Result<(), TransportError> {
    let bytes = identity.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(TransportError::Protocol(format!(
            "identity too long: {} bytes (max {})",
            bytes.len(),
            u16::MAX
        )));
    }
    writer.write_u16(bytes.len() as u16).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the identity handshake.
pub async fn read_identity<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, TransportError> {
    let len = reader.read_u16().await?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|e| TransportError::Protocol(format!("invalid identity encoding: {e}")))
}

/// Writes one framed message. Does not flush.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), TransportError> {
    if msg.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(TransportError::Protocol(format!(
            "payload too large: {} bytes (max {MAX_PAYLOAD_SIZE})",
            msg.payload.len()
        )));
    }
    writer.write_u16(msg.msg_type.as_u16()).await?;
    writer.write_u32(msg.payload.len() as u32).await?;
    writer.write_all(&msg.payload).await?;
    Ok(())
}

/// Reads one framed message.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, TransportError> {
    let tag = reader.read_u16().await?;
    let msg_type = MessageType::try_from(tag)?;

    let len = reader.read_u32().await? as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(TransportError::Protocol(format!(
            "payload too large: {len} bytes (max {MAX_PAYLOAD_SIZE})"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Message::new(msg_type, payload))
}
