//! Wire framing.
//!
//! Each frame is `magic:u32 || kind:u8 || length:u32 || checksum:u32 ||
//! payload`, integers little-endian, where `magic` identifies the network
//! and `checksum` is the first four bytes of double SHA-256 over the
//! payload. Oversized lengths are rejected before any allocation; a bad
//! magic, checksum, or unknown kind fails the frame without touching the
//! payload decoder.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use tally_core::crypto::double_sha256;
use tally_core::error::NetworkError;

use crate::message::{Message, MessageKind, MAX_MESSAGE_SIZE};

/// Frame header length: magic + kind + length + checksum.
pub const FRAME_HEADER_LEN: usize = 4 + 1 + 4 + 4;

/// First four bytes of the payload's double hash.
fn payload_checksum(payload: &[u8]) -> u32 {
    let digest = double_sha256(payload);
    u32::from_le_bytes(digest.0[..4].try_into().expect("digest is 32 bytes"))
}

/// Encode a message into a complete frame.
pub fn encode_frame(magic: u32, message: &Message) -> Result<Vec<u8>, NetworkError> {
    let payload = message.encode_payload()?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&magic.to_le_bytes());
    frame.push(message.kind() as u8);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload_checksum(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a complete frame from a byte slice.
pub fn decode_frame(magic: u32, data: &[u8]) -> Result<Message, NetworkError> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(NetworkError::Serialization("frame too short".into()));
    }
    let got_magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if got_magic != magic {
        return Err(NetworkError::BadMagic);
    }
    let kind = MessageKind::from_u8(data[4]).ok_or(NetworkError::UnknownMessageKind(data[4]))?;
    let length = u32::from_le_bytes(data[5..9].try_into().unwrap()) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(NetworkError::MessageTooLarge { size: length, max: MAX_MESSAGE_SIZE });
    }
    let checksum = u32::from_le_bytes(data[9..13].try_into().unwrap());
    let payload = &data[FRAME_HEADER_LEN..];
    if payload.len() != length {
        return Err(NetworkError::Serialization("frame length mismatch".into()));
    }
    if payload_checksum(payload) != checksum {
        return Err(NetworkError::BadChecksum);
    }
    Message::decode_payload(kind, payload)
}

/// Read one frame from an async stream.
///
/// The length field is validated against [`MAX_MESSAGE_SIZE`] before the
/// payload buffer is allocated.
pub async fn read_frame<R>(reader: &mut R, magic: u32) -> Result<Message, NetworkError>
where
    R: AsyncRead + Unpin,
{
    read_frame_sized(reader, magic).await.map(|(message, _)| message)
}

/// Like [`read_frame`], also returning the total frame size in bytes
/// (header plus payload) for rate accounting.
pub async fn read_frame_sized<R>(
    reader: &mut R,
    magic: u32,
) -> Result<(Message, usize), NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| NetworkError::Io(e.to_string()))?;

    let got_magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if got_magic != magic {
        return Err(NetworkError::BadMagic);
    }
    let kind =
        MessageKind::from_u8(header[4]).ok_or(NetworkError::UnknownMessageKind(header[4]))?;
    let length = u32::from_le_bytes(header[5..9].try_into().unwrap()) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(NetworkError::MessageTooLarge { size: length, max: MAX_MESSAGE_SIZE });
    }
    let checksum = u32::from_le_bytes(header[9..13].try_into().unwrap());

    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| NetworkError::Io(e.to_string()))?;

    if payload_checksum(&payload) != checksum {
        return Err(NetworkError::BadChecksum);
    }
    let message = Message::decode_payload(kind, &payload)?;
    Ok((message, FRAME_HEADER_LEN + length))
}

/// Write one frame to an async stream.
pub async fn write_frame<W>(
    writer: &mut W,
    magic: u32,
    message: &Message,
) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(magic, message)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| NetworkError::Io(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| NetworkError::Io(e.to_string()))
}
