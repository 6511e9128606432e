//! Frame codec.
//!
//! Every packet travels as one frame: a 4-byte big-endian length header
//! followed by the packet's JSON body.

use remora_types::{Packet, RemotingError, RemotingResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Encode a packet to bytes (4-byte big-endian length + JSON).
pub fn encode_packet(packet: &Packet) -> RemotingResult<Vec<u8>> {
    let json = serde_json::to_vec(packet)?;
    let len = u32::try_from(json.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or(RemotingError::MessageTooLarge {
            size: u32::try_from(json.len()).unwrap_or(u32::MAX),
            max: MAX_FRAME_SIZE,
        })?;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a packet.
pub fn decode_packet(body: &[u8]) -> RemotingResult<Packet> {
    Ok(serde_json::from_slice(body)?)
}

/// Write one framed packet. The caller serializes concurrent writers.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> RemotingResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode_packet(packet)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed packet. A clean EOF before the header maps to
/// [`RemotingError::ConnectionClosed`].
pub async fn read_packet<R>(reader: &mut R) -> RemotingResult<Packet>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(RemotingError::ConnectionClosed);
        }
        Err(e) => return Err(RemotingError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_FRAME_SIZE {
        return Err(RemotingError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    decode_packet(&body)
}
