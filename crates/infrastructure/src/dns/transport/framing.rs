//! Message framing (RFC 1035 §4.2)
//!
//! Datagrams carry exactly one message. Streams prefix every message with its
//! length as a 2-byte big-endian integer.

use crate::dns::codec::DNS_HEADER_LEN;
use bytes::{BufMut, BytesMut};
use ferrous_upstream_domain::DomainError;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest datagram a UDP socket may deliver.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Writes prefix and payload with a single `write_all` so a frame is never
/// split across two writer turns.
pub(crate) async fn write_frame<S>(
    stream: &mut S,
    payload: &[u8],
    server: &str,
) -> Result<(), DomainError>
where
    S: AsyncWrite + Unpin,
{
    let length = u16::try_from(payload.len()).map_err(|_| {
        DomainError::InvalidDnsMessage(format!(
            "Message too large for stream framing: {} bytes",
            payload.len()
        ))
    })?;

    let mut frame = BytesMut::with_capacity(payload.len() + 2);
    frame.put_u16(length);
    frame.put_slice(payload);

    stream
        .write_all(&frame)
        .await
        .map_err(|e| DomainError::TransportWriteFailed {
            server: server.to_string(),
            reason: e.to_string(),
        })?;
    stream
        .flush()
        .await
        .map_err(|e| DomainError::TransportWriteFailed {
            server: server.to_string(),
            reason: format!("flush: {}", e),
        })?;

    Ok(())
}

/// Reads one complete frame. EOF on a frame boundary is a clean close;
/// EOF inside a frame is a framing violation.
pub(crate) async fn read_frame<S>(stream: &mut S, server: &str) -> Result<Vec<u8>, DomainError>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            DomainError::TransportConnectionClosed {
                server: server.to_string(),
            }
        } else {
            DomainError::TransportReadFailed {
                server: server.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    let frame_len = u16::from_be_bytes(len_buf) as usize;
    if frame_len < DNS_HEADER_LEN {
        return Err(DomainError::MalformedFrame {
            server: server.to_string(),
            reason: format!("frame of {} bytes is shorter than a DNS header", frame_len),
        });
    }

    let mut frame = vec![0u8; frame_len];
    stream.read_exact(&mut frame).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            DomainError::MalformedFrame {
                server: server.to_string(),
                reason: format!("stream ended inside a {} byte frame", frame_len),
            }
        } else {
            DomainError::TransportReadFailed {
                server: server.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    Ok(frame)
}
