//! Length-prefixed framing for [`WireMessage`]s.
//!
//! ```text
//! [u32 BE: frame len][u32 BE: header len][header JSON][body]
//! ```
//!
//! The frame length covers everything after itself. The header is a JSON
//! object of string values.

use super::WireMessage;
use crate::config::TransportConfig;
use crate::{DodoError, Result};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one message from an async reader.
///
/// Returns `None` on clean EOF (peer closed the connection between frames).
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<WireMessage>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(DodoError::FrameTooLarge {
            size: len,
            max: TransportConfig::MAX_FRAME_SIZE,
        });
    }
    if len < 4 {
        return Err(DodoError::Recv {
            message: format!("frame of {} bytes is shorter than its header prefix", len),
        });
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;

    let header_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if header_len > len - 4 {
        return Err(DodoError::Recv {
            message: format!(
                "header length {} exceeds frame payload {}",
                header_len,
                len - 4
            ),
        });
    }

    let header: HashMap<String, String> = serde_json::from_slice(&frame[4..4 + header_len])
        .map_err(|e| DodoError::Recv {
            message: format!("invalid frame header: {}", e),
        })?;
    let body = frame.split_off(4 + header_len);

    Ok(Some(WireMessage { header, body }))
}

/// Fail with [`DodoError::FrameTooLarge`] unless `msg` fits in one frame.
///
/// Lets callers reject a message before it touches a connection.
pub fn check_frame(msg: &WireMessage) -> Result<()> {
    let header = serde_json::to_vec(&msg.header)?;
    check_len(4 + header.len() + msg.body.len())
}

fn check_len(len: usize) -> Result<()> {
    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(DodoError::FrameTooLarge {
            size: len,
            max: TransportConfig::MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Write one message to an async writer and flush it.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &WireMessage) -> Result<()> {
    let header = serde_json::to_vec(&msg.header)?;
    let len = 4 + header.len() + msg.body.len();
    check_len(len)?;

    let mut frame = Vec::with_capacity(4 + len);
    frame.extend_from_slice(&(len as u32).to_be_bytes());
    frame.extend_from_slice(&(header.len() as u32).to_be_bytes());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&msg.body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
