//! Broker wire protocol for the TCP adapter
//!
//! Every frame is a bincode-encoded [`Frame`] preceded by a 4-byte big-endian
//! length prefix.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::qos::QoS;

/// Largest frame either side accepts
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Connect {
        session_id: String,
        username: Option<String>,
        password: Option<String>,
    },
    ConnAck {
        accepted: bool,
        reason: Option<String>,
    },
    Subscribe {
        packet_id: u32,
        filter: String,
        qos: QoS,
    },
    SubAck {
        packet_id: u32,
        result: std::result::Result<(), String>,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
    },
    Disconnect,
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Codec(e.to_string()))
    }
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.encode()?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(Error::InvalidFrame(format!(
            "Message too large: {} bytes",
            bytes.len()
        )));
    }

    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
///
/// A clean end of stream is reported as [`Error::ConnectionClosed`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await.map_err(eof_as_closed)? as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::InvalidFrame(format!(
            "Message too large: {} bytes",
            len
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(eof_as_closed)?;
    Frame::decode(&buf)
}

fn eof_as_closed(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        e.into()
    }
}
