//! Framed wire codec
//!
//! Every message is serialized with bincode and validated with CRC32.
//!
//! Format: [message_type:1][length:4][payload:N][crc32:4]

use super::messages::{CopyRequest, CopyResponse};
use crate::{Error, Result, TransportErrorKind};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version exchanged in the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest payload accepted from the wire
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 5;
const CRC_LEN: usize = 4;

/// Frame type tags
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMessageType {
    /// Handshake from the connecting node
    Hello = 0x01,
    /// Handshake response
    Welcome = 0x02,
    /// Copy request
    Request = 0x10,
    /// Copy response
    Response = 0x20,
    /// Handler or transport level failure
    Failure = 0xFF,
}

impl TryFrom<u8> for CopyMessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Welcome),
            0x10 => Ok(Self::Request),
            0x20 => Ok(Self::Response),
            0xFF => Ok(Self::Failure),
            _ => Err(Error::protocol(format!("Unknown message type: {}", value))),
        }
    }
}

/// Failure classes a server reports instead of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Too many requests in flight
    Rejected,
    /// Memory budget exceeded
    CircuitBreaking,
    /// The handler itself failed
    Internal,
}

impl From<FailureKind> for TransportErrorKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Rejected => TransportErrorKind::Rejected,
            FailureKind::CircuitBreaking => TransportErrorKind::CircuitBreaking,
            FailureKind::Internal => TransportErrorKind::Remote,
        }
    }
}

/// Messages exchanged between copy peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyMessage {
    /// Opens a connection
    Hello {
        /// Connecting node
        node_id: String,
        /// Speaker's protocol version
        protocol_version: u32,
    },

    /// Accepts a connection
    Welcome {
        /// Accepting node
        node_id: String,
        /// Speaker's protocol version
        protocol_version: u32,
    },

    /// Copy request
    Request(CopyRequest),

    /// Copy response
    Response(CopyResponse),

    /// The request could not be handled
    Failure {
        /// Failure class
        kind: FailureKind,
        /// Detail
        message: String,
    },
}

impl CopyMessage {
    /// Get message type
    pub fn message_type(&self) -> CopyMessageType {
        match self {
            Self::Hello { .. } => CopyMessageType::Hello,
            Self::Welcome { .. } => CopyMessageType::Welcome,
            Self::Request(_) => CopyMessageType::Request,
            Self::Response(_) => CopyMessageType::Response,
            Self::Failure { .. } => CopyMessageType::Failure,
        }
    }

    /// Convert a failure frame into the matching transport error
    pub fn into_failure_error(self) -> Option<Error> {
        match self {
            Self::Failure { kind, message } => Some(Error::transport(kind.into(), message)),
            _ => None,
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::protocol(format!("Serialization failed: {}", e)))?;
        if payload.len() > MAX_FRAME_BYTES {
            return Err(Error::protocol(format!(
                "Frame of {} bytes exceeds limit of {}",
                payload.len(),
                MAX_FRAME_BYTES
            )));
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
        buf.push(self.message_type() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        // CRC32 of type + length + payload
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        Ok(buf)
    }

    /// Decode message from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN + CRC_LEN {
            return Err(Error::protocol("Message too short"));
        }

        let crc_offset = buf.len() - CRC_LEN;
        let stored_crc = read_u32(&buf[crc_offset..]);
        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();
        if stored_crc != computed_crc {
            return Err(Error::protocol(format!(
                "CRC mismatch: expected {:x}, got {:x}",
                stored_crc, computed_crc
            )));
        }

        let tag = CopyMessageType::try_from(buf[0])?;
        let length = read_u32(&buf[1..HEADER_LEN]) as usize;
        if buf.len() != HEADER_LEN + length + CRC_LEN {
            return Err(Error::protocol("Incomplete message"));
        }

        let message: Self = bincode::deserialize(&buf[HEADER_LEN..HEADER_LEN + length])
            .map_err(|e| Error::protocol(format!("Deserialization failed: {}", e)))?;
        if message.message_type() != tag {
            return Err(Error::protocol(format!(
                "Frame tagged {:?} carries {:?}",
                tag,
                message.message_type()
            )));
        }
        Ok(message)
    }

    /// Write message to async stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read message from async stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let length = read_u32(&header[1..]) as usize;
        if length > MAX_FRAME_BYTES {
            return Err(Error::protocol(format!(
                "Frame of {} bytes exceeds limit of {}",
                length, MAX_FRAME_BYTES
            )));
        }

        let mut full_buf = vec![0u8; HEADER_LEN + length + CRC_LEN];
        full_buf[..HEADER_LEN].copy_from_slice(&header);
        reader.read_exact(&mut full_buf[HEADER_LEN..]).await?;

        Self::decode(&full_buf)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}
