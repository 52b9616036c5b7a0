//! Packet codec for the relay port.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: body length (little-endian u32)
//! - N bytes: MessagePack-encoded [`Envelope`]
//!
//! Decoding never panics on hostile input. A declared length larger than
//! the cap or than the bytes available yields
//! [`ProtocolError::MalformedLength`]; a body that is not an envelope yields
//! [`ProtocolError::MalformedPayload`]. Either way the caller drops the
//! connection.

use std::sync::atomic::{AtomicI64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};
use crate::messages::Envelope;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum envelope body size (10 MiB).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

static SEQUENCE: AtomicI64 = AtomicI64::new(1);

/// Next value of the process-wide sequence counter.
///
/// Ids are positive and strictly increasing within a process; the counter is
/// 63 bits wide, so wrap-around is not a practical concern.
pub fn next_sequence_id() -> i64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed) & i64::MAX
}

/// Encoder and decoder for length-prefixed envelopes.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_frame_size: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec {
    /// Create a codec with the default 10 MiB cap.
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom body size cap.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// The body size cap in bytes.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode an envelope into a length-prefixed frame.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let body = envelope.to_msgpack()?;
        if body.len() > self.max_frame_size {
            return Err(ProtocolError::MalformedLength {
                declared: body.len() as u64,
                limit: self.max_frame_size as u64,
            });
        }

        let mut output = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
        output.extend_from_slice(&(body.len() as u32).to_le_bytes());
        output.extend_from_slice(&body);
        Ok(output)
    }

    /// Decode one envelope from the front of `data`.
    ///
    /// Returns the envelope and the number of bytes consumed.
    pub fn decode(&self, data: &[u8]) -> Result<(Envelope, usize)> {
        let declared = self.declared_length(data)?;
        let available = data.len() - LENGTH_PREFIX_SIZE;
        if declared > available {
            return Err(ProtocolError::MalformedLength {
                declared: declared as u64,
                limit: available as u64,
            });
        }

        let end = LENGTH_PREFIX_SIZE + declared;
        let envelope = Envelope::from_msgpack(&data[LENGTH_PREFIX_SIZE..end])?;
        Ok((envelope, end))
    }

    /// Try to decode a frame, returning None if more bytes are needed.
    ///
    /// Oversized declarations still fail immediately.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Envelope, usize)>> {
        if data.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let declared = self.declared_length(data)?;
        if data.len() < LENGTH_PREFIX_SIZE + declared {
            return Ok(None);
        }
        self.decode(data).map(Some)
    }

    /// Read exactly one frame from a byte stream.
    ///
    /// A stream that ends before the prefix or body is complete is reported
    /// as [`ProtocolError::ConnectionClosed`].
    pub async fn read_envelope<R>(&self, reader: &mut R) -> Result<Envelope>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        reader.read_exact(&mut prefix).await?;
        let declared = u32::from_le_bytes(prefix) as usize;
        if declared > self.max_frame_size {
            return Err(ProtocolError::MalformedLength {
                declared: declared as u64,
                limit: self.max_frame_size as u64,
            });
        }

        let mut body = vec![0u8; declared];
        reader.read_exact(&mut body).await?;
        Envelope::from_msgpack(&body)
    }

    /// Write one frame to a byte stream and flush it.
    pub async fn write_envelope<W>(&self, writer: &mut W, envelope: &Envelope) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let frame = self.encode(envelope)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    fn declared_length(&self, data: &[u8]) -> Result<usize> {
        let Some(prefix) = data.get(..LENGTH_PREFIX_SIZE) else {
            return Err(ProtocolError::MalformedLength {
                declared: LENGTH_PREFIX_SIZE as u64,
                limit: data.len() as u64,
            });
        };
        let mut bytes = [0u8; LENGTH_PREFIX_SIZE];
        bytes.copy_from_slice(prefix);
        let declared = u32::from_le_bytes(bytes) as usize;
        if declared > self.max_frame_size {
            return Err(ProtocolError::MalformedLength {
                declared: declared as u64,
                limit: self.max_frame_size as u64,
            });
        }
        Ok(declared)
    }
}
