//! Wire codec: framing, serialization, optional compression.
//!
//! Every record on the stream is a length-prefixed MessagePack map:
//!
//! ```text
//! ┌────────────┬──────────────────────────────┐
//! │ Length     │ Body                         │
//! │ 4 bytes BE │ msgpack, DEFLATE if enabled  │
//! └────────────┴──────────────────────────────┘
//! ```
//!
//! Records are serialized with `rmp_serde::to_vec_named` so struct fields
//! travel as named map entries, keeping the format self-describing for
//! servers in other languages. Compression is raw DEFLATE applied per
//! record; both ends agree on it through the one-byte connection
//! handshake.
//!
//! The [`Encoder`] accumulates frames in memory and spills to the stream
//! when the buffer reaches its capacity; `flush` drains the buffer and
//! flushes the stream. The [`Decoder`] reads through a `BufReader` and
//! rejects frames larger than its cap before allocating for them.

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{WireError, WireResult};
use crate::stats::ConnStats;

/// Handshake byte requesting per-record compression.
pub const HANDSHAKE_COMPRESSION_ON: u8 = 1;
/// Handshake byte requesting plain records.
pub const HANDSHAKE_COMPRESSION_OFF: u8 = 0;

/// Length prefix size in bytes.
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Largest accepted frame body (1 GiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1_073_741_824;

/// Request record. `id == 0` marks fire-and-forget; the server must not
/// respond to it.
#[derive(Debug, Serialize, Deserialize)]
pub struct WireRequest<T> {
    pub id: u64,
    pub request: T,
}

/// Response record. An empty `error` means success; `response` may be
/// absent on errors.
#[derive(Debug, Serialize, Deserialize)]
pub struct WireResponse<T> {
    pub id: u64,
    #[serde(default)]
    pub response: Option<T>,
    #[serde(default)]
    pub error: String,
}

fn compress(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = DeflateEncoder::new(
        Vec::with_capacity(body.len() / 2 + 16),
        Compression::fast(),
    );
    enc.write_all(body)?;
    enc.finish()
}

fn decompress(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len().saturating_mul(2));
    DeflateDecoder::new(body).read_to_end(&mut out)?;
    Ok(out)
}

/// Buffered record writer.
pub struct Encoder<W> {
    writer: W,
    buf: BytesMut,
    capacity: usize,
    compressed: bool,
    stats: Arc<ConnStats>,
}

impl<W: AsyncWrite + Unpin> Encoder<W> {
    /// `capacity` is the spill threshold (the `send_buffer_size` of the
    /// connection).
    pub fn new(writer: W, capacity: usize, compressed: bool, stats: Arc<ConnStats>) -> Self {
        Self {
            writer,
            buf: BytesMut::with_capacity(capacity + FRAME_PREFIX_SIZE),
            capacity,
            compressed,
            stats,
        }
    }

    /// Serialize one record into the buffer, spilling to the stream when
    /// the buffer is full. Does not flush the stream.
    pub async fn encode<T: Serialize>(&mut self, record: &T) -> WireResult<()> {
        let body = rmp_serde::to_vec_named(record)?;
        let body = if self.compressed {
            compress(&body).map_err(WireError::Io)?
        } else {
            body
        };

        self.buf.put_u32(body.len() as u32);
        self.buf.extend_from_slice(&body);

        if self.buf.len() >= self.capacity {
            self.spill().await?;
        }
        Ok(())
    }

    /// Write out buffered frames and flush the underlying stream.
    pub async fn flush(&mut self) -> WireResult<()> {
        self.spill().await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn spill(&mut self) -> WireResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.writer.write_all(&self.buf).await?;
        self.stats.add_write(self.buf.len() as u64);
        self.buf.clear();
        Ok(())
    }
}

/// Buffered record reader.
pub struct Decoder<R> {
    reader: BufReader<R>,
    compressed: bool,
    max_frame: u32,
    stats: Arc<ConnStats>,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    /// `capacity` sizes the read buffer (the `recv_buffer_size` of the
    /// connection).
    pub fn new(reader: R, capacity: usize, compressed: bool, stats: Arc<ConnStats>) -> Self {
        Self {
            reader: BufReader::with_capacity(capacity, reader),
            compressed,
            max_frame: DEFAULT_MAX_FRAME_SIZE,
            stats,
        }
    }

    /// Lower the accepted frame-body cap.
    pub fn with_max_frame_size(mut self, max_frame: u32) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Read the next record. EOF surfaces as an I/O error.
    pub async fn decode<T: DeserializeOwned>(&mut self) -> WireResult<T> {
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        self.reader.read_exact(&mut prefix).await?;
        let len = u32::from_be_bytes(prefix);
        if len > self.max_frame {
            return Err(WireError::FrameTooLarge {
                len: len as u64,
                max: self.max_frame as u64,
            });
        }

        let mut body = vec![0u8; len as usize];
        self.reader.read_exact(&mut body).await?;
        self.stats.add_read((FRAME_PREFIX_SIZE + body.len()) as u64);

        let body = if self.compressed {
            decompress(&body).map_err(WireError::Corrupt)?
        } else {
            body
        };
        Ok(rmp_serde::from_slice(&body)?)
    }
}
