//! Length-prefixed message framing
//!
//! Wire format:  [4-byte big-endian length][JSON payload]
//!
//! The explicit length makes message boundaries unambiguous: a short read
//! always means "wait for more bytes", and a payload that fails to decode is
//! always a malformed frame, never a partial one.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

use super::Message;

/// Default upper bound for a single frame payload (64 MB)
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// A message serialized once, ready to be written to any number of peers
#[derive(Debug, Clone)]
pub struct EncodedFrame(Arc<[u8]>);

impl EncodedFrame {
    pub fn encode(msg: &Message) -> Result<Self> {
        let json = serde_json::to_vec(msg)
            .map_err(|e| Error::Internal(format!("Failed to serialize {}: {}", msg.type_name(), e)))?;
        let len = u32::try_from(json.len())
            .map_err(|_| Error::Internal(format!("{} payload exceeds 4 GiB", msg.type_name())))?;

        let mut buf = Vec::with_capacity(4 + json.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&json);
        Ok(Self(buf.into()))
    }

    /// Length prefix plus payload
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn payload_len(&self) -> usize {
        self.0.len() - 4
    }
}

/// Receiving side of a message channel
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    max_frame_bytes: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_bytes: u32) -> Self {
        Self {
            inner,
            max_frame_bytes,
        }
    }

    /// Wait for one complete frame and decode it
    pub async fn receive(&mut self) -> Result<Message> {
        let len = self.inner.read_u32().await.map_err(stream_error)?;
        if len > self.max_frame_bytes {
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }

        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf).await.map_err(stream_error)?;

        serde_json::from_slice(&buf).map_err(|e| Error::malformed_frame(e.to_string()))
    }
}

/// Sending side of a message channel
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let frame = EncodedFrame::encode(msg)?;
        self.send_frame(&frame).await
    }

    pub async fn send_frame(&mut self, frame: &EncodedFrame) -> Result<()> {
        self.inner
            .write_all(frame.as_bytes())
            .await
            .map_err(stream_error)?;
        self.inner.flush().await.map_err(stream_error)
    }

    /// Close the write direction; the peer sees end-of-stream
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await.map_err(stream_error)
    }
}

pub type TcpFrameReader = FrameReader<OwnedReadHalf>;
pub type TcpFrameWriter = FrameWriter<OwnedWriteHalf>;

/// Split a connected socket into its two channel halves
pub fn split_stream(stream: TcpStream, max_frame_bytes: u32) -> (TcpFrameReader, TcpFrameWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        FrameReader::new(read_half, max_frame_bytes),
        FrameWriter::new(write_half),
    )
}

fn stream_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::connection_lost("peer closed the stream"),
        _ => Error::connection_lost(e.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
