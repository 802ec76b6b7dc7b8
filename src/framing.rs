//! Length-prefixed datagram framing
//!
//! Each UDP datagram crosses the TCP stream as a frame: a 2-byte big-endian
//! length followed by exactly that many payload bytes. Frames are
//! concatenated with no separators or trailers; a zero-length frame is legal
//! and carries an empty datagram.
//!
//! ```text
//! +----------+-------------------+----------+------------+ ...
//! | len (2B) | payload (len B)   | len (2B) | payload    |
//! +----------+-------------------+----------+------------+ ...
//! ```
//!
//! The encoder writes the header in place in front of the payload so that
//! one contiguous write emits the whole frame. The decoder scans a carry
//! buffer, hands every complete payload to a [`DatagramSink`], and reports
//! how many bytes it consumed so the caller can compact the remainder.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::trace;

use crate::error::FramingError;

/// Length of the frame header in bytes
pub const HDR_LEN: usize = 2;

/// Largest payload a frame can carry
pub const MAX_DATAGRAM: usize = u16::MAX as usize;

/// Receive buffer size used on both sides of the bridge (2^16)
pub const BUF_SIZE: usize = 1 << 16;

/// Destination for decoded datagrams
///
/// The bridge feeds a connected [`UdpSocket`]; tests substitute collectors.
#[async_trait]
pub trait DatagramSink {
    /// Deliver one decoded datagram payload
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when delivery fails.
    async fn send_datagram(&self, payload: &[u8]) -> io::Result<()>;
}

#[async_trait]
impl DatagramSink for UdpSocket {
    async fn send_datagram(&self, payload: &[u8]) -> io::Result<()> {
        self.send(payload).await.map(|_| ())
    }
}

/// Write the frame header in front of a payload already positioned at
/// `buf[HDR_LEN..HDR_LEN + len]`, returning the complete frame slice
///
/// This is the zero-copy path of the bridge: the receive buffer leaves the
/// first two bytes free so the header can be stamped without moving the
/// payload.
///
/// # Errors
///
/// Returns [`FramingError::PayloadTooLarge`] if `len` exceeds
/// [`MAX_DATAGRAM`].
pub fn encode_frame_in_place(buf: &mut [u8], len: usize) -> Result<&[u8], FramingError> {
    if len > MAX_DATAGRAM {
        return Err(FramingError::PayloadTooLarge { len });
    }
    #[allow(clippy::cast_possible_truncation)]
    let hdr = (len as u16).to_be_bytes();
    buf[..HDR_LEN].copy_from_slice(&hdr);
    Ok(&buf[..HDR_LEN + len])
}

/// Encode one datagram as a frame and flush it to the writer
///
/// The writer is flushed before this returns so the receiver sees the whole
/// frame promptly.
///
/// # Errors
///
/// Returns [`FramingError::PayloadTooLarge`] for oversized payloads, or the
/// underlying I/O error.
pub async fn encode_datagram<W>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_DATAGRAM {
        return Err(FramingError::PayloadTooLarge {
            len: payload.len(),
        });
    }
    #[allow(clippy::cast_possible_truncation)]
    let hdr = (payload.len() as u16).to_be_bytes();
    writer.write_all(&hdr).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Deliver every complete frame in `buf` to the sink, returning the number
/// of bytes consumed
///
/// Scanning stops at the first incomplete frame: either fewer than two
/// header bytes remain, or the header is present but the payload is
/// truncated. A partial header counts as a partial frame. The caller moves
/// the unconsumed tail to the front of its carry buffer and keeps reading.
///
/// A failing datagram write stops the scan at that frame; the frame's bytes
/// still count as consumed and the datagram is dropped, matching UDP loss
/// semantics.
pub async fn drain_frames<S>(sink: &S, buf: &[u8]) -> usize
where
    S: DatagramSink + ?Sized,
{
    let mut idx = 0;
    loop {
        let hdr_end = idx + HDR_LEN;
        if buf.len() < hdr_end {
            return idx;
        }
        let len = usize::from(u16::from_be_bytes([buf[idx], buf[idx + 1]]));
        let frame_end = hdr_end + len;
        if buf.len() < frame_end {
            return idx;
        }
        let sent = sink.send_datagram(&buf[hdr_end..frame_end]).await;
        idx = frame_end;
        if let Err(err) = sent {
            trace!(error = %err, "datagram write failed, dropping frame");
            return idx;
        }
    }
}
