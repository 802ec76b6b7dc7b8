//! Bidirectional UDP<->stream bridge
//!
//! Two copy loops run concurrently: one reads datagrams and writes frames,
//! the other reads frames and writes datagrams. The first loop to finish
//! decides the outcome; the other is torn down with it when the bridge
//! returns and the session owner drops both endpoints.
//!
//! ```text
//! WireGuard --UDP--> [recv] --frame--> [write+flush] --TCP--> peer
//! WireGuard <--UDP-- [send] <--drain-- [read]        <--TCP-- peer
//! ```

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::TunnelError;
use crate::framing::{drain_frames, encode_frame_in_place, BUF_SIZE, HDR_LEN};
use crate::reader::ReaderTimeout;

/// Bridge a connected UDP socket and a byte stream until either direction
/// finishes or the cancellation signal fires
///
/// Returns `Ok(())` when the stream reaches a clean EOF. The reader is
/// expected to be wrapped in [`crate::reader::IdleTimeout`]; its expiry
/// surfaces as [`TunnelError::IdleTimeout`]. Cancellation surfaces as
/// [`TunnelError::Cancelled`].
///
/// # Errors
///
/// Returns the first error either direction hit.
pub async fn tunnel<R, W>(
    udp: &UdpSocket,
    reader: R,
    writer: W,
    cancel: &CancellationToken,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        () = cancel.cancelled() => Err(TunnelError::Cancelled),
        res = udp_to_stream(udp, writer) => res,
        res = stream_to_udp(reader, udp) => res,
    }
}

/// Read datagrams and emit one flushed frame per datagram
///
/// The receive buffer leaves [`HDR_LEN`] bytes free at the front so the
/// length header is written in place and the whole frame goes out in one
/// write.
async fn udp_to_stream<W>(udp: &UdpSocket, mut writer: W) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE].into_boxed_slice();
    loop {
        let n = udp.recv(&mut buf[HDR_LEN..]).await?;
        if n == 0 {
            continue;
        }
        let framed = encode_frame_in_place(&mut buf, n)?;
        writer.write_all(framed).await?;
        writer.flush().await?;
        trace!(len = n, "datagram forwarded to stream");
    }
}

/// Read stream bytes into a carry buffer and deliver every complete frame
///
/// `read_buf` appends to the tail; [`drain_frames`] consumes whole frames
/// from the front and `advance` compacts the at-most-one partial frame that
/// remains. A zero-byte read is a clean EOF.
async fn stream_to_udp<R>(mut reader: R, udp: &UdpSocket) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(BUF_SIZE);
    loop {
        let n = reader.read_buf(&mut buf).await.map_err(|err| {
            if ReaderTimeout::caused(&err) {
                TunnelError::IdleTimeout
            } else {
                TunnelError::Io(err)
            }
        })?;
        if n == 0 {
            return Ok(());
        }
        let consumed = drain_frames(udp, &buf[..]).await;
        buf.advance(consumed);
    }
}
