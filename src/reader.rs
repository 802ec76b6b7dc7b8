//! Per-read idle timeout for stream readers
//!
//! A dead TCP session carrying no WireGuard keepalives would otherwise block
//! a bridge read forever. [`IdleTimeout`] wraps an [`AsyncRead`] and races
//! every read against a deadline; expiry surfaces as an [`io::Error`] of
//! kind [`io::ErrorKind::TimedOut`] carrying the distinct [`ReaderTimeout`]
//! payload, which the bridge maps to its own timeout classification. The
//! server treats that as a clean close, the client reconnects.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::Sleep;

/// Idle timeout applied to every read on a tunneled stream
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Marker payload identifying an idle-timeout read failure
#[derive(Debug, Error)]
#[error("stream reader idle timeout reached")]
pub struct ReaderTimeout;

impl ReaderTimeout {
    /// Check whether an I/O error was produced by an [`IdleTimeout`] expiry
    #[must_use]
    pub fn caused(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::TimedOut
            && err.get_ref().is_some_and(|inner| inner.is::<ReaderTimeout>())
    }
}

/// Reader wrapper enforcing a per-read deadline
///
/// The deadline is armed when a read first returns pending and cleared when
/// the read completes, so each read gets the full timeout regardless of how
/// long the previous one took. The wrapper is not required to be usable
/// after a timeout has fired.
pub struct IdleTimeout<R> {
    inner: R,
    timeout: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<R> IdleTimeout<R> {
    /// Wrap a reader with a per-read timeout
    pub fn new(inner: R, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: None,
        }
    }

    /// Consume the wrapper, returning the underlying reader
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R> AsyncRead for IdleTimeout<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Data that is already available wins over an elapsed deadline.
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(res) => {
                this.deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                let timeout = this.timeout;
                let deadline = this
                    .deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                match deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.deadline = None;
                        Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            ReaderTimeout,
                        )))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}
