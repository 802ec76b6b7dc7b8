//! Error types for proxyguard
//!
//! Errors are grouped by subsystem (framing, dialing, handshake, tunnel) and
//! collected under the top-level [`ProxyError`]. Each error carries its retry
//! classification: fatal errors abort the orchestrator, recoverable errors
//! are fed back to the restart controller.

use std::io;

use thiserror::Error;

/// Top-level error type for proxyguard
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Datagram framing errors
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Outbound TCP construction errors
    #[error("dial error: {0}")]
    Dial(#[from] DialError),

    /// HTTP Upgrade handshake errors
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Bridge errors
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// DNS resolution of the peer hostname failed
    #[error("failed to resolve peer host {host}: {reason}")]
    DnsResolutionFailed {
        /// Hostname that failed to resolve
        host: String,
        /// Failure reason
        reason: String,
    },

    /// The restart controller exhausted its wait schedule on consecutive
    /// failed runs
    #[error("restart wait schedule exhausted by consecutive failures")]
    MaxRestarts,

    /// The restart controller was given an empty wait schedule
    #[error("no restart wait times available")]
    EmptyWaitSchedule,

    /// The cancellation signal fired
    #[error("operation cancelled")]
    Cancelled,

    /// I/O errors not covered by a subsystem
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Check if this error aborts the orchestrator (no retry)
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Framing(_) | Self::MaxRestarts | Self::EmptyWaitSchedule => true,
            Self::Dial(e) => e.is_fatal(),
            Self::Handshake(e) => e.is_fatal(),
            Self::Tunnel(_)
            | Self::DnsResolutionFailed { .. }
            | Self::Io(_)
            | Self::Cancelled => false,
        }
    }

    /// Check if this error is recoverable (fed to the restart controller)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal() && !self.is_cancelled()
    }

    /// Check if this error is the cancellation signal surfacing
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Tunnel(TunnelError::Cancelled))
    }

    /// Create a DNS resolution failure
    pub fn dns_failed(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DnsResolutionFailed {
            host: host.into(),
            reason: reason.into(),
        }
    }
}

/// Datagram framing errors
#[derive(Debug, Error)]
pub enum FramingError {
    /// Payload does not fit the 2-byte length prefix
    #[error("datagram of {len} bytes exceeds the 65535-byte frame limit")]
    PayloadTooLarge {
        /// Offending payload length
        len: usize,
    },

    /// I/O error while writing a frame
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Outbound TCP dial errors
#[derive(Debug, Error)]
pub enum DialError {
    /// TCP connection failed
    #[error("TCP connection to {address} failed: {reason}")]
    ConnectionFailed {
        /// Target address
        address: String,
        /// Failure reason
        reason: String,
    },

    /// Connection timeout
    #[error("connection to {address} timed out after {timeout_ms}ms")]
    Timeout {
        /// Target address
        address: String,
        /// Timeout in milliseconds
        timeout_ms: u64,
    },

    /// DNS resolution failed at dial time
    #[error("failed to resolve address {address}: {reason}")]
    DnsResolutionFailed {
        /// Hostname that failed to resolve
        address: String,
        /// Failure reason
        reason: String,
    },

    /// Setting a required socket option failed
    #[error("failed to set socket option {option}: {reason}")]
    SocketOption {
        /// Option name
        option: String,
        /// Failure reason
        reason: String,
    },

    /// A socket option was requested on a platform that does not support it
    #[error("socket option {0} is not supported on this platform")]
    UnsupportedPlatform(String),

    /// TLS handshake failed
    #[error("TLS handshake with {server_name} failed: {reason}")]
    TlsHandshakeFailed {
        /// Server name (SNI)
        server_name: String,
        /// Failure reason
        reason: String,
    },

    /// Invalid server name for TLS SNI
    #[error("invalid server name for TLS SNI: {0}")]
    InvalidServerName(String),

    /// I/O error during socket construction
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DialError {
    /// Check if this error aborts the orchestrator
    ///
    /// Connection, timeout, DNS and TLS failures are transient; platform and
    /// socket-option failures indicate a configuration problem that retrying
    /// cannot fix.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. }
            | Self::Timeout { .. }
            | Self::DnsResolutionFailed { .. }
            | Self::TlsHandshakeFailed { .. }
            | Self::Io(_) => false,
            Self::SocketOption { .. }
            | Self::UnsupportedPlatform(_)
            | Self::InvalidServerName(_) => true,
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(address: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            address: address.into(),
            timeout_ms,
        }
    }

    /// Create a DNS resolution failed error
    pub fn dns_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DnsResolutionFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Create an unsupported platform error
    pub fn unsupported_platform(option: impl Into<String>) -> Self {
        Self::UnsupportedPlatform(option.into())
    }

    /// Create a TLS handshake failed error
    pub fn tls_handshake(server_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TlsHandshakeFailed {
            server_name: server_name.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid server name error
    pub fn invalid_server_name(name: impl Into<String>) -> Self {
        Self::InvalidServerName(name.into())
    }
}

/// HTTP Upgrade handshake errors
///
/// Validation failures are fatal: they mean the peer is misconfigured or
/// speaks an incompatible protocol, and retrying cannot change that.
/// Transport-level failures while performing the exchange are transient.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The peer URL could not be parsed
    #[error("invalid peer URL: {0}")]
    InvalidUrl(String),

    /// The peer URL scheme is not http or https
    #[error("unsupported peer URL scheme: {0}")]
    UnsupportedScheme(String),

    /// The response status was not 101 Switching Protocols
    #[error("status is not switching protocols, got: {0}")]
    BadStatus(u16),

    /// The response `Connection` header did not match `Upgrade`
    #[error("the 'Connection' header is not 'Upgrade', got: {0:?}")]
    BadConnectionHeader(String),

    /// The response `Upgrade` header did not match the negotiated protocol
    #[error("the 'Upgrade' header is not the expected protocol, got: {0:?}")]
    BadUpgradeHeader(String),

    /// The response did not yield a full-duplex byte stream
    #[error("response did not produce an upgraded stream: {0}")]
    NotAStream(String),

    /// Building the upgrade request failed
    #[error("failed to build upgrade request: {0}")]
    RequestBuild(String),

    /// HTTP transport error while performing the exchange
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// I/O error while performing the exchange
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HandshakeError {
    /// Check if this error aborts the orchestrator
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::InvalidUrl(_)
            | Self::UnsupportedScheme(_)
            | Self::BadStatus(_)
            | Self::BadConnectionHeader(_)
            | Self::BadUpgradeHeader(_)
            | Self::NotAStream(_)
            | Self::RequestBuild(_) => true,
            Self::Http(_) | Self::Io(_) => false,
        }
    }

    /// Create an invalid URL error
    pub fn invalid_url(reason: impl Into<String>) -> Self {
        Self::InvalidUrl(reason.into())
    }

    /// Create an unsupported scheme error
    pub fn unsupported_scheme(scheme: impl Into<String>) -> Self {
        Self::UnsupportedScheme(scheme.into())
    }

    /// Create a not-a-stream error
    pub fn not_a_stream(reason: impl Into<String>) -> Self {
        Self::NotAStream(reason.into())
    }
}

/// Bridge errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The idle-timeout reader expired
    #[error("stream reader idle timeout reached")]
    IdleTimeout,

    /// The cancellation signal fired while bridging
    #[error("tunnel cancelled")]
    Cancelled,

    /// Framing failure while encoding a datagram
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// I/O failure on either endpoint
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
