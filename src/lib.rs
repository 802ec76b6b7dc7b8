//! proxyguard: WireGuard UDP over an HTTP-upgraded TCP stream
//!
//! This crate tunnels WireGuard's UDP datagrams through a single long-lived
//! TCP connection negotiated with an HTTP/1.1 Upgrade handshake, so that a
//! WireGuard endpoint reachable only over TCP (for example behind a
//! restrictive HTTP gateway) stays usable.
//!
//! # Architecture
//!
//! ```text
//! WireGuard --UDP--> Client --[len][datagram] frames over TCP (TLS?)--> Server --UDP--> WireGuard
//!                      |                                                  |
//!                 HTTP Upgrade  <------- UoTLV/1 handshake ------->  HTTP acceptor
//! ```
//!
//! Two peers cooperate: a [`Client`] that accepts UDP from a local WireGuard
//! process and forwards it to a remote HTTP server, and a [`Server`] that
//! accepts upgraded HTTP connections and relays them to a local WireGuard
//! UDP endpoint. Each datagram crosses the stream as a 2-byte big-endian
//! length prefix followed by the payload.
//!
//! # Example
//!
//! ```no_run
//! use proxyguard::{Client, ClientConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), proxyguard::ProxyError> {
//! let client = Client::new(
//!     ClientConfig::new("https://proxy.example.org/tunnel").with_listen_port(51821),
//! )?;
//! let cancel = CancellationToken::new();
//! client.tunnel(&cancel, 51820).await
//! # }
//! ```
//!
//! # Modules
//!
//! - [`framing`]: length-prefixed datagram codec
//! - [`tunnel`]: the bidirectional UDP<->stream bridge
//! - [`reader`]: per-read idle timeout for stream readers
//! - [`dialer`]: outbound TCP construction and peer-IP substitution
//! - [`handshake`]: client-side HTTP/1.1 Upgrade
//! - [`restart`]: backoff/restart controller
//! - [`client`], [`server`]: the two orchestrators
//! - [`error`]: error types

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod client;
pub mod dialer;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod reader;
pub mod restart;
pub mod server;
pub mod tunnel;

// Re-export commonly used types at the crate root
pub use client::{Client, ClientConfig};
pub use dialer::{NoopCallbacks, TcpDialer, TunnelCallbacks, CONNECT_TIMEOUT};
pub use error::{DialError, FramingError, HandshakeError, ProxyError, TunnelError};
pub use framing::{
    drain_frames, encode_datagram, DatagramSink, BUF_SIZE, HDR_LEN, MAX_DATAGRAM,
};
pub use handshake::{PeerScheme, PeerUrl, UPGRADE_PROTO};
pub use reader::{IdleTimeout, ReaderTimeout, READ_IDLE_TIMEOUT};
pub use restart::{restart_until_err, RestartConfig};
pub use server::{Server, HANDSHAKE_HEADER_TIMEOUT};
pub use tunnel::tunnel;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
