//! Outbound TCP socket construction
//!
//! The dialer owns everything that happens before bytes flow: source-port
//! binding, the Linux-only firewall mark and source-port reuse, the connect
//! timeout, the raw-descriptor hook for VPN integrators, and substitution of
//! the cached peer IPs so no DNS query happens on the hot path.
//!
//! # Peer-IP substitution
//!
//! When the dial target's host equals the configured peer host and the
//! cached IP list is non-empty, the dialer walks the list in order and
//! returns the first successful connection. Targets with a different host
//! pass through to normal resolution.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::DialError;

/// Timeout for establishing one TCP connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Consumer hooks invoked at tunnel lifecycle points
///
/// Both methods default to no-ops; embedders (e.g. VPN clients) override
/// them to protect the socket from routing loops and to learn when the
/// first upgrade has completed.
pub trait TunnelCallbacks: Send + Sync {
    /// Called with the raw descriptor of each outbound TCP socket before it
    /// connects, together with the peer IPs the dialer is about to try
    ///
    /// The descriptor is intentionally platform-raw so it can be handed to
    /// OS-level protection APIs.
    #[cfg(unix)]
    fn setup_socket(&self, fd: std::os::fd::RawFd, peer_ips: &[IpAddr]) {
        let _ = (fd, peer_ips);
    }

    /// Called once the first HTTP upgrade of a tunnel run has completed
    fn ready(&self) {}
}

/// Default no-op callback set
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallbacks;

impl TunnelCallbacks for NoopCallbacks {}

/// Outbound TCP dialer with socket configuration and peer-IP substitution
pub struct TcpDialer {
    peer_host: String,
    peer_ips: Vec<IpAddr>,
    source_port: u16,
    fwmark: Option<u32>,
    connect_timeout: Duration,
    callbacks: Arc<dyn TunnelCallbacks>,
}

impl TcpDialer {
    /// Create a dialer for the given configured peer host
    #[must_use]
    pub fn new(peer_host: impl Into<String>) -> Self {
        Self {
            peer_host: peer_host.into(),
            peer_ips: Vec::new(),
            source_port: 0,
            fwmark: None,
            connect_timeout: CONNECT_TIMEOUT,
            callbacks: Arc::new(NoopCallbacks),
        }
    }

    /// Set the cached peer IPs tried in order instead of DNS
    #[must_use]
    pub fn with_peer_ips(mut self, peer_ips: Vec<IpAddr>) -> Self {
        self.peer_ips = peer_ips;
        self
    }

    /// Set an explicit TCP source port (0 = kernel-chosen)
    #[must_use]
    pub fn with_source_port(mut self, port: u16) -> Self {
        self.source_port = port;
        self
    }

    /// Set the firewall mark (`SO_MARK`) applied to each socket (Linux only)
    #[must_use]
    pub fn with_fwmark(mut self, fwmark: Option<u32>) -> Self {
        self.fwmark = fwmark;
        self
    }

    /// Override the connect timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Install consumer hooks
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: Arc<dyn TunnelCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// The cached peer IPs
    #[must_use]
    pub fn peer_ips(&self) -> &[IpAddr] {
        &self.peer_ips
    }

    /// Connect to `host:port`, substituting cached peer IPs where they apply
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error when every candidate address fails,
    /// or immediately on a fatal configuration error.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        let candidates = self.candidates(host, port).await?;

        let mut last_error = None;
        for addr in candidates {
            match self.connect_addr(addr).await {
                Ok(stream) => {
                    debug!(addr = %addr, source_port = self.source_port, "TCP connection established");
                    return Ok(stream);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!(addr = %addr, error = %e, "TCP connection attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DialError::connection_failed(format!("{host}:{port}"), "no addresses to connect to")
        }))
    }

    /// Produce the ordered address candidates for a dial target
    async fn candidates(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, DialError> {
        if host == self.peer_host && !self.peer_ips.is_empty() {
            return Ok(self
                .peer_ips
                .iter()
                .map(|ip| SocketAddr::new(*ip, port))
                .collect());
        }
        if host != self.peer_host {
            debug!(
                host,
                peer_host = %self.peer_host,
                "dial host differs from peer host, not using cached IPs"
            );
        }

        let addr_str = format!("{host}:{port}");
        let addrs: Vec<SocketAddr> = lookup_host(&addr_str)
            .await
            .map_err(|e| DialError::dns_failed(&addr_str, e.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(DialError::dns_failed(&addr_str, "no addresses returned"));
        }
        Ok(addrs)
    }

    /// Connect to a single address with the configured socket options
    async fn connect_addr(&self, addr: SocketAddr) -> Result<TcpStream, DialError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }?;

        self.configure_socket(&socket)?;

        if self.source_port > 0 {
            let local = match addr {
                SocketAddr::V4(_) => {
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.source_port)
                }
                SocketAddr::V6(_) => {
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), self.source_port)
                }
            };
            socket.bind(local)?;
        }

        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            self.callbacks
                .setup_socket(socket.as_raw_fd(), &self.peer_ips);
        }

        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = self.connect_timeout.as_millis() as u64;
        let stream = timeout(self.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| DialError::timeout(addr.to_string(), timeout_ms))?
            .map_err(|e| DialError::connection_failed(addr.to_string(), e.to_string()))?;
        Ok(stream)
    }

    /// Apply platform socket options before bind/connect
    #[cfg(target_os = "linux")]
    fn configure_socket(&self, socket: &TcpSocket) -> Result<(), DialError> {
        if self.source_port > 0 {
            // Re-using the source port may fail on exotic kernels; the dial
            // can still proceed without it.
            if let Err(e) = socket.set_reuseaddr(true) {
                warn!(error = %e, "error re-using source port");
            }
        }
        if let Some(mark) = self.fwmark {
            socket2::SockRef::from(socket)
                .set_mark(mark)
                .map_err(|e| DialError::socket_option("SO_MARK", e.to_string()))?;
        }
        Ok(())
    }

    /// Refuse options the platform cannot honor
    #[cfg(not(target_os = "linux"))]
    fn configure_socket(&self, _socket: &TcpSocket) -> Result<(), DialError> {
        if self.fwmark.is_some() {
            return Err(DialError::unsupported_platform("SO_MARK"));
        }
        if self.source_port > 0 {
            warn!("source port re-use is not available on this platform");
        }
        Ok(())
    }
}

impl std::fmt::Debug for TcpDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpDialer")
            .field("peer_host", &self.peer_host)
            .field("peer_ips", &self.peer_ips)
            .field("source_port", &self.source_port)
            .field("fwmark", &self.fwmark)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}
