//! Client orchestrator
//!
//! The client owns one side of the tunnel: a UDP socket facing the local
//! WireGuard process and, per attempt, an HTTP-upgraded TCP stream to the
//! remote peer. Attempts run under the restart controller; each one waits
//! for WireGuard to actually speak before spending a handshake, so an idle
//! client never hammers the server.
//!
//! ```text
//! WireGuard --UDP--> Client --frames over upgraded TCP (TLS?)--> peer
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dialer::{NoopCallbacks, TcpDialer, TunnelCallbacks};
use crate::error::ProxyError;
use crate::framing::{encode_frame_in_place, BUF_SIZE, HDR_LEN};
use crate::handshake::{self, PeerUrl};
use crate::reader::{IdleTimeout, READ_IDLE_TIMEOUT};
use crate::restart::{restart_until_err, RestartConfig};
use crate::tunnel::tunnel;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Peer URL (`http://` or `https://`)
    pub peer: String,

    /// UDP port the client listens on for WireGuard traffic
    pub listen_port: u16,

    /// Source port for the TCP connection (0 = kernel-chosen)
    pub tcp_source_port: u16,

    /// Firewall mark set on the TCP socket (Linux only)
    pub fwmark: Option<u32>,

    /// Resolved peer IPs; resolved once at tunnel start when empty
    pub peer_ips: Vec<IpAddr>,

    /// HTTP user agent sent with the upgrade request
    pub user_agent: Option<String>,

    /// TLS configuration override for `https` peers
    pub tls: Option<Arc<rustls::ClientConfig>>,

    /// Restart policy
    pub restart: RestartConfig,
}

impl ClientConfig {
    /// Create a configuration for the given peer URL with defaults
    #[must_use]
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            listen_port: 51821,
            tcp_source_port: 0,
            fwmark: None,
            peer_ips: Vec::new(),
            user_agent: None,
            tls: None,
            restart: RestartConfig::default(),
        }
    }

    /// Set the UDP listen port
    #[must_use]
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    /// Set the TCP source port
    #[must_use]
    pub fn with_tcp_source_port(mut self, port: u16) -> Self {
        self.tcp_source_port = port;
        self
    }

    /// Set the firewall mark
    #[must_use]
    pub fn with_fwmark(mut self, fwmark: Option<u32>) -> Self {
        self.fwmark = fwmark;
        self
    }

    /// Provide pre-resolved peer IPs
    #[must_use]
    pub fn with_peer_ips(mut self, peer_ips: Vec<IpAddr>) -> Self {
        self.peer_ips = peer_ips;
        self
    }

    /// Set the HTTP user agent
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Override the TLS client configuration
    #[must_use]
    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Override the restart policy
    #[must_use]
    pub fn with_restart(mut self, restart: RestartConfig) -> Self {
        self.restart = restart;
        self
    }
}

/// Client orchestrator
pub struct Client {
    config: ClientConfig,
    peer_url: PeerUrl,
    callbacks: Arc<dyn TunnelCallbacks>,
    /// Cancellation handle of the in-flight attempt, armed per attempt and
    /// cleared on teardown so a restart signal can never race a dead run
    restart_handle: Mutex<Option<CancellationToken>>,
}

impl Client {
    /// Create a client, validating the peer URL up front
    ///
    /// # Errors
    ///
    /// Returns a fatal error for malformed or non-HTTP peer URLs.
    pub fn new(config: ClientConfig) -> Result<Self, ProxyError> {
        let peer_url = PeerUrl::parse(&config.peer)?;
        Ok(Self {
            config,
            peer_url,
            callbacks: Arc::new(NoopCallbacks),
            restart_handle: Mutex::new(None),
        })
    }

    /// Install consumer hooks (socket setup, ready notification)
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: Arc<dyn TunnelCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Resolve the peer hostname once, unless IPs were supplied
    ///
    /// # Errors
    ///
    /// Returns a transient error when resolution fails.
    pub async fn setup_dns(&mut self) -> Result<(), ProxyError> {
        if !self.config.peer_ips.is_empty() {
            return Ok(());
        }
        self.config.peer_ips = resolve_peer_ips(&self.peer_url.host).await?;
        Ok(())
    }

    /// Ask the current attempt to tear down so the restart loop reconnects
    /// immediately instead of waiting for the idle timeout
    ///
    /// Useful for embedders that detect a network change. A no-op when no
    /// attempt is in flight.
    pub fn signal_restart(&self) {
        let handle = self.restart_handle.lock();
        if let Some(token) = handle.as_ref() {
            info!("restart signalled, cancelling current attempt");
            token.cancel();
        }
    }

    /// Run the tunnel until a fatal error or cancellation
    ///
    /// `wg_forward_port` is the local port the WireGuard process sends from;
    /// the client connects its UDP socket there and waits for the first
    /// datagram before performing the HTTP upgrade.
    ///
    /// # Errors
    ///
    /// Returns fatal errors, [`ProxyError::MaxRestarts`] per the restart
    /// policy, or [`ProxyError::Cancelled`].
    pub async fn tunnel(
        &self,
        cancel: &CancellationToken,
        wg_forward_port: u16,
    ) -> Result<(), ProxyError> {
        let peer_ips = if self.config.peer_ips.is_empty() {
            resolve_peer_ips(&self.peer_url.host).await?
        } else {
            self.config.peer_ips.clone()
        };
        info!(
            peer = %self.config.peer,
            peer_ips = ?peer_ips,
            listen_port = self.config.listen_port,
            "starting tunnel client"
        );

        let peer_ips = &peer_ips;
        restart_until_err(
            cancel,
            move |attempt, first| {
                async move {
                    *self.restart_handle.lock() = Some(attempt.clone());
                    let result = self
                        .try_tunnel(&attempt, first, peer_ips, wg_forward_port)
                        .await;
                    *self.restart_handle.lock() = None;

                    match result {
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "fatal error, exiting");
                            Err(e)
                        }
                        Err(e) if e.is_cancelled() && cancel.is_cancelled() => {
                            Err(ProxyError::Cancelled)
                        }
                        Err(e) => {
                            info!(error = %e, "retrying as client exited with error");
                            Ok(())
                        }
                        Ok(()) => {
                            info!("retrying as client exited cleanly");
                            Ok(())
                        }
                    }
                }
            },
            &self.config.restart,
        )
        .await
    }

    /// One tunnel attempt: capture the first datagram, upgrade, bridge
    async fn try_tunnel(
        &self,
        cancel: &CancellationToken,
        first_attempt: bool,
        peer_ips: &[IpAddr],
        wg_forward_port: u16,
    ) -> Result<(), ProxyError> {
        let udp = UdpSocket::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            self.config.listen_port,
        ))
        .await?;
        udp.connect(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            wg_forward_port,
        ))
        .await?;

        info!("waiting for traffic...");
        let mut first_buf = vec![0u8; BUF_SIZE].into_boxed_slice();
        let first_len = tokio::select! {
            () = cancel.cancelled() => return Err(ProxyError::Cancelled),
            n = udp.recv(&mut first_buf[HDR_LEN..]) => n?,
        };
        debug!(len = first_len, "got traffic, creating a handshake");

        let dialer = TcpDialer::new(&self.peer_url.host)
            .with_peer_ips(peer_ips.to_vec())
            .with_source_port(self.config.tcp_source_port)
            .with_fwmark(self.config.fwmark)
            .with_callbacks(self.callbacks.clone());
        let io = tokio::select! {
            () = cancel.cancelled() => return Err(ProxyError::Cancelled),
            res = handshake::connect(
                &self.peer_url,
                &dialer,
                self.config.user_agent.as_deref(),
                self.config.tls.clone(),
            ) => res?,
        };
        if first_attempt {
            self.callbacks.ready();
        }

        let (reader, mut writer) = tokio::io::split(io);
        let reader = IdleTimeout::new(reader, READ_IDLE_TIMEOUT);

        // The datagram that triggered the handshake goes out first.
        let framed = encode_frame_in_place(&mut first_buf, first_len)?;
        writer.write_all(framed).await?;
        writer.flush().await?;

        tunnel(&udp, reader, writer, cancel).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("peer_url", &self.peer_url)
            .finish_non_exhaustive()
    }
}

/// Resolve the peer hostname to its ordered address list
async fn resolve_peer_ips(host: &str) -> Result<Vec<IpAddr>, ProxyError> {
    // The port is irrelevant for resolution; dials re-attach the real one.
    let ips: Vec<IpAddr> = lookup_host((host, 0))
        .await
        .map_err(|e| ProxyError::dns_failed(host, e.to_string()))?
        .map(|addr| addr.ip())
        .collect();
    if ips.is_empty() {
        return Err(ProxyError::dns_failed(host, "no addresses returned"));
    }
    debug!(host, ips = ?ips, "resolved peer host");
    Ok(ips)
}
