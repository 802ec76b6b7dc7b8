//! Server orchestrator and HTTP Upgrade acceptor
//!
//! The server listens on TCP, answers conforming `Upgrade: UoTLV/1` requests
//! with `101 Switching Protocols`, hijacks the underlying connection, and
//! bridges it to a fresh UDP socket aimed at the configured WireGuard
//! endpoint. Everything else on the request surface is rejected: non-GET
//! methods with 501, missing or wrong upgrade headers with 426.
//!
//! Bytes the HTTP parser buffered past the request head are replayed by
//! hyper's upgraded stream, so a client that pipelines its first frame right
//! behind the handshake loses nothing.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, TunnelError};
use crate::handshake::{header_matches, header_text, UPGRADE_PROTO};
use crate::reader::{IdleTimeout, READ_IDLE_TIMEOUT};
use crate::tunnel::tunnel;

/// Read timeout for a client's HTTP request head
pub const HANDSHAKE_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-session context handed to each accepted connection
#[derive(Clone)]
struct SessionCtx {
    wg_addr: SocketAddr,
    cancel: CancellationToken,
}

/// Server orchestrator
pub struct Server {
    listener: TcpListener,
    wg_addr: SocketAddr,
}

impl Server {
    /// Bind the TCP listener and resolve the WireGuard endpoint
    ///
    /// # Errors
    ///
    /// Returns an error when either address fails to resolve or the listen
    /// socket cannot be bound.
    pub async fn bind(listen: &str, to: &str) -> Result<Self, ProxyError> {
        let wg_addr = lookup_host(to)
            .await
            .map_err(|e| ProxyError::dns_failed(to, e.to_string()))?
            .next()
            .ok_or_else(|| ProxyError::dns_failed(to, "no addresses returned"))?;
        let listener = TcpListener::bind(listen).await?;
        Ok(Self { listener, wg_addr })
    }

    /// The bound listen address
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the socket is gone.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve clients until cancellation
    ///
    /// Accept errors are logged and the loop keeps going; only cancellation
    /// ends it. In-flight sessions observe a child of `cancel` and shut
    /// down with it.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Cancelled`] once the cancellation signal fires.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), ProxyError> {
        info!(
            listen = %self.local_addr()?,
            wireguard = %self.wg_addr,
            "proxy server ready to receive clients"
        );
        loop {
            let (stream, client) = tokio::select! {
                () = cancel.cancelled() => return Err(ProxyError::Cancelled),
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept client");
                        continue;
                    }
                },
            };
            debug!(client = %client, "accepted client");
            let ctx = SessionCtx {
                wg_addr: self.wg_addr,
                cancel: cancel.child_token(),
            };
            tokio::spawn(handle_connection(stream, client, ctx));
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listen", &self.listener.local_addr().ok())
            .field("wg_addr", &self.wg_addr)
            .finish()
    }
}

/// Drive HTTP/1.1 on one accepted connection, with upgrade support
async fn handle_connection(stream: TcpStream, client: SocketAddr, ctx: SessionCtx) {
    let service = service_fn(move |req| {
        let ctx = ctx.clone();
        async move { Ok::<_, Infallible>(upgrade_response(req, &ctx)) }
    });
    let conn = hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HANDSHAKE_HEADER_TIMEOUT)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();

    if let Err(e) = conn.await {
        debug!(client = %client, error = %e, "HTTP connection ended with error");
    }
}

/// Decide the response for one request, spawning the session on acceptance
fn upgrade_response(mut req: Request<Incoming>, ctx: &SessionCtx) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        warn!(method = %req.method(), "rejecting client with unsupported HTTP method");
        return reject(
            StatusCode::NOT_IMPLEMENTED,
            StatusCode::NOT_IMPLEMENTED.to_string(),
        );
    }
    if !header_matches(req.headers(), &header::CONNECTION, "Upgrade") {
        let got = header_text(req.headers(), &header::CONNECTION);
        warn!(got = %got, "rejecting client: 'Connection' header is not 'Upgrade'");
        return reject(
            StatusCode::UPGRADE_REQUIRED,
            format!("the 'Connection' header is not 'Upgrade', got: '{got}'"),
        );
    }
    if !header_matches(req.headers(), &header::UPGRADE, UPGRADE_PROTO) {
        let got = header_text(req.headers(), &header::UPGRADE);
        warn!(got = %got, "rejecting client: 'Upgrade' header is not the tunnel protocol");
        return reject(
            StatusCode::UPGRADE_REQUIRED,
            format!("the 'Upgrade' header is not '{UPGRADE_PROTO}', got: '{got}'"),
        );
    }

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(run_session(on_upgrade, ctx.clone()));

    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    upgrade_headers(&mut response);
    response
}

/// Build a rejection response that still advertises the tunnel protocol
fn reject(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    upgrade_headers(&mut response);
    response
}

fn upgrade_headers(response: &mut Response<Full<Bytes>>) {
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    response
        .headers_mut()
        .insert(header::UPGRADE, HeaderValue::from_static(UPGRADE_PROTO));
}

/// Bridge one hijacked connection to WireGuard until it ends
///
/// A clean EOF or an idle-timeout eviction is a silent close; anything else
/// is logged.
async fn run_session(on_upgrade: OnUpgrade, ctx: SessionCtx) {
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            debug!(error = %e, "hijacking connection failed");
            return;
        }
    };

    let udp = match connect_wireguard(ctx.wg_addr).await {
        Ok(udp) => udp,
        Err(e) => {
            warn!(error = %e, "failed dialing WireGuard");
            return;
        }
    };

    let (reader, writer) = tokio::io::split(TokioIo::new(upgraded));
    let reader = IdleTimeout::new(reader, READ_IDLE_TIMEOUT);

    match tunnel(&udp, reader, writer, &ctx.cancel).await {
        Ok(()) | Err(TunnelError::IdleTimeout | TunnelError::Cancelled) => {}
        Err(e) => warn!(error = %e, "tunneling UDP<->TCP client exited with error"),
    }
}

/// Open a connected UDP socket to the WireGuard endpoint
async fn connect_wireguard(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let bind_addr = match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let udp = UdpSocket::bind(bind_addr).await?;
    udp.connect(addr).await?;
    Ok(udp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_resolves_wireguard_endpoint() {
        let server = Server::bind("127.0.0.1:0", "127.0.0.1:51820").await.unwrap();
        assert!(server.local_addr().unwrap().port() > 0);
        assert_eq!(server.wg_addr.port(), 51820);
    }

    #[tokio::test]
    async fn test_bind_rejects_unresolvable_endpoint() {
        let err = Server::bind("127.0.0.1:0", "wg.invalid:51820")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::DnsResolutionFailed { .. }));
    }

    #[tokio::test]
    async fn test_serve_returns_cancelled() {
        let server = Server::bind("127.0.0.1:0", "127.0.0.1:51820").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = server.serve(cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
