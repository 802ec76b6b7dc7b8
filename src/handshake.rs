//! Client-side HTTP/1.1 Upgrade handshake
//!
//! One attempt: dial the peer through the [`TcpDialer`], wrap the stream in
//! TLS for `https` peers, send a GET carrying `Connection: Upgrade` and
//! `Upgrade: UoTLV/1`, validate the `101 Switching Protocols` response, and
//! take over the underlying byte stream.
//!
//! Validation failures are fatal: a peer answering anything but a conforming
//! 101 is misconfigured or incompatible, and the restart controller must not
//! retry against it. Transport failures along the way stay retryable.

use std::sync::Arc;

use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::upgrade::Upgraded;
use hyper::{Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::dialer::TcpDialer;
use crate::error::{DialError, HandshakeError, ProxyError};

/// Protocol token negotiated in the HTTP Upgrade
///
/// `UoTLV/1` is UDP over TCP Length Value, version 1.
pub const UPGRADE_PROTO: &str = "UoTLV/1";

/// URL scheme of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerScheme {
    /// Plain TCP
    Http,
    /// TLS 1.3 over TCP
    Https,
}

/// Parsed peer URL
#[derive(Debug, Clone)]
pub struct PeerUrl {
    /// URL scheme
    pub scheme: PeerScheme,
    /// Host component, used for dialing and TLS SNI
    pub host: String,
    /// Port, defaulted from the scheme when absent
    pub port: u16,
    /// Value for the `Host` request header
    pub host_header: String,
    /// Origin-form path (and query) for the upgrade request
    pub path: String,
}

impl PeerUrl {
    /// Parse a peer URL, accepting only `http` and `https`
    ///
    /// # Errors
    ///
    /// Returns a fatal [`HandshakeError`] on malformed URLs or unsupported
    /// schemes.
    pub fn parse(peer: &str) -> Result<Self, HandshakeError> {
        let uri: Uri = peer
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| HandshakeError::invalid_url(e.to_string()))?;

        let scheme = match uri.scheme_str() {
            Some("http") => PeerScheme::Http,
            Some("https") => PeerScheme::Https,
            Some(other) => return Err(HandshakeError::unsupported_scheme(other)),
            None => return Err(HandshakeError::invalid_url("missing scheme")),
        };

        let authority = uri
            .authority()
            .ok_or_else(|| HandshakeError::invalid_url("missing host"))?;
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        if host.is_empty() {
            return Err(HandshakeError::invalid_url("missing host"));
        }
        let port = uri.port_u16().unwrap_or(match scheme {
            PeerScheme::Http => 80,
            PeerScheme::Https => 443,
        });
        let path = uri
            .path_and_query()
            .map_or_else(|| String::from("/"), |pq| pq.as_str().to_string());

        Ok(Self {
            scheme,
            host,
            port,
            host_header: authority.as_str().to_string(),
            path,
        })
    }
}

/// The stream the upgrade request travels over
enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            Self::Tls(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Perform one upgrade attempt against the peer
///
/// On success the returned stream is the hijacked full-duplex connection;
/// bytes hyper buffered past the response head are replayed by it, so no
/// early frame is lost.
///
/// # Errors
///
/// Fatal [`HandshakeError`]s on validation failures; retryable dial, TLS
/// and HTTP transport errors otherwise.
pub async fn connect(
    peer: &PeerUrl,
    dialer: &TcpDialer,
    user_agent: Option<&str>,
    tls_config: Option<Arc<rustls::ClientConfig>>,
) -> Result<TokioIo<Upgraded>, ProxyError> {
    debug!(host = %peer.host, port = peer.port, "connecting to HTTP server");
    let tcp = dialer.dial(&peer.host, peer.port).await?;

    let stream = match peer.scheme {
        PeerScheme::Http => MaybeTlsStream::Plain(tcp),
        PeerScheme::Https => {
            let tls = tls_connect(tcp, &peer.host, tls_config).await?;
            MaybeTlsStream::Tls(Box::new(tls))
        }
    };

    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
        .await
        .map_err(HandshakeError::Http)?;
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            debug!(error = %err, "upgrade connection task ended");
        }
    });

    let mut builder = Request::builder()
        .uri(peer.path.as_str())
        .header(header::HOST, peer.host_header.as_str())
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, UPGRADE_PROTO);
    if let Some(agent) = user_agent {
        builder = builder.header(header::USER_AGENT, agent);
    }
    let request = builder
        .body(Empty::<Bytes>::new())
        .map_err(|e| HandshakeError::RequestBuild(e.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(HandshakeError::Http)?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(HandshakeError::BadStatus(response.status().as_u16()).into());
    }
    if !header_matches(response.headers(), &header::CONNECTION, "Upgrade") {
        return Err(
            HandshakeError::BadConnectionHeader(header_text(response.headers(), &header::CONNECTION))
                .into(),
        );
    }
    if !header_matches(response.headers(), &header::UPGRADE, UPGRADE_PROTO) {
        return Err(
            HandshakeError::BadUpgradeHeader(header_text(response.headers(), &header::UPGRADE))
                .into(),
        );
    }

    let upgraded = hyper::upgrade::on(response)
        .await
        .map_err(|e| HandshakeError::not_a_stream(e.to_string()))?;

    info!("connected to HTTP server, ready for proxying traffic");
    Ok(TokioIo::new(upgraded))
}

/// Wrap a TCP stream in TLS 1.3 with SNI taken from the peer host
async fn tls_connect(
    tcp: TcpStream,
    host: &str,
    tls_config: Option<Arc<rustls::ClientConfig>>,
) -> Result<TlsStream<TcpStream>, DialError> {
    let config = tls_config.unwrap_or_else(default_tls_config);
    let connector = TlsConnector::from(config);
    let server_name: ServerName<'static> = host
        .to_string()
        .try_into()
        .map_err(|_| DialError::invalid_server_name(host))?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| DialError::tls_handshake(host, e.to_string()))
}

/// TLS 1.3-only client configuration with Mozilla's root certificates
fn default_tls_config() -> Arc<rustls::ClientConfig> {
    let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

/// Case-insensitive single-valued header comparison
pub(crate) fn header_matches(headers: &HeaderMap, name: &header::HeaderName, want: &str) -> bool {
    headers
        .get(name)
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(want))
}

/// Header value as text for error reporting
pub(crate) fn header_text(headers: &HeaderMap, name: &header::HeaderName) -> String {
    headers
        .get(name)
        .map_or_else(String::new, |v| String::from_utf8_lossy(v.as_bytes()).into_owned())
}
