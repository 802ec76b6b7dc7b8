//! Integration test modules

mod echo;
mod upgrade;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use proxyguard::Server;

/// Generous bound for every await in the suite
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Start a proxy server relaying to `wg_addr`, returning its listen address
pub async fn start_server(wg_addr: SocketAddr) -> (SocketAddr, CancellationToken) {
    let server = Server::bind("127.0.0.1:0", &wg_addr.to_string())
        .await
        .expect("failed to bind test server");
    let addr = server.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = server.serve(serve_cancel).await;
    });
    (addr, cancel)
}

/// Bind a UDP socket standing in for a WireGuard endpoint
pub async fn wireguard_stub() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

/// Perform a raw UoTLV/1 upgrade against the server, returning the stream
/// after the 101 response has been consumed
pub async fn upgraded_stream(server: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(server).await.unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {server}\r\nConnection: Upgrade\r\nUpgrade: UoTLV/1\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_response_head(&mut stream).await;
    assert!(
        head.starts_with("HTTP/1.1 101"),
        "expected 101 Switching Protocols, got: {head}"
    );
    stream
}

/// Read an HTTP response head (through the blank line) as text
pub async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = timeout(TEST_TIMEOUT, stream.read(&mut byte))
            .await
            .expect("timed out reading response head")
            .unwrap();
        assert!(n > 0, "connection closed before the response head ended");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Receive one datagram payload with the suite timeout
pub async fn recv_datagram(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = vec![0u8; 2048];
    let (n, from) = timeout(TEST_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .unwrap();
    buf.truncate(n);
    (buf, from)
}

/// Pick a free UDP port by binding and releasing it
pub fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}
