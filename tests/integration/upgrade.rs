//! Upgrade handshake surface: acceptance, rejection, fatal classification

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use proxyguard::{Client, ClientConfig, ProxyError};

use super::{free_udp_port, read_response_head, start_server, wireguard_stub, TEST_TIMEOUT};

async fn send_request(server: std::net::SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(server).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    read_response_head(&mut stream).await
}

#[tokio::test]
async fn test_non_get_method_gets_501() {
    let (_wg, wg_addr) = wireguard_stub().await;
    let (server_addr, cancel) = start_server(wg_addr).await;

    let head = send_request(
        server_addr,
        &format!(
            "POST / HTTP/1.1\r\nHost: {server_addr}\r\nConnection: Upgrade\r\nUpgrade: UoTLV/1\r\nContent-Length: 0\r\n\r\n"
        ),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 501"), "got: {head}");

    cancel.cancel();
}

#[tokio::test]
async fn test_missing_connection_header_gets_426() {
    let (_wg, wg_addr) = wireguard_stub().await;
    let (server_addr, cancel) = start_server(wg_addr).await;

    let head = send_request(
        server_addr,
        &format!("GET / HTTP/1.1\r\nHost: {server_addr}\r\nUpgrade: UoTLV/1\r\n\r\n"),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 426"), "got: {head}");

    cancel.cancel();
}

#[tokio::test]
async fn test_wrong_upgrade_protocol_gets_426() {
    let (_wg, wg_addr) = wireguard_stub().await;
    let (server_addr, cancel) = start_server(wg_addr).await;

    let head = send_request(
        server_addr,
        &format!(
            "GET / HTTP/1.1\r\nHost: {server_addr}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n"
        ),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 426"), "got: {head}");

    cancel.cancel();
}

#[tokio::test]
async fn test_case_insensitive_headers_accepted() {
    let (_wg, wg_addr) = wireguard_stub().await;
    let (server_addr, cancel) = start_server(wg_addr).await;

    let head = send_request(
        server_addr,
        &format!(
            "GET / HTTP/1.1\r\nHost: {server_addr}\r\nConnection: upgrade\r\nUpgrade: uotlv/1\r\n\r\n"
        ),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 101"), "got: {head}");
    assert!(
        head.to_ascii_lowercase().contains("upgrade: uotlv/1"),
        "got: {head}"
    );

    cancel.cancel();
}

/// A mock peer that answers every request with 200 instead of 101
async fn mock_plain_http_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut filled = 0;
                while !buf[..filled].windows(4).any(|w| w == b"\r\n\r\n") {
                    let Ok(n) = stream.read(&mut buf[filled..]).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    filled += n;
                }
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                    .await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_non_101_response_is_fatal_and_not_retried() {
    let mock_addr = mock_plain_http_server().await;

    let wg_stub = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let forward_port = wg_stub.local_addr().unwrap().port();
    let listen_port = free_udp_port();

    let client = Client::new(
        ClientConfig::new(format!("http://127.0.0.1:{}", mock_addr.port()))
            .with_listen_port(listen_port),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let tunnel_task = tokio::spawn(async move { client.tunnel(&cancel, forward_port).await });

    // Poke the client until its socket is up and the fatal handshake runs.
    let trigger = async {
        loop {
            let _ = wg_stub.send_to(b"ping", ("127.0.0.1", listen_port)).await;
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    };
    let result = timeout(TEST_TIMEOUT, async {
        tokio::select! {
            res = tunnel_task => res.unwrap(),
            () = trigger => unreachable!(),
        }
    })
    .await
    .expect("client kept retrying a fatal handshake error");
    let err = result.unwrap_err();
    assert!(err.is_fatal(), "expected a fatal error, got: {err}");
    assert!(
        matches!(err, ProxyError::Handshake(_)),
        "expected a handshake error, got: {err}"
    );
}
