//! End-to-end datagram flow through a real server

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use proxyguard::{Client, ClientConfig, RestartConfig};

use super::{
    free_udp_port, recv_datagram, start_server, upgraded_stream, wireguard_stub, TEST_TIMEOUT,
};

#[tokio::test]
async fn test_echo_through_the_server() {
    // A UDP echo stands in for WireGuard; one frame in, the same frame back.
    let (wg, wg_addr) = wireguard_stub().await;
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((n, from)) = wg.recv_from(&mut buf).await else {
                return;
            };
            let _ = wg.send_to(&buf[..n], from).await;
        }
    });
    let (server_addr, cancel) = start_server(wg_addr).await;

    let mut stream = upgraded_stream(server_addr).await;
    stream.write_all(b"\x00\x05hello").await.unwrap();

    let mut reply = [0u8; 7];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut reply))
        .await
        .expect("timed out waiting for the echoed frame")
        .unwrap();
    assert_eq!(&reply, b"\x00\x05hello");

    cancel.cancel();
}

#[tokio::test]
async fn test_two_datagrams_in_one_tcp_segment() {
    let (wg, wg_addr) = wireguard_stub().await;
    let (server_addr, cancel) = start_server(wg_addr).await;

    let mut stream = upgraded_stream(server_addr).await;
    stream.write_all(b"\x00\x03abc\x00\x02de").await.unwrap();

    let (first, _) = recv_datagram(&wg).await;
    let (second, _) = recv_datagram(&wg).await;
    assert_eq!(first, b"abc");
    assert_eq!(second, b"de");

    cancel.cancel();
}

#[tokio::test]
async fn test_split_length_boundary() {
    let (wg, wg_addr) = wireguard_stub().await;
    let (server_addr, cancel) = start_server(wg_addr).await;

    let mut stream = upgraded_stream(server_addr).await;
    stream.write_all(b"\x00").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    stream.write_all(b"\x04test").await.unwrap();

    let (payload, _) = recv_datagram(&wg).await;
    assert_eq!(payload, b"test");

    cancel.cancel();
}

#[tokio::test]
async fn test_zero_length_frame_passes() {
    let (wg, wg_addr) = wireguard_stub().await;
    let (server_addr, cancel) = start_server(wg_addr).await;

    let mut stream = upgraded_stream(server_addr).await;
    stream.write_all(b"\x00\x00\x00\x02ok").await.unwrap();

    let (empty, _) = recv_datagram(&wg).await;
    let (payload, _) = recv_datagram(&wg).await;
    assert!(empty.is_empty());
    assert_eq!(payload, b"ok");

    cancel.cancel();
}

#[tokio::test]
async fn test_client_end_to_end() {
    // Full path: WireGuard stub -> client -> server -> UDP echo -> back.
    let (wg_echo, wg_echo_addr) = wireguard_stub().await;
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((n, from)) = wg_echo.recv_from(&mut buf).await else {
                return;
            };
            let _ = wg_echo.send_to(&buf[..n], from).await;
        }
    });
    let (server_addr, server_cancel) = start_server(wg_echo_addr).await;

    // The stub plays the local WireGuard process: the client connects its
    // UDP socket back to the stub's port.
    let wg_stub = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let forward_port = wg_stub.local_addr().unwrap().port();
    let listen_port = free_udp_port();

    let client = Client::new(
        ClientConfig::new(format!("http://127.0.0.1:{}", server_addr.port()))
            .with_listen_port(listen_port)
            .with_restart(RestartConfig::default()),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let tunnel_cancel = cancel.clone();
    let tunnel_task = tokio::spawn(async move {
        client.tunnel(&tunnel_cancel, forward_port).await
    });

    // First datagram triggers the handshake; it must arrive at the echo and
    // come all the way back. Resend until the client has bound its socket.
    let mut reply = None;
    for _ in 0..20 {
        wg_stub
            .send_to(b"hello", ("127.0.0.1", listen_port))
            .await
            .unwrap();
        let mut buf = vec![0u8; 2048];
        if let Ok(Ok((n, _))) =
            timeout(Duration::from_millis(250), wg_stub.recv_from(&mut buf)).await
        {
            buf.truncate(n);
            reply = Some(buf);
            break;
        }
    }
    assert_eq!(reply.as_deref(), Some(&b"hello"[..]));

    // A second datagram rides the established bridge; skip any echoes the
    // resend loop queued up.
    wg_stub
        .send_to(b"again", ("127.0.0.1", listen_port))
        .await
        .unwrap();
    loop {
        let (payload, _) = recv_datagram(&wg_stub).await;
        if payload == b"again" {
            break;
        }
        assert_eq!(payload, b"hello");
    }

    cancel.cancel();
    let result = timeout(TEST_TIMEOUT, tunnel_task)
        .await
        .expect("client did not stop on cancellation")
        .unwrap();
    assert!(result.unwrap_err().is_cancelled());

    server_cancel.cancel();
}
