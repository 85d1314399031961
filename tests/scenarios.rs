//! End-to-end inbound scenarios against live listeners

use netbot::config::Config;
use netbot::inbound::{HttpListener, InboundListener, MixedListener, Socks5Listener};
use netbot::supervisor::ConnectionRegistry;
use netbot::tunnel::{OutboundMode, Tunnel};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Spawn a TCP echo server, returning its address.
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn direct_tunnel() -> Arc<Tunnel> {
    Arc::new(Tunnel::new(&Config::default(), OutboundMode::Direct).unwrap())
}

async fn wait_bound(listener: &dyn InboundListener) -> SocketAddr {
    for _ in 0..100 {
        if let Some(addr) = listener.bound_addr() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("listener never bound");
}

/// S1: literal SOCKS5 greeting and CONNECT request bytes, then
/// transparent byte flow.
#[tokio::test]
async fn socks5_connect_direct() {
    let echo = spawn_echo_server().await;
    let listener = Arc::new(Socks5Listener::new(
        "127.0.0.1:0".to_string(),
        None,
        direct_tunnel(),
        Arc::new(ConnectionRegistry::new()),
    ));
    let runner = listener.clone();
    tokio::spawn(async move { runner.start().await });
    let addr = wait_bound(listener.as_ref()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();

    // Greeting: version 5, one method, no auth
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut selection = [0u8; 2];
    client.read_exact(&mut selection).await.unwrap();
    assert_eq!(selection, [0x05, 0x00]);

    // CONNECT 127.0.0.1:<echo port>
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x05, 0x00]);
    // Bound address follows: IPv4 (4+2) or IPv6 (16+2)
    let bound_len = match reply[3] {
        0x01 => 6,
        0x04 => 18,
        other => panic!("unexpected atyp {:#04x}", other),
    };
    let mut bound = vec![0u8; bound_len];
    client.read_exact(&mut bound).await.unwrap();

    // Bytes flow transparently through the echo target
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    listener.stop().await.unwrap();
}

/// S2: HTTP CONNECT tunnel established with a 200, then bytes forward.
#[tokio::test]
async fn http_connect_tunnel() {
    let echo = spawn_echo_server().await;
    let listener = Arc::new(HttpListener::new(
        "127.0.0.1:0".to_string(),
        direct_tunnel(),
        Arc::new(ConnectionRegistry::new()),
    ));
    let runner = listener.clone();
    tokio::spawn(async move { runner.start().await });
    let addr = wait_bound(listener.as_ref()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = echo.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    // Read the response head
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        client.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head_text = String::from_utf8(head).unwrap();
    assert!(head_text.starts_with("HTTP/1.1 200"), "got: {}", head_text);

    client.write_all(b"tunnel payload").await.unwrap();
    let mut buf = [0u8; 14];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"tunnel payload");

    listener.stop().await.unwrap();
}

/// The mixed port serves both protocols, sniffed from the first byte.
#[tokio::test]
async fn mixed_port_sniffs_both_protocols() {
    let echo = spawn_echo_server().await;
    let listener = Arc::new(MixedListener::new(
        "127.0.0.1:0".to_string(),
        None,
        direct_tunnel(),
        Arc::new(ConnectionRegistry::new()),
    ));
    let runner = listener.clone();
    tokio::spawn(async move { runner.start().await });
    let addr = wait_bound(listener.as_ref()).await;

    // SOCKS5 client
    {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();
        assert_eq!(selection, [0x05, 0x00]);
    }

    // HTTP client
    {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
            port = echo.port()
        );
        client.write_all(request.as_bytes()).await.unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HTTP/1.1 200");
    }

    listener.stop().await.unwrap();
}

/// An unreachable target turns into a SOCKS5 failure reply, not a hang.
#[tokio::test]
async fn socks5_failure_reply_on_refused_target() {
    // Bind and drop to find a port nothing listens on
    let dead_port = {
        let sock = TcpListener::bind("127.0.0.1:0").await.unwrap();
        sock.local_addr().unwrap().port()
    };

    let listener = Arc::new(Socks5Listener::new(
        "127.0.0.1:0".to_string(),
        None,
        direct_tunnel(),
        Arc::new(ConnectionRegistry::new()),
    ));
    let runner = listener.clone();
    tokio::spawn(async move { runner.start().await });
    let addr = wait_bound(listener.as_ref()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut selection = [0u8; 2];
    client.read_exact(&mut selection).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&dead_port.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_ne!(reply[1], 0x00);

    listener.stop().await.unwrap();
}
