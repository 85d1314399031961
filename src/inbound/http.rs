//! HTTP proxy inbound (CONNECT tunnels and absolute-form requests)

use super::InboundListener;
use crate::common::{net, NetAddress};
use crate::supervisor::ConnectionRegistry;
use crate::tunnel::Tunnel;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info};

const INBOUND_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REQUEST_HEADER: usize = 16 * 1024;

/// HTTP proxy listener
pub struct HttpListener {
    listen: String,
    tunnel: Arc<Tunnel>,
    registry: Arc<ConnectionRegistry>,
    running: AtomicBool,
    bound: OnceLock<SocketAddr>,
}

/// A parsed inbound request head plus any bytes past the blank line.
struct RequestHead {
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
    trailing: Vec<u8>,
}

impl HttpListener {
    pub fn new(
        listen: String,
        tunnel: Arc<Tunnel>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        HttpListener {
            listen,
            tunnel,
            registry,
            running: AtomicBool::new(false),
            bound: OnceLock::new(),
        }
    }

    /// Read bytes until the end of headers without losing what follows.
    async fn read_head(stream: &mut TcpStream) -> Result<RequestHead> {
        let mut buf = BytesMut::with_capacity(2048);
        let end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            if buf.len() > MAX_REQUEST_HEADER {
                return Err(Error::framing("request headers too large"));
            }
            let mut chunk = [0u8; 2048];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::connection("client closed before request end"));
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let trailing = buf.split_off(end).to_vec();
        let head = String::from_utf8(buf.to_vec())
            .map_err(|_| Error::framing("request head is not valid UTF-8"))?;

        let mut lines = head.lines();
        let request_line = lines.next().unwrap_or("");
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let uri = parts.next().unwrap_or("").to_string();
        if method.is_empty() || uri.is_empty() || parts.next().is_none() {
            return Err(Error::framing("invalid HTTP request line"));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some(colon) = line.find(':') {
                headers.push((
                    line[..colon].trim().to_lowercase(),
                    line[colon + 1..].trim().to_string(),
                ));
            }
        }

        Ok(RequestHead {
            method,
            uri,
            headers,
            trailing,
        })
    }

    pub(crate) async fn handle_connection(
        tunnel: Arc<Tunnel>,
        registry: Arc<ConnectionRegistry>,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) {
        if let Err(e) =
            Self::process_connection(&tunnel, &registry, &mut stream, peer_addr).await
        {
            debug!("HTTP connection from {} failed: {}", peer_addr, e);
        }
    }

    async fn process_connection(
        tunnel: &Tunnel,
        registry: &Arc<ConnectionRegistry>,
        stream: &mut TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let head = timeout(INBOUND_HANDSHAKE_TIMEOUT, Self::read_head(stream))
            .await
            .map_err(|_| Error::timeout("inbound request timed out"))??;

        if head.method.eq_ignore_ascii_case("CONNECT") {
            Self::handle_connect(tunnel, registry, stream, peer_addr, head).await
        } else {
            Self::handle_plain(tunnel, registry, stream, peer_addr, head).await
        }
    }

    async fn handle_connect(
        tunnel: &Tunnel,
        registry: &Arc<ConnectionRegistry>,
        stream: &mut TcpStream,
        peer_addr: SocketAddr,
        head: RequestHead,
    ) -> Result<()> {
        let (host, port) = split_host_port(&head.uri, 443)?;
        let target = NetAddress::host_port(&host, port)?;
        debug!("HTTP CONNECT {} -> {}", peer_addr, target);

        match tunnel.dial(&target).await {
            Ok(dial) => {
                stream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await?;

                let guard = registry.register(format!("http {} -> {}", peer_addr, target));
                let mut remote = dial.conn;
                if !head.trailing.is_empty() {
                    remote.write_all(&head.trailing).await?;
                }
                let (up, down) = net::relay(stream, &mut remote).await?;
                debug!(
                    "[{}] CONNECT {} -> {} closed (up: {}, down: {})",
                    guard.id(),
                    peer_addr,
                    target,
                    up,
                    down
                );
                Ok(())
            }
            Err(e) => {
                let response = format!(
                    "HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n{}\n",
                    e
                );
                stream.write_all(response.as_bytes()).await?;
                Err(e)
            }
        }
    }

    async fn handle_plain(
        tunnel: &Tunnel,
        registry: &Arc<ConnectionRegistry>,
        stream: &mut TcpStream,
        peer_addr: SocketAddr,
        head: RequestHead,
    ) -> Result<()> {
        let uri = head.uri.strip_prefix("http://").unwrap_or(&head.uri);
        let (host_port, path) = match uri.find('/') {
            Some(idx) => (&uri[..idx], &uri[idx..]),
            None => (uri, "/"),
        };
        let (host, port) = split_host_port(host_port, 80)?;
        let target = NetAddress::host_port(&host, port)?;
        debug!("HTTP {} {} -> {}", head.method, path, target);

        match tunnel.dial(&target).await {
            Ok(dial) => {
                let mut request = format!("{} {} HTTP/1.1\r\n", head.method, path);
                request.push_str(&format!("Host: {}\r\n", host_port));
                for (key, value) in &head.headers {
                    if !is_hop_by_hop_header(key) && key != "host" {
                        request.push_str(&format!("{}: {}\r\n", key, value));
                    }
                }
                request.push_str("Connection: close\r\n\r\n");

                let guard =
                    registry.register(format!("http {} -> {}", peer_addr, target));
                let mut remote = dial.conn;
                remote.write_all(request.as_bytes()).await?;
                if !head.trailing.is_empty() {
                    remote.write_all(&head.trailing).await?;
                }
                let (up, down) = net::relay(stream, &mut remote).await?;
                debug!(
                    "[{}] HTTP {} -> {} closed (up: {}, down: {})",
                    guard.id(),
                    peer_addr,
                    target,
                    up,
                    down
                );
                Ok(())
            }
            Err(e) => {
                let response = format!(
                    "HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n{}\n",
                    e
                );
                stream.write_all(response.as_bytes()).await?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl InboundListener for HttpListener {
    fn name(&self) -> &str {
        "HTTP"
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .map_err(|e| Error::connection(format!("bind {} failed: {}", self.listen, e)))?;
        let addr = listener.local_addr()?;
        let _ = self.bound.set(addr);
        info!("HTTP proxy listening on {}", addr);

        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    net::configure_tcp_stream(&stream);
                    let tunnel = self.tunnel.clone();
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        Self::handle_connection(tunnel, registry, stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        error!("HTTP accept error: {}", e);
                    }
                }
            }
        }

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }
}

/// Split `host[:port]`, defaulting to `default_port`.
fn split_host_port(input: &str, default_port: u16) -> Result<(String, u16)> {
    // Bracketed IPv6 literal
    if let Some(rest) = input.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| Error::address("unterminated IPv6 literal"))?;
        let host = rest[..end].to_string();
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| Error::address("invalid port"))?,
            None => default_port,
        };
        return Ok((host, port));
    }

    match input.rfind(':') {
        Some(idx) if !input[idx + 1..].contains(':') => {
            let port = input[idx + 1..]
                .parse()
                .map_err(|_| Error::address("invalid port"))?;
            Ok((input[..idx].to_string(), port))
        }
        _ => Ok((input.to_string(), default_port)),
    }
}

fn is_hop_by_hop_header(header: &str) -> bool {
    matches!(
        header,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-connection"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.com:443", 80).unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            split_host_port("example.com", 80).unwrap(),
            ("example.com".to_string(), 80)
        );
        assert_eq!(
            split_host_port("[::1]:8080", 80).unwrap(),
            ("::1".to_string(), 8080)
        );
        assert_eq!(split_host_port("[::1]", 80).unwrap(), ("::1".to_string(), 80));
        assert!(split_host_port("example.com:notaport", 80).is_err());
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("connection"));
        assert!(is_hop_by_hop_header("proxy-connection"));
        assert!(!is_hop_by_hop_header("content-type"));
    }
}
