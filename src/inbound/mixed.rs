//! Mixed inbound (SOCKS5 and HTTP on one port)
//!
//! The first byte decides: 0x05 is a SOCKS5 greeting, anything else is
//! treated as HTTP. Detection peeks, so the dedicated handlers see the
//! stream from its first byte.

use super::InboundListener;
use crate::common::net;
use crate::socks::handshake::ServerAuth;
use crate::socks::SOCKS5_VERSION;
use crate::supervisor::ConnectionRegistry;
use crate::tunnel::Tunnel;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Mixed port listener
pub struct MixedListener {
    listen: String,
    auth: Option<ServerAuth>,
    tunnel: Arc<Tunnel>,
    registry: Arc<ConnectionRegistry>,
    running: AtomicBool,
    bound: OnceLock<SocketAddr>,
}

impl MixedListener {
    pub fn new(
        listen: String,
        auth: Option<ServerAuth>,
        tunnel: Arc<Tunnel>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        MixedListener {
            listen,
            auth,
            tunnel,
            registry,
            running: AtomicBool::new(false),
            bound: OnceLock::new(),
        }
    }

    async fn handle_connection(
        tunnel: Arc<Tunnel>,
        registry: Arc<ConnectionRegistry>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        auth: Option<ServerAuth>,
    ) {
        let mut peek = [0u8; 1];
        match stream.peek(&mut peek).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        if peek[0] == SOCKS5_VERSION {
            debug!("mixed port: SOCKS5 from {}", peer_addr);
            super::socks5::Socks5Listener::handle_connection(
                tunnel, registry, stream, peer_addr, auth,
            )
            .await;
        } else {
            debug!("mixed port: HTTP from {}", peer_addr);
            super::http::HttpListener::handle_connection(tunnel, registry, stream, peer_addr)
                .await;
        }
    }
}

#[async_trait]
impl InboundListener for MixedListener {
    fn name(&self) -> &str {
        "Mixed"
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .map_err(|e| Error::connection(format!("bind {} failed: {}", self.listen, e)))?;
        let addr = listener.local_addr()?;
        let _ = self.bound.set(addr);
        info!("mixed proxy listening on {}", addr);

        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    net::configure_tcp_stream(&stream);
                    let tunnel = self.tunnel.clone();
                    let registry = self.registry.clone();
                    let auth = self.auth.clone();
                    tokio::spawn(async move {
                        Self::handle_connection(tunnel, registry, stream, peer_addr, auth).await;
                    });
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        error!("mixed accept error: {}", e);
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
