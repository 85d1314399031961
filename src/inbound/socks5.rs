//! SOCKS5 inbound listener

use super::InboundListener;
use crate::common::{net, NetAddress};
use crate::socks::handshake::{self, ServerAuth};
use crate::socks::{Reply, REP_CONNECTION_REFUSED, REP_GENERAL_FAILURE, REP_NETWORK_UNREACHABLE};
use crate::supervisor::ConnectionRegistry;
use crate::tunnel::Tunnel;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info};

const INBOUND_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// SOCKS5 proxy listener
pub struct Socks5Listener {
    listen: String,
    auth: Option<ServerAuth>,
    tunnel: Arc<Tunnel>,
    registry: Arc<ConnectionRegistry>,
    running: AtomicBool,
    bound: OnceLock<SocketAddr>,
}

impl Socks5Listener {
    pub fn new(
        listen: String,
        auth: Option<ServerAuth>,
        tunnel: Arc<Tunnel>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Socks5Listener {
            listen,
            auth,
            tunnel,
            registry,
            running: AtomicBool::new(false),
            bound: OnceLock::new(),
        }
    }

    pub(crate) async fn handle_connection(
        tunnel: Arc<Tunnel>,
        registry: Arc<ConnectionRegistry>,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        auth: Option<ServerAuth>,
    ) {
        if let Err(e) =
            Self::process_connection(&tunnel, &registry, &mut stream, peer_addr, auth).await
        {
            debug!("SOCKS5 connection from {} failed: {}", peer_addr, e);
        }
    }

    async fn process_connection(
        tunnel: &Tunnel,
        registry: &Arc<ConnectionRegistry>,
        stream: &mut TcpStream,
        peer_addr: SocketAddr,
        auth: Option<ServerAuth>,
    ) -> Result<()> {
        // Greeting + address negotiation under the handshake deadline
        let target = timeout(
            INBOUND_HANDSHAKE_TIMEOUT,
            handshake::serve(stream, auth.as_ref()),
        )
        .await
        .map_err(|_| Error::timeout("inbound handshake timed out"))??;

        debug!("SOCKS5 {} CONNECT {}", peer_addr, target);

        match tunnel.dial(&target).await {
            Ok(dial) => {
                let bound = dial
                    .local_addr
                    .or_else(|| stream.local_addr().ok())
                    .map(|addr| NetAddress::from_ip(addr.ip(), addr.port()))
                    .unwrap_or(NetAddress::Ipv4(std::net::Ipv4Addr::UNSPECIFIED, 0));

                Reply::success(bound).write_to(stream).await?;

                let guard = registry.register(format!("socks5 {} -> {}", peer_addr, target));
                let mut remote = dial.conn;
                let (up, down) = net::relay(stream, &mut remote).await?;
                debug!(
                    "[{}] SOCKS5 {} -> {} closed (up: {}, down: {})",
                    guard.id(),
                    peer_addr,
                    target,
                    up,
                    down
                );
                Ok(())
            }
            Err(e) => {
                let code = match &e {
                    Error::Connection(msg) if msg.contains("refused") => REP_CONNECTION_REFUSED,
                    Error::Connection(msg) if msg.contains("unreachable") => {
                        REP_NETWORK_UNREACHABLE
                    }
                    _ => REP_GENERAL_FAILURE,
                };
                Reply::failure(code).write_to(stream).await?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl InboundListener for Socks5Listener {
    fn name(&self) -> &str {
        "SOCKS5"
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .map_err(|e| Error::connection(format!("bind {} failed: {}", self.listen, e)))?;
        let addr = listener.local_addr()?;
        let _ = self.bound.set(addr);
        info!("SOCKS5 proxy listening on {}", addr);

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
                        error!("SOCKS5 accept error: {}", e);
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
