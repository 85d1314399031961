//! Outbound adapters (proxy protocols)

mod direct;
mod http;
mod shadowsocks;
mod socks5;
mod trojan;
pub mod vmess;

pub use direct::Direct;
pub use http::HttpProxy;
pub use shadowsocks::Shadowsocks;
pub use socks5::Socks5Proxy;
pub use trojan::Trojan;
pub use vmess::Vmess;

use crate::common::NetAddress;
use crate::config::PolicyConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

/// Deadline for connect + protocol handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Proxy type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyType {
    Direct,
    Shadowsocks,
    Vmess,
    Trojan,
    Http,
    Socks5,
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyType::Direct => write!(f, "Direct"),
            ProxyType::Shadowsocks => write!(f, "Shadowsocks"),
            ProxyType::Vmess => write!(f, "VMESS"),
            ProxyType::Trojan => write!(f, "Trojan"),
            ProxyType::Http => write!(f, "HTTP"),
            ProxyType::Socks5 => write!(f, "SOCKS5"),
        }
    }
}

impl TryFrom<&str> for ProxyType {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(ProxyType::Direct),
            "ss" | "shadowsocks" => Ok(ProxyType::Shadowsocks),
            "vmess" => Ok(ProxyType::Vmess),
            "trojan" => Ok(ProxyType::Trojan),
            "http" => Ok(ProxyType::Http),
            "socks5" | "socks" => Ok(ProxyType::Socks5),
            other => Err(Error::config(format!("unknown proxy type: {}", other))),
        }
    }
}

/// An established tunnel plus the bound address of the socket behind it
/// (reported back in the SOCKS5 success reply).
pub struct DialResult {
    pub conn: Box<dyn ProxyConnection>,
    pub local_addr: Option<SocketAddr>,
}

impl DialResult {
    pub fn new(conn: Box<dyn ProxyConnection>, local_addr: Option<SocketAddr>) -> Self {
        DialResult { conn, local_addr }
    }
}

/// Trait for outbound proxies
#[async_trait]
pub trait OutboundProxy: Send + Sync {
    /// Policy name
    fn name(&self) -> &str;

    /// Protocol kind
    fn proxy_type(&self) -> ProxyType;

    /// Dial a TCP tunnel to `target` through this proxy
    async fn dial_tcp(&self, target: &NetAddress) -> Result<DialResult>;
}

/// Trait alias for tunnel connections
pub trait ProxyConnection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProxyConnection for T {}

/// Connect to a proxy server endpoint with the handshake deadline applied.
pub(crate) async fn connect_server(server: &str, port: u16) -> Result<TcpStream> {
    let addr = format!("{}:{}", server, port);
    let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::timeout(format!("connect to {} timed out", addr)))?
        .map_err(|e| Error::connection(format!("connect to {} failed: {}", addr, e)))?;
    crate::common::net::configure_tcp_stream(&stream);
    Ok(stream)
}

/// Registry of configured outbounds by policy name
pub struct ProxyRegistry {
    proxies: HashMap<String, Arc<dyn OutboundProxy>>,
}

impl ProxyRegistry {
    pub fn new(policies: &[PolicyConfig]) -> Result<Self> {
        let mut proxies: HashMap<String, Arc<dyn OutboundProxy>> = HashMap::new();
        proxies.insert("DIRECT".to_string(), Arc::new(Direct::new()));

        for policy in policies {
            if policy.udp_relay {
                // The flag is accepted, but UDP relay is not served
                warn!("{}: udpRelay requested, only TCP tunnels are served", policy.name);
            }
            let proxy = Self::create_proxy(policy)?;
            proxies.insert(policy.name.clone(), proxy);
        }

        Ok(ProxyRegistry { proxies })
    }

    fn create_proxy(policy: &PolicyConfig) -> Result<Arc<dyn OutboundProxy>> {
        match ProxyType::try_from(policy.kind.as_str())? {
            ProxyType::Direct => Ok(Arc::new(Direct::new())),
            ProxyType::Shadowsocks => Ok(Arc::new(Shadowsocks::from_policy(policy)?)),
            ProxyType::Vmess => Ok(Arc::new(Vmess::from_policy(policy)?)),
            ProxyType::Trojan => Ok(Arc::new(Trojan::from_policy(policy)?)),
            ProxyType::Http => Ok(Arc::new(HttpProxy::from_policy(policy)?)),
            ProxyType::Socks5 => Ok(Arc::new(Socks5Proxy::from_policy(policy)?)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn OutboundProxy>> {
        self.proxies.get(name)
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_type_parsing() {
        assert_eq!(ProxyType::try_from("ss").unwrap(), ProxyType::Shadowsocks);
        assert_eq!(ProxyType::try_from("vmess").unwrap(), ProxyType::Vmess);
        assert_eq!(ProxyType::try_from("trojan").unwrap(), ProxyType::Trojan);
        assert!(ProxyType::try_from("snell").is_err());
        assert!(ProxyType::try_from("reject").is_err());
    }

    #[test]
    fn test_registry_accepts_udp_relay_flag() {
        use crate::config::PolicyConfig;

        // The bit parses and the registry still builds; only TCP is served
        let policy = PolicyConfig {
            name: "up".into(),
            kind: "socks5".into(),
            address: "upstream.example.com".into(),
            port: 1080,
            udp_relay: true,
            ..Default::default()
        };
        let registry = ProxyRegistry::new(&[policy]).unwrap();
        assert!(registry.get("up").is_some());
    }

    #[test]
    fn test_registry_has_direct() {
        let registry = ProxyRegistry::new(&[]).unwrap();
        assert!(registry.get("DIRECT").is_some());
        assert_eq!(registry.len(), 1);
    }
}
