//! SOCKS5 outbound (RFC 1928 client role)

use super::{connect_server, DialResult, OutboundProxy, ProxyType, HANDSHAKE_TIMEOUT};
use crate::common::NetAddress;
use crate::config::PolicyConfig;
use crate::socks::handshake::{self, ClientAuth};
use crate::{Error, Result};
use async_trait::async_trait;
use tokio::time::timeout;
use tracing::debug;

pub struct Socks5Proxy {
    name: String,
    server: String,
    port: u16,
    auth: Option<ClientAuth>,
}

impl Socks5Proxy {
    pub fn new(
        name: String,
        server: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        let auth = match (username, password) {
            (Some(username), Some(password)) => Some(ClientAuth { username, password }),
            _ => None,
        };
        Socks5Proxy {
            name,
            server,
            port,
            auth,
        }
    }

    pub fn from_policy(policy: &PolicyConfig) -> Result<Self> {
        Ok(Socks5Proxy::new(
            policy.name.clone(),
            policy.address.clone(),
            policy.port,
            policy.username.clone(),
            policy.password.clone(),
        ))
    }
}

#[async_trait]
impl OutboundProxy for Socks5Proxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Socks5
    }

    async fn dial_tcp(&self, target: &NetAddress) -> Result<DialResult> {
        debug!(
            "[{}] SOCKS5 connecting to {} via {}:{}",
            self.name, target, self.server, self.port
        );
        let mut stream = connect_server(&self.server, self.port).await?;
        let local = stream.local_addr().ok();
        timeout(
            HANDSHAKE_TIMEOUT,
            handshake::connect(&mut stream, target, self.auth.as_ref()),
        )
        .await
        .map_err(|_| Error::timeout("SOCKS5 handshake timed out"))??;

        debug!("[{}] tunnel to {} established", self.name, target);
        Ok(DialResult::new(Box::new(stream), local))
    }
}
