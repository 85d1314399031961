//! Netbot - user-space multi-protocol proxy
//!
//! Accepts local SOCKS5 / HTTP CONNECT clients and tunnels them through
//! a remote server speaking Shadowsocks (AEAD), VMESS (AEAD header +
//! masked body framing), Trojan (TLS), or plain HTTP/SOCKS5 upstreams.
//!
//! # Architecture
//!
//! ```text
//!  +-----------+     +-----------+     +-------------------+
//!  |  inbound/ | --> |  tunnel   | --> |     outbound/     |
//!  | (listeners)     | (routing) |     | ss / vmess / ...  |
//!  +-----------+     +-----------+     +---------+---------+
//!        |                                       |
//!  +-----v------+    +----------+      +---------v---------+
//!  | supervisor |    | pipeline |      | crypto/ transport/|
//!  | (lifecycle)|    | (chains) |      |  (primitives, ws) |
//!  +------------+    +----------+      +-------------------+
//! ```

pub mod common;
pub mod config;
pub mod crypto;
pub mod inbound;
pub mod outbound;
pub mod pipeline;
pub mod socks;
pub mod supervisor;
pub mod transport;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::Config;
pub use tunnel::{OutboundMode, Tunnel};

use inbound::{HttpListener, MixedListener, Socks5Listener};
use socks::handshake::ServerAuth;
use std::sync::Arc;
use supervisor::{ConnectionRegistry, Supervisor};
use tracing::info;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Listen endpoints taken from the command line, overriding the
/// configuration file.
#[derive(Debug, Clone, Default)]
pub struct ListenOverrides {
    pub socks_address: Option<String>,
    pub socks_port: Option<u16>,
    pub http_address: Option<String>,
    pub http_port: Option<u16>,
}

/// Application instance wiring config, tunnel and listeners together.
pub struct App {
    supervisor: Supervisor,
}

impl App {
    pub fn new(config: Config, mode: OutboundMode, overrides: ListenOverrides) -> Result<Self> {
        info!("initializing netbot v{}", VERSION);

        if config::geoip_database_present() {
            info!("GeoIP database found at {}", config::geoip_database_path().display());
        }

        let tunnel = Arc::new(Tunnel::new(&config, mode)?);
        let registry = Arc::new(ConnectionRegistry::new());
        let mut supervisor = Supervisor::new(registry.clone());

        let socks_auth = match (
            &config.general.socks_username,
            &config.general.socks_password,
        ) {
            (Some(username), Some(password)) => Some(ServerAuth {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };

        let socks_port = overrides.socks_port.or(config.general.socks_listen_port);
        if let Some(port) = socks_port {
            let address = overrides
                .socks_address
                .clone()
                .or_else(|| config.general.socks_listen_address.clone())
                .unwrap_or_else(|| "127.0.0.1".to_string());
            supervisor.add_listener(Arc::new(Socks5Listener::new(
                format!("{}:{}", address, port),
                socks_auth.clone(),
                tunnel.clone(),
                registry.clone(),
            )));
        }

        let http_port = overrides.http_port.or(config.general.http_listen_port);
        if let Some(port) = http_port {
            let address = overrides
                .http_address
                .clone()
                .or_else(|| config.general.http_listen_address.clone())
                .unwrap_or_else(|| "127.0.0.1".to_string());
            supervisor.add_listener(Arc::new(HttpListener::new(
                format!("{}:{}", address, port),
                tunnel.clone(),
                registry.clone(),
            )));
        }

        if let Some(port) = config.general.mixed_listen_port {
            let address = config
                .general
                .mixed_listen_address
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string());
            supervisor.add_listener(Arc::new(MixedListener::new(
                format!("{}:{}", address, port),
                socks_auth,
                tunnel.clone(),
                registry,
            )));
        }

        info!(
            "configured {} inbound listener(s), outbound mode {:?}",
            supervisor.listener_count(),
            mode
        );

        Ok(App { supervisor })
    }

    /// Run all listeners until shutdown.
    pub async fn run(&self) -> Result<()> {
        self.supervisor.run().await
    }
}
