//! Inbound adapters (listeners)

mod http;
mod mixed;
mod socks5;

pub use http::HttpListener;
pub use mixed::MixedListener;
pub use socks5::Socks5Listener;

use crate::Result;
use async_trait::async_trait;
use std::net::SocketAddr;

/// Trait for inbound listeners
#[async_trait]
pub trait InboundListener: Send + Sync {
    /// Listener name for logs
    fn name(&self) -> &str;

    /// Bind and accept until stopped
    async fn start(&self) -> Result<()>;

    /// Signal the accept loop to stop
    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// The address actually bound, available once `start` has bound.
    fn bound_addr(&self) -> Option<SocketAddr> {
        None
    }
}
