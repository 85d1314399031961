//! Direct outbound (no proxy)

use super::{connect_server, DialResult, OutboundProxy, ProxyType};
use crate::common::NetAddress;
use crate::Result;
use async_trait::async_trait;
use tracing::debug;

pub struct Direct {
    name: String,
}

impl Direct {
    pub fn new() -> Self {
        Direct {
            name: "DIRECT".to_string(),
        }
    }
}

impl Default for Direct {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboundProxy for Direct {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Direct
    }

    async fn dial_tcp(&self, target: &NetAddress) -> Result<DialResult> {
        debug!("DIRECT connecting to {}", target);
        let stream = connect_server(&target.host(), target.port()).await?;
        let local = stream.local_addr().ok();
        Ok(DialResult::new(Box::new(stream), local))
    }
}
