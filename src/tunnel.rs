//! Tunnel core: routes inbound connections to the selected outbound

use crate::common::NetAddress;
use crate::config::Config;
use crate::outbound::{DialResult, ProxyRegistry};
use crate::{Error, Result};
use tracing::debug;

/// How inbound traffic leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundMode {
    /// Everything dials the target directly.
    Direct,
    /// Everything goes through the selected policy.
    Proxy,
    /// Selected policy with the `skipProxy` exclusion list honored.
    Rule,
}

impl Default for OutboundMode {
    fn default() -> Self {
        OutboundMode::Rule
    }
}

impl TryFrom<&str> for OutboundMode {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(OutboundMode::Direct),
            "proxy" => Ok(OutboundMode::Proxy),
            "rule" => Ok(OutboundMode::Rule),
            other => Err(Error::config(format!("unknown outbound mode: {}", other))),
        }
    }
}

/// Routes each connection to DIRECT or the configured policy.
pub struct Tunnel {
    registry: ProxyRegistry,
    mode: OutboundMode,
    selected: Option<String>,
    skip_proxy: Vec<String>,
}

impl Tunnel {
    pub fn new(config: &Config, mode: OutboundMode) -> Result<Self> {
        let registry = ProxyRegistry::new(&config.policies)?;
        let selected = config.selected_policy().map(|p| p.name.clone());

        // Rule mode falls back to DIRECT when nothing is configured;
        // proxy mode is an explicit request for a policy.
        if mode == OutboundMode::Proxy && selected.is_none() {
            return Err(Error::config(
                "proxy outbound mode requires at least one configured policy",
            ));
        }

        Ok(Tunnel {
            registry,
            mode,
            selected,
            skip_proxy: config.general.skip_proxy.clone(),
        })
    }

    /// Whether `host` matches the exclusion list (exact, or `*.suffix`).
    fn bypassed(&self, host: &str) -> bool {
        self.skip_proxy.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix("*.") {
                host == suffix || host.ends_with(&format!(".{}", suffix))
            } else {
                host == pattern
            }
        })
    }

    fn resolve(&self, target: &NetAddress) -> &str {
        match self.mode {
            OutboundMode::Direct => "DIRECT",
            OutboundMode::Proxy => self.selected.as_deref().unwrap_or("DIRECT"),
            OutboundMode::Rule => {
                if self.bypassed(&target.host()) {
                    "DIRECT"
                } else {
                    self.selected.as_deref().unwrap_or("DIRECT")
                }
            }
        }
    }

    /// Dial `target` through whichever outbound the mode selects.
    pub async fn dial(&self, target: &NetAddress) -> Result<DialResult> {
        let name = self.resolve(target);
        debug!("{} -> via {}", target, name);
        let proxy = self
            .registry
            .get(name)
            .ok_or_else(|| Error::config(format!("policy not found: {}", name)))?;
        proxy.dial_tcp(target).await
    }

    pub fn mode(&self) -> OutboundMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeneralConfig;

    fn tunnel_with_skip(skip: Vec<String>) -> Tunnel {
        let config = Config {
            general: GeneralConfig {
                skip_proxy: skip,
                ..Default::default()
            },
            ..Default::default()
        };
        Tunnel::new(&config, OutboundMode::Direct).unwrap()
    }

    #[test]
    fn test_outbound_mode_parsing() {
        assert_eq!(OutboundMode::try_from("direct").unwrap(), OutboundMode::Direct);
        assert_eq!(OutboundMode::try_from("proxy").unwrap(), OutboundMode::Proxy);
        assert_eq!(OutboundMode::try_from("rule").unwrap(), OutboundMode::Rule);
        assert!(OutboundMode::try_from("global").is_err());
    }

    #[test]
    fn test_bypass_patterns() {
        let tunnel = tunnel_with_skip(vec!["localhost".into(), "*.local".into()]);
        assert!(tunnel.bypassed("localhost"));
        assert!(tunnel.bypassed("printer.local"));
        assert!(tunnel.bypassed("local"));
        assert!(!tunnel.bypassed("example.com"));
        assert!(!tunnel.bypassed("notlocal"));
    }

    #[test]
    fn test_proxy_mode_requires_policy() {
        let config = Config::default();
        assert!(Tunnel::new(&config, OutboundMode::Proxy).is_err());
        assert!(Tunnel::new(&config, OutboundMode::Direct).is_ok());
        assert!(Tunnel::new(&config, OutboundMode::Rule).is_ok());
    }
}
