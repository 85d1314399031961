//! JSON configuration
//!
//! Top-level keys: `general` (listen endpoints, exclusions), `policies`
//! (outbound definitions), `policyGroups` (selection groups) and
//! `replica` (capture/MitM toggles, parsed and validated only). Policy
//! groups are tagged by their `"type"` field; only `select` is known.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub policies: Vec<PolicyConfig>,
    #[serde(rename = "policyGroups")]
    pub policy_groups: Vec<PolicyGroup>,
    pub replica: ReplicaConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GeneralConfig {
    pub socks_listen_address: Option<String>,
    pub socks_listen_port: Option<u16>,
    pub http_listen_address: Option<String>,
    pub http_listen_port: Option<u16>,
    pub mixed_listen_address: Option<String>,
    pub mixed_listen_port: Option<u16>,
    /// Hosts that bypass the proxy entirely
    pub skip_proxy: Vec<String>,
    /// Inbound SOCKS5 credentials (empty = no auth)
    pub socks_username: Option<String>,
    pub socks_password: Option<String>,
}

/// One outbound definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicyConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
    pub port: u16,
    /// Shadowsocks / Trojan password, or upstream proxy password
    pub password: Option<String>,
    /// Shadowsocks AEAD algorithm name
    pub algorithm: Option<String>,
    /// Upstream proxy username, or the VMESS user UUID
    pub username: Option<String>,
    /// VMESS body security: aes-128-gcm | chacha20-poly1305 | none
    pub security: Option<String>,
    pub sni: Option<String>,
    pub skip_cert_verify: bool,
    /// Wrap the outbound in a WebSocket transport
    pub ws: bool,
    pub ws_path: Option<String>,
    pub ws_host: Option<String>,
    /// Accepted but not served (UDP relay is out of scope)
    pub udp_relay: bool,
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("policy requires a name"));
        }
        match self.kind.as_str() {
            "direct" => Ok(()),
            "shadowsocks" | "ss" => {
                self.require_endpoint()?;
                if self.password.is_none() {
                    return Err(Error::config(format!("{}: shadowsocks requires password", self.name)));
                }
                if self.algorithm.is_none() {
                    return Err(Error::config(format!("{}: shadowsocks requires algorithm", self.name)));
                }
                Ok(())
            }
            "vmess" => {
                self.require_endpoint()?;
                if self.username.is_none() {
                    return Err(Error::config(format!("{}: vmess requires username (uuid)", self.name)));
                }
                Ok(())
            }
            "trojan" => {
                self.require_endpoint()?;
                if self.password.is_none() {
                    return Err(Error::config(format!("{}: trojan requires password", self.name)));
                }
                Ok(())
            }
            "http" | "socks5" => self.require_endpoint(),
            other => Err(Error::config(format!(
                "{}: unknown policy type \"{}\"",
                self.name, other
            ))),
        }
    }

    fn require_endpoint(&self) -> Result<()> {
        if self.address.is_empty() || self.port == 0 {
            return Err(Error::config(format!(
                "{}: policy requires address and port",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPolicyGroup {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default)]
    policies: Vec<String>,
}

/// Policy selection group, tagged by its JSON `"type"` field.
///
/// Modeled as a closed enum with room for future variants; anything but
/// `select` is refused at decode time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawPolicyGroup", into = "SerializedPolicyGroup")]
pub enum PolicyGroup {
    Select { name: String, policies: Vec<String> },
}

impl PolicyGroup {
    pub fn name(&self) -> &str {
        match self {
            PolicyGroup::Select { name, .. } => name,
        }
    }

    pub fn policies(&self) -> &[String] {
        match self {
            PolicyGroup::Select { policies, .. } => policies,
        }
    }
}

impl TryFrom<RawPolicyGroup> for PolicyGroup {
    type Error = String;

    fn try_from(raw: RawPolicyGroup) -> std::result::Result<Self, String> {
        match raw.kind.as_str() {
            "select" => Ok(PolicyGroup::Select {
                name: raw.name,
                policies: raw.policies,
            }),
            other => Err(format!("UnknownPolicyGroupType: \"{}\"", other)),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SerializedPolicyGroup {
    #[serde(rename = "type")]
    kind: &'static str,
    name: String,
    policies: Vec<String>,
}

impl From<PolicyGroup> for SerializedPolicyGroup {
    fn from(group: PolicyGroup) -> Self {
        match group {
            PolicyGroup::Select { name, policies } => SerializedPolicyGroup {
                kind: "select",
                name,
                policies,
            },
        }
    }
}

/// Capture / MitM toggles. The core validates and ignores these.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplicaConfig {
    pub enable_http_capture: bool,
    pub enable_mitm: bool,
    pub req_msg_filter: Option<String>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for policy in &self.policies {
            policy.validate()?;
        }
        for group in &self.policy_groups {
            for member in group.policies() {
                if !self.policies.iter().any(|p| &p.name == member) {
                    return Err(Error::config(format!(
                        "policy group {} references unknown policy {}",
                        group.name(),
                        member
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn policy(&self, name: &str) -> Option<&PolicyConfig> {
        self.policies.iter().find(|p| p.name == name)
    }

    /// The policy a `rule`/`proxy` outbound mode resolves to: the first
    /// member of the first selection group, else the first policy.
    pub fn selected_policy(&self) -> Option<&PolicyConfig> {
        if let Some(group) = self.policy_groups.first() {
            if let Some(first) = group.policies().first() {
                return self.policy(first);
            }
        }
        self.policies.first()
    }
}

/// Location of the GeoIP database (presence-only interface).
pub fn geoip_database_path() -> PathBuf {
    let base = std::env::var_os("APP_SUPPORT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("io.tenbits.Netbot").join("GeoLite2-Country.mmdb")
}

pub fn geoip_database_present() -> bool {
    geoip_database_path().is_file()
}
