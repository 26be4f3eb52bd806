//! TOML configuration for the bridge binaries.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use nostr::PublicKey;
use serde::{Deserialize, Serialize};

use cvm::{CapabilityPrice, EncryptionMode, NostrServerTransportConfig, ServerInfo};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub nostr: NostrConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NostrConfig {
    /// Private key in nsec or hex format; generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// "optional", "required", or "disabled".
    #[serde(default = "default_encryption_mode")]
    pub mode: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,

    /// Publish discovery events at startup.
    #[serde(default)]
    pub public: bool,

    /// When non-empty, only these pubkeys (hex or npub) may talk to us.
    #[serde(default)]
    pub allowed_pubkeys: Vec<String>,

    /// Capability id → price, emitted as `cap` tags on discovery events.
    #[serde(default)]
    pub pricing: HashMap<String, PricingEntry>,

    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingEntry {
    pub price: String,
    pub currency: String,
}

/// The local MCP server the gateway spawns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_relays() -> Vec<String> {
    vec!["wss://relay.damus.io".to_string()]
}

fn default_encryption_mode() -> String {
    "optional".to_string()
}

fn default_session_timeout_secs() -> u64 {
    300
}

impl Default for NostrConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            relays: default_relays(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            mode: default_encryption_mode(),
        }
    }
}

impl EncryptionConfig {
    pub fn parse_mode(&self) -> anyhow::Result<EncryptionMode> {
        match self.mode.as_str() {
            "optional" => Ok(EncryptionMode::Optional),
            "required" => Ok(EncryptionMode::Required),
            "disabled" => Ok(EncryptionMode::Disabled),
            other => anyhow::bail!("invalid encryption mode: {other}"),
        }
    }
}

impl BridgeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Build the server transport configuration from the `[server]` and
    /// `[encryption]` sections.
    pub fn server_transport_config(&self) -> anyhow::Result<NostrServerTransportConfig> {
        let allowed = if self.server.allowed_pubkeys.is_empty() {
            None
        } else {
            let mut set = HashSet::new();
            for key in &self.server.allowed_pubkeys {
                set.insert(
                    PublicKey::parse(key)
                        .map_err(|e| anyhow::anyhow!("invalid allowed pubkey {key}: {e}"))?,
                );
            }
            Some(set)
        };

        let capability_pricing = self
            .server
            .pricing
            .iter()
            .map(|(capability, entry)| {
                (
                    capability.clone(),
                    CapabilityPrice {
                        price: entry.price.clone(),
                        currency: entry.currency.clone(),
                    },
                )
            })
            .collect();

        Ok(NostrServerTransportConfig {
            server_info: ServerInfo {
                name: self.server.name.clone(),
                about: self.server.about.clone(),
                website: self.server.website.clone(),
                picture: self.server.picture.clone(),
            },
            is_public_server: self.server.public,
            allowed_public_keys: allowed,
            encryption_mode: self.encryption.parse_mode()?,
            capability_pricing,
            session_timeout: std::time::Duration::from_secs(self.server.session_timeout_secs),
        })
    }
}
