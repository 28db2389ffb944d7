//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// HTTP listen address
    pub http_listen: String,

    /// Run privileged commands under sudo
    pub use_sudo: bool,

    /// Tunnel device configuration
    pub tunnel: TunnelConfig,

    /// Account defaults
    pub accounts: AccountConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: wgmint_common::default_store_path(),
            http_listen: "0.0.0.0:8000".to_string(),
            use_sudo: true,
            tunnel: TunnelConfig::default(),
            accounts: AccountConfig::default(),
        }
    }
}

/// Tunnel device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// MTU assigned to created interfaces
    pub mtu: u32,

    /// UDP listen port assigned to newly created devices
    pub listen_port: u16,

    /// Uplink interface carrying masqueraded peer traffic
    pub uplink_interface: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            mtu: 1420,
            listen_port: 123,
            uplink_interface: "eth0".to_string(),
        }
    }
}

/// Defaults applied to newly created accounts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Peer quota for accounts minted via the API
    pub default_peer_limit: i64,

    /// Account validity in days from creation
    pub validity_days: i64,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            default_peer_limit: 7,
            validity_days: 3650,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_roundtrip() {
        let config = DaemonConfig::default();
        assert_eq!(config.tunnel.mtu, 1420);
        assert_eq!(config.accounts.default_peer_limit, 7);

        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed: DaemonConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.tunnel.uplink_interface, "eth0");
        assert_eq!(parsed.accounts.validity_days, 3650);
    }
}
