// CLI configuration
//
// Stored as JSON in the platform config directory:
// - Linux/macOS: ~/.config/hushlink/config.json
// - Windows: %APPDATA%\hushlink\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Seed nodes dialed on startup, as host:port strings.
    pub bootstrap_nodes: Vec<String>,

    /// Listening port; 0 picks an ephemeral port.
    pub listen_port: u16,

    /// Username published to the DHT.
    pub username: Option<String>,

    /// Externally reachable IP advertised to peers.
    pub advertised_ip: Option<String>,
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let base = dirs::config_dir().context("no config directory on this platform")?;
        Ok(base.join("hushlink"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    pub fn credential_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("identity.cred"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, raw)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_json() {
        let config = Config {
            bootstrap_nodes: vec!["198.51.100.7:40040".to_string()],
            listen_port: 40040,
            username: Some("alice".to_string()),
            advertised_ip: Some("198.51.100.8".to_string()),
        };
        let raw = serde_json::to_string(&config).unwrap();
        let restored: Config = serde_json::from_str(&raw).unwrap();
        assert_eq!(restored.listen_port, 40040);
        assert_eq!(restored.bootstrap_nodes.len(), 1);
        assert_eq!(restored.username.as_deref(), Some("alice"));
    }
}
