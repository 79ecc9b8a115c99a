// Configuration management for the lanpair CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/lanpair/config.json
// - Linux: ~/.config/lanpair/config.json
// - Windows: %APPDATA%\lanpair\config.json

use anyhow::{Context, Result};
use lanpair_core::relay::{RelayServerConfig, RouterConfig};
use lanpair_core::{
    DEFAULT_DISCOVERY_PORT, DEFAULT_HOST_NAME, DEFAULT_PROBE_WINDOW, DEFAULT_RELAY_PORT,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity used by `chat` when `--id` is not given
    pub identity: Option<String>,

    /// Relay to join when neither `--lan` nor `--host` is given
    pub relay_url: Option<String>,

    /// Emit logs as JSON lines
    pub log_json: bool,

    /// Relay settings
    pub relay: RelaySettings,

    /// Discovery settings
    pub discovery: DiscoverySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// WebSocket port when hosting
    pub port: u16,

    /// Seconds a connection request stays answerable (0 = forever)
    pub request_timeout_secs: u64,

    /// Only relay messages between paired identities
    pub require_pairing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// UDP port probes are sent to and answered on
    pub port: u16,

    /// How long a probe collects replies
    pub window_ms: u64,

    /// Name advertised when hosting
    pub host_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: None,
            relay_url: None,
            log_json: false,
            relay: RelaySettings::default(),
            discovery: DiscoverySettings::default(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_RELAY_PORT,
            request_timeout_secs: 60,
            require_pairing: false,
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            window_ms: DEFAULT_PROBE_WINDOW.as_millis() as u64,
            host_name: DEFAULT_HOST_NAME.to_string(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("lanpair");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    /// Load config from `path`, writing defaults there if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Set a config value (not persisted until saved)
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "identity" => self.identity = non_empty(value),
            "relay_url" => self.relay_url = non_empty(value),
            "log_json" => {
                self.log_json = value.parse().context("Invalid boolean value")?;
            }
            "relay_port" => {
                self.relay.port = value.parse().context("Invalid port number")?;
            }
            "request_timeout_secs" => {
                self.relay.request_timeout_secs = value.parse().context("Invalid number")?;
            }
            "require_pairing" => {
                self.relay.require_pairing = value.parse().context("Invalid boolean value")?;
            }
            "discovery_port" => {
                self.discovery.port = value.parse().context("Invalid port number")?;
            }
            "probe_window_ms" => {
                self.discovery.window_ms = value.parse().context("Invalid number")?;
            }
            "host_name" => {
                anyhow::ensure!(!value.trim().is_empty(), "Host name must not be empty");
                self.discovery.host_name = value.to_string();
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "identity" => self.identity.clone(),
            "relay_url" => self.relay_url.clone(),
            "log_json" => Some(self.log_json.to_string()),
            "relay_port" => Some(self.relay.port.to_string()),
            "request_timeout_secs" => Some(self.relay.request_timeout_secs.to_string()),
            "require_pairing" => Some(self.relay.require_pairing.to_string()),
            "discovery_port" => Some(self.discovery.port.to_string()),
            "probe_window_ms" => Some(self.discovery.window_ms.to_string()),
            "host_name" => Some(self.discovery.host_name.clone()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("identity".to_string(), self.identity.clone().unwrap_or_else(|| "(unset)".to_string())),
            ("relay_url".to_string(), self.relay_url.clone().unwrap_or_else(|| "(discover)".to_string())),
            ("log_json".to_string(), self.log_json.to_string()),
            ("relay_port".to_string(), self.relay.port.to_string()),
            ("request_timeout_secs".to_string(), format!("{}s", self.relay.request_timeout_secs)),
            ("require_pairing".to_string(), self.relay.require_pairing.to_string()),
            ("discovery_port".to_string(), self.discovery.port.to_string()),
            ("probe_window_ms".to_string(), format!("{}ms", self.discovery.window_ms)),
            ("host_name".to_string(), self.discovery.host_name.clone()),
        ]
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            request_timeout: match self.relay.request_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            require_pairing: self.relay.require_pairing,
        }
    }

    pub fn relay_server_config(&self) -> RelayServerConfig {
        RelayServerConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], self.relay.port)),
            ..Default::default()
        }
    }

    pub fn probe_window(&self) -> Duration {
        Duration::from_millis(self.discovery.window_ms)
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
