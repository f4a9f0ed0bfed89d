//! Configuration file for the `drover` binary
//!
//! YAML on disk, overridden by command-line flags and `DROVER_*` environment variables.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use drover_control::{ControlConfig, ControlKey, ControlTimeouts, ServerRegistry, ServerState};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Communications port shared by agents and the listener
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Shared key as a raw string; its UTF-8 bytes are the AES key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Environment variable holding the raw key (prefer over `key`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_env: Option<String>,

    /// Shared key, base64 encoded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_base64: Option<String>,

    #[serde(default)]
    pub timeouts: TimeoutsFile,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_connections: Option<usize>,

    /// Servers fronted by agents
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

/// Optional timeout overrides, in seconds
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TimeoutsFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_wait_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_attempts: Option<usize>,
}

impl TimeoutsFile {
    fn resolve(&self) -> Result<ControlTimeouts> {
        let defaults = ControlTimeouts::default();
        let timeouts = ControlTimeouts {
            connect: self.connect_secs.map(Duration::from_secs).unwrap_or(defaults.connect),
            read: self.read_secs.map(Duration::from_secs).unwrap_or(defaults.read),
            stop_wait: self
                .stop_wait_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.stop_wait),
            send_attempts: self.send_attempts.unwrap_or(defaults.send_attempts),
        };

        if timeouts.send_attempts == 0 {
            anyhow::bail!("timeouts.send_attempts must be at least 1");
        }
        Ok(timeouts)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub address: IpAddr,

    #[serde(default = "default_available")]
    pub available: bool,

    /// Initial lifecycle state (defaults to unavailable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

fn default_available() -> bool {
    true
}

impl ServerEntry {
    fn initial_state(&self) -> Result<ServerState> {
        match &self.state {
            Some(state) => state
                .parse::<ServerState>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Invalid state for server {}", self.address)),
            None => Ok(ServerState::default()),
        }
    }
}

/// Values given on the command line, which win over the file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub port: Option<u16>,
    pub key: Option<String>,
}

/// Fully resolved settings
#[derive(Debug)]
pub struct Settings {
    pub control: ControlConfig,
    pub servers: Vec<ServerEntry>,
}

impl Settings {
    /// Build a registry holding every configured server
    pub fn registry(&self) -> Result<ServerRegistry> {
        let registry = ServerRegistry::new();
        for entry in &self.servers {
            let state = entry.initial_state()?;
            debug!(server = %entry.address, %state, available = entry.available, "Registering server");
            registry.register(entry.address, state, entry.available);
        }
        Ok(registry)
    }
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI values with the config file, giving precedence to the CLI
pub fn build_settings(file: Option<ConfigFile>, overrides: Overrides) -> Result<Settings> {
    let file = file.unwrap_or_default();

    let port = overrides
        .port
        .or(file.port)
        .ok_or_else(|| anyhow::anyhow!("Communications port is required (use --port or config file)"))?;
    if port == 0 {
        anyhow::bail!("Communications port must not be 0");
    }

    let key = resolve_key(&file, overrides.key)?;
    let timeouts = file.timeouts.resolve()?;

    let mut control = ControlConfig::new(port, key).with_timeouts(timeouts);
    if let Some(max) = file.max_concurrent_connections {
        control = control.with_max_concurrent_connections(max);
    }

    // Surface bad states now rather than at registration
    for entry in &file.servers {
        entry.initial_state()?;
    }

    info!(port, servers = file.servers.len(), "Configuration loaded");

    Ok(Settings {
        control,
        servers: file.servers,
    })
}

fn resolve_key(file: &ConfigFile, cli_key: Option<String>) -> Result<ControlKey> {
    let bytes = if let Some(key) = cli_key {
        key.into_bytes()
    } else if let Some(env_var) = &file.key_env {
        std::env::var(env_var)
            .with_context(|| format!("Environment variable {} not set", env_var))?
            .into_bytes()
    } else if let Some(key) = &file.key {
        key.clone().into_bytes()
    } else if let Some(encoded) = &file.key_base64 {
        STANDARD
            .decode(encoded.trim())
            .context("Failed to decode key_base64")?
    } else {
        anyhow::bail!("Shared key is required (use --key, key, key_env or key_base64)");
    };

    ControlKey::new(bytes).context("Invalid shared key")
}
