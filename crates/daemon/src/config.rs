use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub tracker: TrackerSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// Idle time after which a session is closed. Kept configurable; some
    /// deployments want this as low as 60s.
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
    /// Activity pings inside this window are coalesced into one update.
    #[serde(default = "default_activity_debounce")]
    pub activity_debounce_secs: u64,
    /// Periodic safety-net sync interval.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Delivery attempts per queue item before it is parked.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            idle_threshold_secs: default_idle_threshold(),
            reaper_interval_secs: default_reaper_interval(),
            activity_debounce_secs: default_activity_debounce(),
            sync_interval_secs: default_sync_interval(),
            max_attempts: default_max_attempts(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageSettings {
    /// Override for the state document path.
    #[serde(default)]
    pub state_path: Option<String>,
    /// Override for the intake socket path.
    #[serde(default)]
    pub socket_path: Option<String>,
}

fn default_idle_threshold() -> u64 {
    300
}

fn default_reaper_interval() -> u64 {
    30
}

fn default_activity_debounce() -> u64 {
    5
}

fn default_sync_interval() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_server_url() -> String {
    "https://revclock.dev".to_string()
}

/// Get the config directory path
pub fn config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .context("Could not determine home directory")?;
    Ok(PathBuf::from(home).join(".config").join("revclock"))
}

/// Get the daemon config file path
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("daemon.toml"))
}

/// Get the PID file path
pub fn pid_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("daemon.pid"))
}

/// Default path of the durable state document
pub fn default_state_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("state.json"))
}

/// Default path of the intake socket
pub fn default_socket_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("daemon.sock"))
}

/// Load daemon config from disk, or defaults when no file exists
pub fn load_config(path: Option<&Path>) -> Result<DaemonConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_path()?,
    };
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read daemon config at {}", path.display()))?;
    let config: DaemonConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse daemon config at {}", path.display()))?;
    Ok(config)
}

impl DaemonConfig {
    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.storage.state_path {
            Some(p) => Ok(PathBuf::from(p)),
            None => default_state_path(),
        }
    }

    pub fn socket_path(&self) -> Result<PathBuf> {
        match &self.storage.socket_path {
            Some(p) => Ok(PathBuf::from(p)),
            None => default_socket_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = DaemonConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("idle_threshold_secs = 300"));
        assert!(toml_str.contains("reaper_interval_secs = 30"));
        assert!(toml_str.contains("activity_debounce_secs = 5"));
        assert!(toml_str.contains("max_attempts = 5"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = DaemonConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: DaemonConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.tracker.idle_threshold_secs, 300);
        assert_eq!(parsed.tracker.sync_interval_secs, 60);
        assert_eq!(parsed.server.url, "https://revclock.dev");
        assert!(parsed.storage.state_path.is_none());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: DaemonConfig = toml::from_str(
            r#"
            [tracker]
            idle_threshold_secs = 60

            [server]
            url = "https://staging.revclock.dev"
            api_key = "rk_test"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.tracker.idle_threshold_secs, 60);
        assert_eq!(parsed.tracker.reaper_interval_secs, 30);
        assert_eq!(parsed.server.api_key, "rk_test");
    }
}
