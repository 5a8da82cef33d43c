use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fetch::RetryPolicy;
use crate::realtime::ReconnectPolicy;
use crate::store::SyncOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub realtime: RealtimeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the REST API, e.g. https://rentals.example.com/api
  pub url: String,
  /// Path of the push-channel endpoint, relative to `url`
  #[serde(default = "default_events_path")]
  pub events_path: String,
}

fn default_events_path() -> String {
  "/events".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub page_size: u32,
  pub search_debounce_ms: u64,
  pub fetch_timeout_ms: u64,
  pub max_fetch_attempts: u32,
  pub retry_base_ms: u64,
  pub retry_max_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      page_size: 20,
      search_debounce_ms: 300,
      fetch_timeout_ms: 10_000,
      max_fetch_attempts: 3,
      retry_base_ms: 250,
      retry_max_ms: 4_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
  pub enabled: bool,
  pub reconnect_base_ms: u64,
  pub reconnect_max_ms: u64,
}

impl Default for RealtimeConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      reconnect_base_ms: 500,
      reconnect_max_ms: 30_000,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rentsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rentsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/rentsync/config.yaml\n\
                 See rentsync.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("rentsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rentsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.sync.page_size == 0 {
      return Err(eyre!("sync.page_size must be at least 1"));
    }
    Ok(config)
  }

  /// Get the API token from the environment, if set.
  ///
  /// Checks RENTSYNC_API_TOKEN. Anonymous access is allowed.
  pub fn get_api_token() -> Option<String> {
    std::env::var("RENTSYNC_API_TOKEN")
      .ok()
      .filter(|token| !token.trim().is_empty())
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_millis(self.sync.fetch_timeout_ms)
  }

  pub fn sync_options(&self) -> SyncOptions {
    SyncOptions {
      page_size: self.sync.page_size,
      search_debounce: Duration::from_millis(self.sync.search_debounce_ms),
      fetch_timeout: self.fetch_timeout(),
      retry: RetryPolicy::new(
        self.sync.max_fetch_attempts,
        Duration::from_millis(self.sync.retry_base_ms),
        Duration::from_millis(self.sync.retry_max_ms),
      ),
      reconnect: ReconnectPolicy::new(
        Duration::from_millis(self.realtime.reconnect_base_ms),
        Duration::from_millis(self.realtime.reconnect_max_ms),
      ),
    }
  }
}
