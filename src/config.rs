use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::highlights::{RetryPolicy, DEFAULT_REFRESH_WINDOW_SECS};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  /// Version used when a command does not name one
  pub default_version: Option<u32>,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub highlights: HighlightsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  /// Sent as `X-App-Key` on every request
  pub app_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Purgeable cache location (defaults to the platform cache dir)
  pub cache_dir: Option<PathBuf>,
  /// Downloads location (defaults to the platform data dir)
  pub download_dir: Option<PathBuf>,
  /// Keep everything in memory; nothing is written to disk
  #[serde(default)]
  pub ephemeral: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub backoff_base_ms: u64,
  pub backoff_max_secs: u64,
  /// Unset retries failed highlight edits forever
  pub max_attempts: Option<u32>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    let policy = RetryPolicy::default();
    Self {
      backoff_base_ms: policy.base_delay.as_millis() as u64,
      backoff_max_secs: policy.max_delay.as_secs(),
      max_attempts: policy.max_attempts,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HighlightsConfig {
  /// How long a chapter's server highlights stay fresh
  pub refresh_window_secs: i64,
}

impl Default for HighlightsConfig {
  fn default() -> Self {
    Self {
      refresh_window_secs: DEFAULT_REFRESH_WINDOW_SECS,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./lectern.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/lectern/config.yaml
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
        "No configuration file found. Create one at ~/.config/lectern/config.yaml\n\
                 See lectern.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("lectern.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("lectern").join("config.yaml");
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
    if config.sync.max_attempts == Some(0) {
      return Err(eyre!("sync.max_attempts must be at least 1"));
    }
    Ok(config)
  }

  /// Get the user's access token from environment variables.
  ///
  /// Checks LECTERN_ACCESS_TOKEN first, then YV_ACCESS_TOKEN as fallback.
  /// Signed-out use is allowed, so a missing token is not an error.
  pub fn access_token() -> Option<String> {
    std::env::var("LECTERN_ACCESS_TOKEN")
      .or_else(|_| std::env::var("YV_ACCESS_TOKEN"))
      .ok()
      .filter(|t| !t.trim().is_empty())
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      base_delay: Duration::from_millis(self.sync.backoff_base_ms),
      max_delay: Duration::from_secs(self.sync.backoff_max_secs),
      max_attempts: self.sync.max_attempts,
    }
  }

  pub fn refresh_window(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.highlights.refresh_window_secs)
  }
}
