use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Operating mode, selected once at startup.
///
/// Picks the retry tables, freshness windows and hydration rules. There are
/// no transitions between modes at runtime.
#[derive(
  Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentMode {
  Production,
  #[default]
  Development,
}

impl EnvironmentMode {
  /// Resolve the mode from the hosting environment.
  ///
  /// Checks QCACHE_ENV first, then NODE_ENV. Anything other than
  /// "production" is development.
  pub fn from_env() -> Self {
    std::env::var("QCACHE_ENV")
      .or_else(|_| std::env::var("NODE_ENV"))
      .map(|v| Self::from_label(&v))
      .unwrap_or_default()
  }

  pub fn from_label(label: &str) -> Self {
    if label.trim().eq_ignore_ascii_case("production") {
      EnvironmentMode::Production
    } else {
      EnvironmentMode::Development
    }
  }

  pub fn is_production(self) -> bool {
    self == EnvironmentMode::Production
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// Overrides QCACHE_ENV / NODE_ENV when set
  pub mode: Option<EnvironmentMode>,
  #[serde(default)]
  pub rpc: RpcConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
  /// Base URL of the API (e.g. "https://api.example.com")
  pub url: Option<String>,
  /// Site origin to derive `api.<domain>` from when no URL is set
  pub origin: Option<String>,
  /// Path of the RPC handler under the base URL
  pub path: String,
  pub timeout_secs: u64,
  /// Name of the session cookie forwarded with each request
  pub session_cookie: String,
  pub user_agent: Option<String>,
}

impl Default for RpcConfig {
  fn default() -> Self {
    Self {
      url: None,
      origin: None,
      path: "/api/v1/rpc".to_string(),
      timeout_secs: 30,
      session_cookie: "st_auth.session_token".to_string(),
      user_agent: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Persist the dehydrated cache between runs
  pub persist: bool,
  /// Database path (default: $XDG_DATA_HOME/qcache/cache.db)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      persist: true,
      path: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./qcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/qcache/config.yaml
  ///
  /// Without a file every setting takes its default.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("qcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("qcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    // An empty file deserializes to unit, not to an empty map.
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Pick the operating mode: command line, then config file, then environment.
  pub fn resolve_mode(&self, cli: Option<EnvironmentMode>) -> EnvironmentMode {
    cli
      .or(self.mode)
      .unwrap_or_else(EnvironmentMode::from_env)
  }

  /// API base URL from QCACHE_API_URL, if set.
  pub fn get_api_url() -> Option<String> {
    std::env::var("QCACHE_API_URL")
      .ok()
      .filter(|v| !v.trim().is_empty())
  }

  /// Session token from QCACHE_SESSION_TOKEN, if set.
  pub fn get_session_token() -> Option<String> {
    std::env::var("QCACHE_SESSION_TOKEN")
      .ok()
      .filter(|v| !v.trim().is_empty())
  }
}
