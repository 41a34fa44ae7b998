use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;

use crate::query::QueryOptions;
use crate::retry::{exponential_backoff, DurableRetryPolicy, ImmediateRetryPolicy};

const APP_DIR: &str = "pokedex-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  /// User whose pokedex the CLI works on
  pub user_id: Option<String>,
  /// Database file (defaults to the data directory)
  pub database: Option<PathBuf>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Project URL, e.g. https://xyz.supabase.co
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

/// Query cache timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub stale_time_secs: u64,
  /// Freshness window of catalog queries, which rarely change
  pub catalog_stale_time_secs: u64,
  pub gc_time_secs: u64,
  pub retries: u32,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 5 * 60,
      catalog_stale_time_secs: 60 * 60,
      gc_time_secs: 24 * 60 * 60,
      retries: 3,
    }
  }
}

impl CacheConfig {
  pub fn query_options(&self) -> QueryOptions {
    QueryOptions::default()
      .with_stale_time(Duration::from_secs(self.stale_time_secs))
      .with_gc_time(Duration::from_secs(self.gc_time_secs))
      .with_retry(ImmediateRetryPolicy::new(self.retries, exponential_backoff))
  }

  pub fn catalog_query_options(&self) -> QueryOptions {
    self
      .query_options()
      .with_stale_time(Duration::from_secs(self.catalog_stale_time_secs))
  }
}

/// Pending queue and reconnect behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub settle_delay_ms: u64,
  /// Drain attempts before a queued operation is dropped
  pub max_attempts: u32,
  /// Immediate retries of a mutation before it is queued
  pub mutation_retries: u32,
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      settle_delay_ms: 1000,
      max_attempts: 5,
      mutation_retries: 2,
      probe_interval_secs: 30,
    }
  }
}

impl SyncConfig {
  pub fn settle_delay(&self) -> Duration {
    Duration::from_millis(self.settle_delay_ms)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs)
  }

  pub fn durable_policy(&self) -> DurableRetryPolicy {
    DurableRetryPolicy::new(self.max_attempts)
  }

  pub fn mutation_policy(&self) -> ImmediateRetryPolicy {
    ImmediateRetryPolicy::new(self.mutation_retries, exponential_backoff)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pokedex.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pokedex-sync/config.yaml
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
        "No configuration file found. Create one at ~/.config/pokedex-sync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("pokedex.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
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
    if config.remote.url.trim().is_empty() {
      return Err(eyre!("remote.url must not be empty"));
    }
    Ok(config)
  }

  /// Where the local store lives.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => Ok(data_dir()?.join("pokedex.db")),
    }
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks POKEDEX_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("POKEDEX_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("API key not found. Set POKEDEX_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }
}

/// Per-user data directory for the database and logs.
pub fn data_dir() -> Result<PathBuf> {
  dirs::data_dir()
    .map(|dir| dir.join(APP_DIR))
    .ok_or_else(|| eyre!("Could not determine data directory"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("remote:\n  url: https://example.supabase.co\n").unwrap();

    assert_eq!(config.remote.timeout_secs, 30);
    assert_eq!(config.user_id, None);
    assert_eq!(config.cache, CacheConfig::default());
    assert_eq!(config.sync, SyncConfig::default());
    assert_eq!(config.sync.durable_policy(), DurableRetryPolicy::new(5));
    assert_eq!(config.sync.settle_delay(), Duration::from_secs(1));
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
remote:
  url: https://example.supabase.co
  timeout_secs: 5
user_id: ash
database: /tmp/pokedex.db
cache:
  stale_time_secs: 60
  catalog_stale_time_secs: 600
sync:
  max_attempts: 3
  settle_delay_ms: 250
"#;
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.user_id.as_deref(), Some("ash"));
    assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/pokedex.db"));
    assert_eq!(config.cache.query_options().stale_time, Duration::from_secs(60));
    assert_eq!(
      config.cache.catalog_query_options().stale_time,
      Duration::from_secs(600)
    );
    // Unset keys keep their defaults
    assert_eq!(config.cache.gc_time_secs, 24 * 60 * 60);
    assert_eq!(config.sync.max_attempts, 3);
    assert_eq!(config.sync.mutation_retries, 2);
    assert_eq!(config.sync.settle_delay(), Duration::from_millis(250));
  }

  #[test]
  fn test_missing_remote_url_is_rejected() {
    assert!(Config::parse("user_id: ash\n").is_err());
    assert!(Config::parse("remote:\n  url: ''\n").is_err());
  }

  #[test]
  fn test_load_reads_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pokedex.yaml");
    std::fs::write(&path, "remote:\n  url: https://example.supabase.co\nuser_id: misty\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.user_id.as_deref(), Some("misty"));

    assert!(Config::load(Some(&dir.path().join("missing.yaml"))).is_err());
  }
}
