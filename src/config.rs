use color_eyre::{eyre::eyre, Result};
use reqwest::header::HeaderName;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub network: NetworkConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Name of the current cache region. Bump it to invalidate everything.
  pub version: String,
  /// SQLite database file (defaults to $XDG_DATA_HOME/netfirst/cache.db)
  pub path: Option<PathBuf>,
  /// Request headers that take part in the cache key (case-insensitive)
  pub vary_headers: Vec<String>,
  /// Maximum stored body bytes; unbounded when unset
  pub quota_bytes: Option<u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      path: None,
      vary_headers: Vec::new(),
      quota_bytes: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
  pub user_agent: String,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 10,
      user_agent: concat!("netfirst/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is not set
  pub level: String,
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./netfirst.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/netfirst/config.yaml
  ///
  /// Without any file the defaults are used.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("netfirst.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("netfirst").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Replace the cache version, e.g. from the command line.
  pub fn with_cache_version(mut self, version: String) -> Result<Self> {
    self.cache.version = version;
    self.validate()?;
    Ok(self)
  }

  fn validate(&self) -> Result<()> {
    if self.cache.version.trim().is_empty() {
      return Err(eyre!("cache.version must not be empty"));
    }
    if self.network.timeout_secs == 0 {
      return Err(eyre!("network.timeout_secs must be greater than zero"));
    }
    self.vary_header_names()?;
    Ok(())
  }

  /// Parse `cache.vary_headers` into header names.
  pub fn vary_header_names(&self) -> Result<Vec<HeaderName>> {
    self
      .cache
      .vary_headers
      .iter()
      .map(|name| {
        HeaderName::from_bytes(name.trim().as_bytes())
          .map_err(|e| eyre!("Invalid header name '{}' in cache.vary_headers: {}", name, e))
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn write_config(contents: &str) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(contents.as_bytes())?;
    Ok(file)
  }

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.cache.version, "v1");
    assert_eq!(config.network.timeout(), Duration::from_secs(10));
    assert_eq!(config.log.level, "info");
    assert!(config.cache.quota_bytes.is_none());
  }

  #[test]
  fn test_partial_file_keeps_defaults() -> Result<()> {
    let file = write_config("cache:\n  version: v2\n  vary_headers: [Accept]\n")?;

    let config = Config::load(Some(file.path()))?;

    assert_eq!(config.cache.version, "v2");
    assert_eq!(config.network.timeout_secs, 10);
    assert_eq!(config.vary_header_names()?, vec![reqwest::header::ACCEPT]);
    Ok(())
  }

  #[test]
  fn test_full_file() -> Result<()> {
    let file = write_config(
      "cache:\n  version: v3\n  path: /tmp/netfirst.db\n  quota_bytes: 1048576\n\
       network:\n  timeout_secs: 5\n  user_agent: dashboard/1.0\n\
       log:\n  level: debug\n  file: /tmp/netfirst.log\n",
    )?;

    let config = Config::load(Some(file.path()))?;

    assert_eq!(config.cache.path, Some(PathBuf::from("/tmp/netfirst.db")));
    assert_eq!(config.cache.quota_bytes, Some(1_048_576));
    assert_eq!(config.network.user_agent, "dashboard/1.0");
    assert_eq!(config.network.timeout(), Duration::from_secs(5));
    assert_eq!(config.log.file, Some(PathBuf::from("/tmp/netfirst.log")));
    Ok(())
  }

  #[test]
  fn test_missing_explicit_file_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/netfirst.yaml"))).is_err());
  }

  #[test]
  fn test_empty_version_is_rejected() -> Result<()> {
    let file = write_config("cache:\n  version: \"\"\n")?;
    assert!(Config::load(Some(file.path())).is_err());
    assert!(Config::default().with_cache_version("  ".to_string()).is_err());
    Ok(())
  }

  #[test]
  fn test_invalid_vary_header_is_rejected() -> Result<()> {
    let file = write_config("cache:\n  vary_headers: [\"bad header\"]\n")?;
    assert!(Config::load(Some(file.path())).is_err());
    Ok(())
  }

  #[test]
  fn test_cache_version_override() -> Result<()> {
    let config = Config::default().with_cache_version("v9".to_string())?;
    assert_eq!(config.cache.version, "v9");
    Ok(())
  }
}
