//! Remote storage configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/storage-remote/config.toml)
//! 3. Environment variables (STORAGE_REMOTE_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::remote::bus::DEFAULT_CHANNEL_CAPACITY;
use crate::remote::exposer::DEFAULT_RECENTLY_CLOSED_CAPACITY;

/// Environment variable prefix
const ENV_PREFIX: &str = "STORAGE_REMOTE";

/// Remote storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Name the proxy storage reports
    #[serde(default = "default_identifier")]
    pub identifier: String,

    /// Per-request timeout on the proxy side; unset waits forever
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,

    /// How many closed connection ids the exposer remembers
    #[serde(default = "default_recently_closed_capacity")]
    pub recently_closed_capacity: usize,

    /// Capacity of in-process bus channels
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Default tracing filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identifier: default_identifier(),
            request_timeout_ms: None,
            recently_closed_capacity: default_recently_closed_capacity(),
            channel_capacity: default_channel_capacity(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (STORAGE_REMOTE_IDENTIFIER, STORAGE_REMOTE_REQUEST_TIMEOUT_MS, ...)
    /// 2. Config file (~/.config/storage-remote/config.toml or STORAGE_REMOTE_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration, preferring a path given on the command line
    pub fn load_with_cli_override(cli_path: Option<&Path>) -> Result<Self> {
        match cli_path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a TOML string
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(val) = env_var("IDENTIFIER") {
            self.identifier = val;
        }

        // Empty string clears the timeout
        if let Some(val) = env_var("REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = if val.is_empty() {
                None
            } else {
                Some(parse_env("REQUEST_TIMEOUT_MS", &val)?)
            };
        }

        if let Some(val) = env_var("RECENTLY_CLOSED_CAPACITY") {
            self.recently_closed_capacity = parse_env("RECENTLY_CLOSED_CAPACITY", &val)?;
        }

        if let Some(val) = env_var("CHANNEL_CAPACITY") {
            self.channel_capacity = parse_env("CHANNEL_CAPACITY", &val)?;
        }

        if let Some(val) = env_var("LOG_LEVEL") {
            self.log_level = val;
        }

        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with STORAGE_REMOTE_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Some(path) = env_var("CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("storage-remote")
            .join("config.toml")
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, suffix)).ok()
}

fn parse_env<T>(suffix: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}_{}: {:?}", ENV_PREFIX, suffix, value))
}

fn default_identifier() -> String {
    "remote".to_string()
}

fn default_recently_closed_capacity() -> usize {
    DEFAULT_RECENTLY_CLOSED_CAPACITY
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|p| p.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "STORAGE_REMOTE_IDENTIFIER",
        "STORAGE_REMOTE_REQUEST_TIMEOUT_MS",
        "STORAGE_REMOTE_RECENTLY_CLOSED_CAPACITY",
        "STORAGE_REMOTE_CHANNEL_CAPACITY",
        "STORAGE_REMOTE_LOG_LEVEL",
        "STORAGE_REMOTE_CONFIG",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.identifier, "remote");
        assert!(config.request_timeout().is_none());
        assert_eq!(config.recently_closed_capacity, DEFAULT_RECENTLY_CLOSED_CAPACITY);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_env_override_timeout() {
        let _guard = EnvGuard::new(ENV_VARS);
        let mut config = Config::default();

        env::set_var("STORAGE_REMOTE_REQUEST_TIMEOUT_MS", "250");
        config.apply_env_overrides().unwrap();
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(250)));

        env::set_var("STORAGE_REMOTE_REQUEST_TIMEOUT_MS", "");
        config.apply_env_overrides().unwrap();
        assert!(config.request_timeout().is_none());
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let _guard = EnvGuard::new(ENV_VARS);
        let mut config = Config::default();

        env::set_var("STORAGE_REMOTE_CHANNEL_CAPACITY", "lots");
        let err = config.apply_env_overrides().unwrap_err();
        assert!(err.to_string().contains("STORAGE_REMOTE_CHANNEL_CAPACITY"));
    }

    #[test]
    fn test_env_override_identifier() {
        let _guard = EnvGuard::new(ENV_VARS);
        let mut config = Config::default();

        env::set_var("STORAGE_REMOTE_IDENTIFIER", "worker-1");
        env::set_var("STORAGE_REMOTE_LOG_LEVEL", "debug");
        config.apply_env_overrides().unwrap();
        assert_eq!(config.identifier, "worker-1");
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_load_from_str_fills_defaults() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            identifier = "tab-storage"
            request_timeout_ms = 5000
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.identifier, "tab-storage");
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config::load_from_path(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config {
            identifier: "saved".to_string(),
            request_timeout_ms: Some(100),
            recently_closed_capacity: 8,
            channel_capacity: 16,
            log_level: "warn".to_string(),
        };
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_path_override() {
        let _guard = EnvGuard::new(ENV_VARS);

        env::set_var("STORAGE_REMOTE_CONFIG", "/tmp/custom.toml");
        assert_eq!(Config::config_file_path(), PathBuf::from("/tmp/custom.toml"));
    }
}
