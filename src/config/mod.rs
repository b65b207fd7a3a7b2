use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 9000;

/// Default cache budget: 1 GiB.
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 1024 * 1024 * 1024;

/// Default number of segments per origin kept on disk when `head_only` is
/// enabled.
pub const DEFAULT_HEAD_ONLY_SEGMENT_COUNT: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub max_cache_bytes: u64,
    pub head_only: bool,
    pub head_only_segment_count: u32,
    pub cache_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            head_only: false,
            head_only_segment_count: DEFAULT_HEAD_ONLY_SEGMENT_COUNT,
            cache_root: default_cache_root(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Platform cache directory + `m3u-proxy-cache/`.
fn default_cache_root() -> PathBuf {
    dirs_cache_dir().join("m3u-proxy-cache")
}

fn dirs_cache_dir() -> PathBuf {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache")))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Config {
    /// Read the file named by `CONFIG_FILE` (default `config.toml`) if
    /// present, otherwise write out the defaults so subsequent runs are
    /// reproducible.
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());

        if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(&config_file)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_file, contents)?;
            Ok(default_config)
        }
    }
}
