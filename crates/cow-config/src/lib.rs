//! # cow-config
//!
//! Configuration management for the cow-overlay block store.
//!
//! Loads configuration from:
//! 1. `~/.cow-overlay/config.toml` (global)
//! 2. `.cow-overlay/config.toml` (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use tracing::debug;

pub use logging::LogLevel;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(PoisonError::into_inner)
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = new_config;
    Ok(())
}

pub const ENV_ATTRIBUTE_DIR: &str = "COW_ATTRIBUTE_DIR";
pub const ENV_DATA_DIR: &str = "COW_DATA_DIR";
pub const ENV_BLOCK_SIZE: &str = "COW_BLOCK_SIZE";
pub const ENV_LOG: &str = "COW_LOG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub reclaim: ReclaimConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut layers = Vec::new();
        if let Some(global_path) = Self::global_config_path() {
            layers.push(global_path);
        }
        layers.push(Self::project_config_path());
        Self::load_layers(&layers, |name| std::env::var(name).ok())
    }

    /// Load a single explicit file, then apply environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let table = read_table(path)?.ok_or_else(|| ConfigError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;
        Self::from_table(table, |name| std::env::var(name).ok())
    }

    /// Merge the given files in order (missing files are skipped), then
    /// apply overrides from `env`.
    pub fn load_layers<F>(paths: &[PathBuf], env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut merged = toml::Table::new();
        for path in paths {
            if let Some(table) = read_table(path)? {
                debug!("Loading config layer from {:?}", path);
                merge_tables(&mut merged, table);
            }
        }
        Self::from_table(merged, env)
    }

    fn from_table<F>(table: toml::Table, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Config = toml::Value::Table(table).try_into()?;
        config.apply_env_overrides(&env)?;
        config.expand_paths(&env);
        Ok(config)
    }

    /// Global config path: ~/.cow-overlay/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".cow-overlay/config.toml"))
    }

    /// Project config path, relative to the working directory.
    pub fn project_config_path() -> PathBuf {
        PathBuf::from(".cow-overlay/config.toml")
    }

    /// Apply environment variable overrides
    fn apply_env_overrides<F>(&mut self, env: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = env(ENV_ATTRIBUTE_DIR) {
            self.store.attribute_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env(ENV_DATA_DIR) {
            self.store.data_dir = PathBuf::from(dir);
        }
        if let Some(size) = env(ENV_BLOCK_SIZE) {
            self.store.block_size = size.parse().map_err(|reason| ConfigError::Invalid {
                key: ENV_BLOCK_SIZE,
                value: size.clone(),
                reason,
            })?;
        }
        if let Some(level) = env(ENV_LOG) {
            self.log.level = level.parse().map_err(|reason| ConfigError::Invalid {
                key: ENV_LOG,
                value: level.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    fn expand_paths<F>(&mut self, env: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for dir in [&mut self.store.attribute_dir, &mut self.store.data_dir] {
            let raw = dir.to_string_lossy().into_owned();
            *dir = path::expand_tilde(&path::expand_vars(&raw, env));
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

fn read_table(path: &Path) -> Result<Option<toml::Table>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents.parse::<toml::Table>()?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Later layers override earlier ones key by key; nested tables merge.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(inner)), toml::Value::Table(over)) => merge_tables(inner, over),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Block store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one attribute record per block
    pub attribute_dir: PathBuf,
    /// Directory holding block payloads
    pub data_dir: PathBuf,
    pub block_size: BlockSize,
    /// Two-character fan-out subdirectories (only used when the store is created)
    pub fanout: bool,
    /// fsync before publishing
    pub sync: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let root = path::default_root();
        Self {
            attribute_dir: root.join("attributes"),
            data_dir: root.join("blocks"),
            block_size: BlockSize::default(),
            fanout: false,
            sync: true,
        }
    }
}

/// Reclamation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    /// Reclaim inside `release` when possible instead of waiting for `gc`
    pub immediate: bool,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self { immediate: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
}

/// Block size in bytes. Accepts an integer or a size string such as `"4K"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSize", into = "u64")]
pub struct BlockSize(u64);

impl BlockSize {
    pub const DEFAULT: BlockSize = BlockSize(4096);

    pub fn new(bytes: u64) -> Self {
        BlockSize(bytes)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<BlockSize> for u64 {
    fn from(size: BlockSize) -> u64 {
        size.0
    }
}

impl std::str::FromStr for BlockSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_size(s).map(BlockSize)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSize {
    Int(u64),
    Str(String),
}

impl TryFrom<RawSize> for BlockSize {
    type Error = String;

    fn try_from(raw: RawSize) -> Result<Self, Self::Error> {
        match raw {
            RawSize::Int(n) => Ok(BlockSize(n)),
            RawSize::Str(s) => s.parse(),
        }
    }
}

/// Parse `"4096"`, `"4K"`, `"4KB"`, `"1M"` or `"1G"` (binary multiples).
pub fn parse_size(input: &str) -> Result<u64, String> {
    let s = input.trim();
    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (number, suffix) = s.split_at(digits_end);
    if number.is_empty() {
        return Err(format!("'{}' does not start with a number", input));
    }
    let value: u64 = number
        .parse()
        .map_err(|_| format!("'{}' is out of range", input))?;

    let shift = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        other => return Err(format!("unknown size suffix '{}'", other)),
    };
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("'{}' is out of range", input))
}
