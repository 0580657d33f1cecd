//! priosched configuration
//!
//! Scheduler settings live in a TOML file. Every field has a default, so a
//! file only needs to name what it changes.
//!
//! # Lookup order
//!
//! ```text
//! 1. --config FILE on the command line
//! 2. User-level (~/.config/priosched/config.toml)
//! 3. Default values
//! ```
//!
//! # Usage
//!
//! ```rust
//! use priosched::util::config::SchedulerConfig;
//!
//! let config: SchedulerConfig = toml::from_str("pool_size = 2").unwrap();
//! assert_eq!(config.pool_size, 2);
//! assert_eq!(config.max_wait_for_low_priority_ms, 500);
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::runtime::scheduler::{ConfigurableThreadFactory, TaskPriority};

/// Settings of a [`PriorityScheduler`](crate::runtime::scheduler::PriorityScheduler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of worker threads.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Priority of submissions that do not name one.
    #[serde(default)]
    pub default_priority: TaskPriority,
    /// How long due low-priority work waits for a free worker before the pool grows.
    #[serde(default = "default_max_wait_for_low_priority_ms")]
    pub max_wait_for_low_priority_ms: u64,
    /// Idle time after which a worker retires.
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
    /// Worker thread name prefix.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
    /// Daemon workers do not hold up dropping the scheduler.
    #[serde(default = "default_daemon_threads")]
    pub daemon_threads: bool,
    /// Worker stack size in bytes; the platform default when unset.
    #[serde(default)]
    pub stack_size: Option<usize>,
}

fn default_pool_size() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_max_wait_for_low_priority_ms() -> u64 {
    500
}

fn default_keep_alive_ms() -> u64 {
    10_000
}

fn default_thread_name_prefix() -> String {
    "priosched-worker".to_string()
}

fn default_daemon_threads() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            default_priority: TaskPriority::default(),
            max_wait_for_low_priority_ms: default_max_wait_for_low_priority_ms(),
            keep_alive_ms: default_keep_alive_ms(),
            thread_name_prefix: default_thread_name_prefix(),
            daemon_threads: default_daemon_threads(),
            stack_size: None,
        }
    }
}

impl SchedulerConfig {
    #[inline]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    #[inline]
    pub fn max_wait_for_low_priority(&self) -> Duration {
        Duration::from_millis(self.max_wait_for_low_priority_ms)
    }

    /// Thread factory with this config's naming, daemon flag and stack size.
    pub fn thread_factory(&self) -> ConfigurableThreadFactory {
        let factory = ConfigurableThreadFactory::new(self.thread_name_prefix.clone())
            .with_daemon(self.daemon_threads);
        match self.stack_size {
            Some(stack_size) => factory.with_stack_size(stack_size),
            None => factory,
        }
    }

    /// Reject values no scheduler can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be at least 1".to_string()));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "thread_name_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Get the user config directory
pub fn get_config_dir() -> Option<PathBuf> {
    // Try XDG config directory on Unix
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config).join("priosched"));
    }

    if let Ok(home) = std::env::var("HOME") {
        return Some(PathBuf::from(home).join(".config").join("priosched"));
    }

    // On Windows, try %APPDATA%
    if let Ok(appdata) = std::env::var("APPDATA") {
        return Some(PathBuf::from(appdata).join("priosched"));
    }

    None
}

/// Get the user config file path (~/.config/priosched/config.toml)
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.toml"))
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<SchedulerConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: SchedulerConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Load `path` if given, else the user config if it exists, else defaults.
pub fn load_config_or_default(path: Option<&Path>) -> Result<SchedulerConfig, ConfigError> {
    if let Some(path) = path {
        return load_config(path);
    }
    match get_config_path() {
        Some(user) if user.exists() => load_config(&user),
        _ => Ok(SchedulerConfig::default()),
    }
}

/// Write a config file, creating its directory if needed.
pub fn save_config(
    config: &SchedulerConfig,
    path: &Path,
) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)?;
        }
    }
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}

/// Save to the user config path.
pub fn save_user_config(config: &SchedulerConfig) -> Result<PathBuf, ConfigError> {
    let path = get_config_path().ok_or(ConfigError::NoConfigDir)?;
    save_config(config, &path)?;
    Ok(path)
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Cannot determine config directory")]
    NoConfigDir,
}
