//! Daemon settings

use super::ConfigProvider;
use anyhow::{Context, Result};
use sensd_core::{DEFAULT_INTERVAL_SECS, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon-wide configuration
///
/// Every top-level object that is not one of the named fields becomes a
/// config section, e.g. `{"mpd": {"port": 6600}}` answers
/// `get_int("mpd", "port", _)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Listening socket
    #[serde(default)]
    pub listen: ListenConfig,
    /// Password clients must send before any command; none disables auth
    #[serde(default)]
    pub password: Option<String>,
    /// Scheduler tick in seconds
    #[serde(default = "default_interval")]
    pub interval: f64,
    /// Directory scanned for native provider modules
    #[serde(default)]
    pub plugin_dir: Option<PathBuf>,
    /// Load the modules compiled into the daemon
    #[serde(default = "default_true")]
    pub builtin_modules: bool,
    /// Display layout whose variable references gate registration
    #[serde(default)]
    pub layout: Option<PathBuf>,
    /// Remaining sections served through `ConfigProvider`
    #[serde(flatten)]
    pub sections: HashMap<String, Value>,
}

fn default_interval() -> f64 {
    DEFAULT_INTERVAL_SECS
}

fn default_true() -> bool {
    true
}

/// Listening socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            password: None,
            interval: default_interval(),
            plugin_dir: None,
            builtin_modules: true,
            layout: None,
            sections: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from the default location, or defaults if absent
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            log::info!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from_path(&path)
    }

    /// Load settings from a specific file path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        let settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;
        Ok(settings)
    }

    /// Get the default settings file path
    pub fn config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("org", "sensd", "sensd")
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(dirs.config_dir().join("sensd.json"))
    }

    /// Scheduler tick, falling back to the default for non-positive values
    pub fn tick_interval(&self) -> Duration {
        if self.interval.is_finite() && self.interval > 0.0 {
            Duration::from_secs_f64(self.interval)
        } else {
            log::warn!(
                "Invalid interval {}, using {}s",
                self.interval,
                DEFAULT_INTERVAL_SECS
            );
            Duration::from_secs_f64(DEFAULT_INTERVAL_SECS)
        }
    }

    /// Configured password; an empty string counts as none
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    fn lookup(&self, section: &str, key: &str) -> Option<&Value> {
        self.sections
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(section))
            .and_then(|(_, value)| value.as_object())
            .and_then(|entries| entries.get(key))
    }
}

impl ConfigProvider for Settings {
    fn get_string(&self, section: &str, key: &str, default: &str) -> String {
        match self.lookup(section, key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => default.to_string(),
        }
    }

    fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        match self.lookup(section, key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            Some(Value::Bool(b)) => i64::from(*b),
            _ => default,
        }
    }

    fn get_double(&self, section: &str, key: &str, default: f64) -> f64 {
        match self.lookup(section, key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            Some(Value::Bool(b)) => f64::from(u8::from(*b)),
            _ => default,
        }
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.lookup(section, key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => default,
            },
            _ => default,
        }
    }
}
