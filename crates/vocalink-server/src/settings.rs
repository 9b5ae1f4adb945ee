//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If `~/.vocalink/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `VOCALINK_*` environment variable overrides
//!
//! Command-line flags are applied by the binary on top of the result.
//!
//! Loading runs before the log subscriber exists, so rejected overrides are
//! returned in [`LoadedSettings`] for the caller to report.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, Level};
use vocalink_telemetry::LogFormat;

use crate::server::ServerConfig;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Advertised server name. `None` picks a random one at startup.
    pub name: Option<String>,
    /// Advertised address. `None` auto-detects the LAN address.
    pub ip: Option<String>,
    pub advertise: bool,
    pub send_queue_capacity: usize,
    pub heartbeat_interval_secs: u64,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            name: None,
            ip: None,
            advertise: true,
            send_queue_capacity: 256,
            heartbeat_interval_secs: 30,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Settings {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            send_queue_capacity: self.send_queue_capacity,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
        }
    }
}

impl Settings {
    /// The configured log level, or the raw string if it is not a level name.
    pub fn parsed_log_level(&self) -> std::result::Result<Level, &str> {
        self.log_level.parse::<Level>().map_err(|_| self.log_level.as_str())
    }
}

/// An environment override whose value could not be used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IgnoredOverride {
    pub key: &'static str,
    pub value: String,
}

/// Settings plus any environment overrides that were ignored.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadedSettings {
    pub settings: Settings,
    pub ignored: Vec<IgnoredOverride>,
}

/// `~/.vocalink/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".vocalink").join("settings.json")
}

pub fn load_settings() -> Result<LoadedSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from a specific path, then apply env overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LoadedSettings> {
    let mut settings = read_settings_file(path)?;
    let ignored = apply_env_overrides(&mut settings);
    Ok(LoadedSettings { settings, ignored })
}

fn read_settings_file(path: &Path) -> Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Recursive merge: objects merge per key, everything else is replaced, nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut Settings) -> Vec<IgnoredOverride> {
    apply_overrides_from(settings, |key| std::env::var(key).ok())
}

/// Apply `VOCALINK_*` overrides read through `lookup`. Invalid values are skipped and returned.
pub fn apply_overrides_from(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<IgnoredOverride> {
    let read = |key: &str| lookup(key).filter(|v| !v.is_empty());
    let mut ignored = Vec::new();

    if let Some(v) = read("VOCALINK_HOST") {
        settings.host = v;
    }
    if let Some(v) = read("VOCALINK_PORT") {
        match parse_u16_range(&v, 1, 65535) {
            Some(port) => settings.port = port,
            None => ignored.push(IgnoredOverride { key: "VOCALINK_PORT", value: v }),
        }
    }
    if let Some(v) = read("VOCALINK_NAME") {
        settings.name = Some(v);
    }
    if let Some(v) = read("VOCALINK_IP") {
        settings.ip = Some(v);
    }
    if let Some(v) = read("VOCALINK_ADVERTISE") {
        match parse_bool(&v) {
            Some(b) => settings.advertise = b,
            None => ignored.push(IgnoredOverride { key: "VOCALINK_ADVERTISE", value: v }),
        }
    }
    if let Some(v) = read("VOCALINK_LOG_LEVEL") {
        settings.log_level = v;
    }
    ignored
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
