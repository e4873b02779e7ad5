//! Process configuration.
//!
//! # Load Order
//!
//! 1. Default values
//! 2. Optional YAML file
//! 3. Environment variables (`RELAY_*`)
//!
//! Each layer overrides the previous. A missing file is skipped; a file
//! that exists but does not parse is an error.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const ENV_NOBOOT: &str = "RELAY_NOBOOT";
pub const ENV_USER_STAGES: &str = "RELAY_USER_STAGES";
pub const ENV_BLACKLIST: &str = "RELAY_BLACKLIST";
pub const ENV_WIRE_CODEC: &str = "RELAY_WIRE_CODEC";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "RELAY_REQUEST_TIMEOUT_MS";

/// Runtime-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Regexes matched in full against instance names and stage types.
    pub blacklist: Vec<String>,
    /// Root of the user stage document tree.
    pub user_stages: PathBuf,
    /// Skip the built-in documents at boot.
    pub noboot: bool,
    /// Directory depth limit for the user stage scan.
    pub boot_max_depth: usize,
    /// Default bound on bus requests.
    pub request_timeout_ms: u64,
    /// Route every delivery through the wire codec.
    pub wire_codec: bool,
    /// Free-form configuration, exposed to templates and stages as `config`.
    pub settings: serde_json::Value,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            blacklist: Vec::new(),
            user_stages: PathBuf::from("./stages"),
            noboot: false,
            boot_max_depth: 9,
            request_timeout_ms: 30_000,
            wire_codec: false,
            settings: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

impl RuntimeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn from_yaml(name: &str, yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RelayError::yaml(name, e))
    }
}

/// Layered configuration loader.
///
/// ```ignore
/// let config = ConfigLoader::new()
///     .with_file("relay.yml")
///     .skip_env_vars()
///     .load()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    skip_env: bool,
}

impl ConfigLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Skips environment variable loading.
    #[must_use]
    pub fn skip_env_vars(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Loads and layers every configured source.
    ///
    /// # Errors
    ///
    /// Fails when the file exists but cannot be read or parsed, or an
    /// environment variable holds a malformed value.
    pub fn load(&self) -> Result<RuntimeConfig> {
        let mut config = match &self.file {
            Some(path) => load_file(path)?.unwrap_or_default(),
            None => RuntimeConfig::default(),
        };
        if !self.skip_env {
            apply_overrides(&mut config, |key| std::env::var(key).ok())?;
        }
        Ok(config)
    }
}

fn load_file(path: &Path) -> Result<Option<RuntimeConfig>> {
    if !path.exists() {
        debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|e| RelayError::io(path, e))?;
    let config = RuntimeConfig::from_yaml(&path.display().to_string(), &content)?;
    debug!(path = %path.display(), "loaded config file");
    Ok(Some(config))
}

fn apply_overrides(
    config: &mut RuntimeConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let invalid = |key: &str, expected: &str| {
        RelayError::config(format!("invalid value for {key}: expected {expected}"))
    };

    if let Some(val) = lookup(ENV_NOBOOT) {
        config.noboot = parse_bool(&val).ok_or_else(|| invalid(ENV_NOBOOT, "bool"))?;
    }
    if let Some(val) = lookup(ENV_WIRE_CODEC) {
        config.wire_codec = parse_bool(&val).ok_or_else(|| invalid(ENV_WIRE_CODEC, "bool"))?;
    }
    if let Some(val) = lookup(ENV_USER_STAGES) {
        config.user_stages = PathBuf::from(val);
    }
    if let Some(val) = lookup(ENV_BLACKLIST) {
        config.blacklist = val
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(val) = lookup(ENV_REQUEST_TIMEOUT_MS) {
        config.request_timeout_ms = val
            .trim()
            .parse()
            .map_err(|_| invalid(ENV_REQUEST_TIMEOUT_MS, "milliseconds"))?;
    }
    Ok(())
}

/// Accepts "true", "false", "1", "0", "yes", "no", "on", "off" in any case.
fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
