//! Configuration management for parrun.
//!
//! This module defines the optional `parrun.toml` file and merges it with the
//! command-line flags into the `Settings` a run uses.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::process::Separator;

const DEFAULT_CONFIG_FILE: &str = "parrun.toml";
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3000;

/// Top-level structure of `parrun.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Field separator for spec strings (";", ",", ":" or "|").
    pub separator: Option<String>,
    /// Pre-hook spec, run to completion before the batch.
    pub pre: Option<String>,
    /// Whether to paint prefixes with their background color (default: true).
    pub color: Option<bool>,
    /// How long to wait for runners after a shutdown request.
    pub shutdown_grace_ms: Option<u64>,
    /// Spec strings run before any given on the command line.
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Picks the config file: an explicit path, else `./parrun.toml` if it exists.
pub fn resolve_config(explicit: Option<&Path>, disabled: bool) -> Result<Option<Config>> {
    if disabled {
        return Ok(None);
    }
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|path| path.exists()));
    path.as_deref().map(load_config).transpose()
}

/// Command-line values that can override the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub separator: Option<String>,
    pub pre: Option<String>,
    pub no_color: bool,
    pub shutdown_grace_ms: Option<u64>,
    pub commands: Vec<String>,
}

/// Effective settings for one run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub separator: Separator,
    pub pre: Option<String>,
    pub color: bool,
    pub shutdown_grace: Duration,
    pub commands: Vec<String>,
}

impl Settings {
    /// CLI values win; config commands come first, CLI commands are appended.
    pub fn merge(overrides: Overrides, config: Option<Config>) -> Result<Self> {
        let config = config.unwrap_or_default();
        let separator = match overrides.separator.or(config.separator) {
            Some(raw) => raw.parse::<Separator>()?,
            None => Separator::default(),
        };
        let color = !overrides.no_color && config.color.unwrap_or(true);
        let shutdown_grace_ms = overrides
            .shutdown_grace_ms
            .or(config.shutdown_grace_ms)
            .unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS);
        let mut commands = config.commands;
        commands.extend(overrides.commands);
        Ok(Self {
            separator,
            pre: overrides.pre.or(config.pre),
            color,
            shutdown_grace: Duration::from_millis(shutdown_grace_ms),
            commands,
        })
    }
}
