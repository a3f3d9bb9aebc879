//! Configuration management for devrack.
//!
//! This module defines the structure of the optional `devrack.toml` file at
//! the project root and provides functionality to load and parse it. Every
//! field is optional; CLI flags take precedence over file values.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Run commands from the project root instead of the invocation
    /// directory (default: false).
    pub workspace: Option<bool>,
    /// Prepend `<project-root>/bin` to PATH for run commands
    /// (default: true).
    pub local_bin: Option<bool>,
    /// Default number of log lines returned by `ps logs` and the
    /// `process_logs` tool (default: 100).
    pub tail_lines: Option<i64>,
    /// Strip ANSI escape sequences from log tails (default: true).
    pub strip_ansi: Option<bool>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Loads `devrack.toml` from `root` if it exists, else defaults.
pub fn load_project_config(root: &Path) -> Result<Config> {
    let path = root.join("devrack.toml");
    if path.exists() {
        load_config(&path)
    } else {
        Ok(Config::default())
    }
}
