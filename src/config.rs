//! Configuration management for appman.
//!
//! This module defines the structure of the `appman.toml` configuration file
//! and provides functionality to load and parse it. Per-application
//! validation is deferred to [`crate::process::AppSpec::from_config`] so a
//! single bad entry never prevents the rest from loading.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "appman.toml";

/// Top-level configuration structure corresponding to `appman.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Interval between liveness polls, in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Capacity of the merged log feed.
    pub max_lines: Option<usize>,
    /// Plain-text mirror of the merged log feed.
    pub log_file: Option<String>,
    /// Upper bound on stopping everything at exit, in milliseconds.
    pub shutdown_timeout_ms: Option<u64>,
    /// Applications, in display order.
    #[serde(rename = "app", default)]
    pub apps: Vec<AppConfig>,
}

/// Configuration for a single application.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub name: String,
    /// Working directory.
    pub path: Option<String>,
    pub start_command: Option<CommandLine>,
    /// Replaces SIGTERM as the way to stop the application.
    pub stop_command: Option<CommandLine>,
    /// `KEY=VALUE` items layered over the inherited environment.
    #[serde(default)]
    pub env: Vec<String>,
    pub port: Option<u16>,
    pub url: Option<String>,
}

/// A command given either as an argv list or as one shell-style string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Argv(Vec<String>),
    Line(String),
}

impl CommandLine {
    /// Splits the command into argv form.
    pub fn to_argv(&self) -> std::result::Result<Vec<String>, shell_words::ParseError> {
        match self {
            CommandLine::Argv(argv) => Ok(argv.clone()),
            CommandLine::Line(line) => shell_words::split(line),
        }
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
}

pub fn parse_config(raw: &str) -> Result<Config> {
    Ok(toml::from_str(raw)?)
}
