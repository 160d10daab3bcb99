//! Server configuration: TOML file + CLI overrides.

use crate::session::SessionConfig;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use termhost_core::{TermError, TermResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sessions: SessionsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// `[sessions]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default)]
    pub default_shell: Option<String>,
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,
    #[serde(default = "default_exit_grace_period_ms")]
    pub exit_grace_period_ms: u64,
    #[serde(default = "default_max_buffer_lines")]
    pub max_buffer_lines: usize,
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            default_shell: None,
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            exit_grace_period_ms: default_exit_grace_period_ms(),
            max_buffer_lines: default_max_buffer_lines(),
            max_buffer_bytes: default_max_buffer_bytes(),
            default_cols: default_cols(),
            default_rows: default_rows(),
            max_sessions: default_max_sessions(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}
fn default_port() -> u16 {
    7681
}
fn default_inactivity_timeout_ms() -> u64 {
    30 * 60 * 1000
}
fn default_exit_grace_period_ms() -> u64 {
    5_000
}
fn default_max_buffer_lines() -> usize {
    10_000
}
fn default_max_buffer_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_max_sessions() -> usize {
    100
}

/// Values given on the command line; `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub default_shell: Option<String>,
    pub inactivity_timeout_ms: Option<u64>,
    pub exit_grace_period_ms: Option<u64>,
    pub max_buffer_lines: Option<usize>,
    pub max_buffer_bytes: Option<usize>,
    pub max_sessions: Option<usize>,
}

/// Resolved server configuration (file loaded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub sessions: SessionConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file means defaults; an unreadable or malformed one is an error.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> TermResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Ok(Self::resolve(file_config, overrides))
    }

    /// Merge CLI overrides over file values.
    pub fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> Self {
        let s = file.sessions;
        Self {
            bind: overrides.bind.unwrap_or(file.server.bind),
            port: overrides.port.unwrap_or(file.server.port),
            sessions: SessionConfig {
                default_shell: overrides.default_shell.or(s.default_shell),
                inactivity_timeout: Duration::from_millis(
                    overrides
                        .inactivity_timeout_ms
                        .unwrap_or(s.inactivity_timeout_ms),
                ),
                exit_grace_period: Duration::from_millis(
                    overrides.exit_grace_period_ms.unwrap_or(s.exit_grace_period_ms),
                ),
                max_buffer_lines: overrides.max_buffer_lines.unwrap_or(s.max_buffer_lines),
                max_buffer_bytes: overrides.max_buffer_bytes.unwrap_or(s.max_buffer_bytes),
                default_cols: s.default_cols,
                default_rows: s.default_rows,
                max_sessions: overrides.max_sessions.unwrap_or(s.max_sessions),
            },
        }
    }
}

/// Parse config TOML text.
pub fn parse(content: &str) -> TermResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| TermError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
