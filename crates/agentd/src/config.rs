//! Agent configuration file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
    #[error("no ident configured and the host name is unavailable")]
    NoIdent,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub ident: Option<String>,
    pub meta_dir: PathBuf,
    pub servers: Vec<String>,
    pub interval_ms: u64,
    pub request_timeout_ms: u64,
    pub default_task_timeout_secs: u64,
    pub work_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ident: None,
            meta_dir: PathBuf::from("./meta"),
            servers: Vec::new(),
            interval_ms: 1000,
            request_timeout_ms: 5000,
            default_task_timeout_secs: 3600,
            work_dir: None,
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.iter().all(|server| server.trim().is_empty()) {
            return Err(ConfigError::Invalid("at least one server is required"));
        }
        if self.interval_ms == 0 {
            return Err(ConfigError::Invalid("interval_ms must be positive"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be positive"));
        }
        if self.default_task_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "default_task_timeout_secs must be positive",
            ));
        }
        Ok(())
    }

    pub fn servers(&self) -> Vec<String> {
        self.servers
            .iter()
            .map(|server| server.trim().trim_end_matches('/').to_string())
            .filter(|server| !server.is_empty())
            .collect()
    }

    /// Configured ident, or the host name.
    pub fn resolve_ident(&self) -> Result<String, ConfigError> {
        match self.ident.as_deref().map(str::trim) {
            Some(ident) if !ident.is_empty() => Ok(ident.to_string()),
            _ => host_name().ok_or(ConfigError::NoIdent),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }
}

#[cfg(unix)]
fn host_name() -> Option<String> {
    let mut buffer = [0u8; 256];
    let result = unsafe { libc::gethostname(buffer.as_mut_ptr().cast(), buffer.len()) };
    if result != 0 {
        return None;
    }

    let end = buffer.iter().position(|byte| *byte == 0).unwrap_or(buffer.len());
    String::from_utf8(buffer[..end].to_vec())
        .ok()
        .filter(|name| !name.is_empty())
}

#[cfg(windows)]
fn host_name() -> Option<String> {
    std::env::var("COMPUTERNAME").ok().filter(|name| !name.is_empty())
}
