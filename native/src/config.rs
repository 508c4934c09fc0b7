use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ipc::TransportKind;
use crate::launcher::{LaunchOptions, SandboxLimits, SecurityLevel};

pub const APP_DIR: &str = "ModInstallerHost";
pub const CONFIG_FILE: &str = "host.json";

#[cfg(windows)]
const INSTALLER_NAME: &str = "ModInstallerIPC.exe";
#[cfg(not(windows))]
const INSTALLER_NAME: &str = "ModInstallerIPC";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidOverride { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub installer_path: PathBuf,
    pub preferred_transport: TransportKind,
    pub security_level: SecurityLevel,
    pub working_dir: Option<PathBuf>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub callback_timeout_ms: u64,
    pub sandbox_max_file_bytes: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            installer_path: default_installer_path(),
            preferred_transport: TransportKind::NamedPipe,
            security_level: SecurityLevel::Regular,
            working_dir: None,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 300_000,
            callback_timeout_ms: 60_000,
            sandbox_max_file_bytes: SandboxLimits::default().max_file_bytes,
        }
    }
}

/// The installer shipped next to the host executable.
fn default_installer_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(INSTALLER_NAME)))
        .unwrap_or_else(|| PathBuf::from(INSTALLER_NAME))
}

impl HostConfig {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Config file when present, defaults otherwise, then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path)?,
            _ => {
                debug!("[CONFIG] No configuration file, using defaults");
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("[CONFIG] Loaded {}", path.display());
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Apply `MOD_INSTALLER_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("MOD_INSTALLER_PATH") {
            self.installer_path = PathBuf::from(path);
        }
        if let Some(value) = lookup("MOD_INSTALLER_TRANSPORT") {
            self.preferred_transport =
                TransportKind::parse(&value).ok_or(ConfigError::InvalidOverride {
                    key: "MOD_INSTALLER_TRANSPORT",
                    value,
                })?;
        }
        if let Some(value) = lookup("MOD_INSTALLER_SECURITY") {
            self.security_level =
                SecurityLevel::parse(&value).ok_or(ConfigError::InvalidOverride {
                    key: "MOD_INSTALLER_SECURITY",
                    value,
                })?;
        }
        if let Some(value) = lookup("MOD_INSTALLER_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = parse_millis("MOD_INSTALLER_CONNECT_TIMEOUT_MS", value)?;
        }
        if let Some(value) = lookup("MOD_INSTALLER_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = parse_millis("MOD_INSTALLER_REQUEST_TIMEOUT_MS", value)?;
        }
        if let Some(value) = lookup("MOD_INSTALLER_CALLBACK_TIMEOUT_MS") {
            self.callback_timeout_ms = parse_millis("MOD_INSTALLER_CALLBACK_TIMEOUT_MS", value)?;
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            working_dir: self.working_dir.clone(),
            security_level: self.security_level,
            env: Vec::new(),
            limits: SandboxLimits {
                max_file_bytes: self.sandbox_max_file_bytes,
                ..SandboxLimits::default()
            },
        }
    }
}

fn parse_millis(key: &'static str, value: String) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(millis) if millis > 0 => Ok(millis),
        _ => Err(ConfigError::InvalidOverride { key, value }),
    }
}
