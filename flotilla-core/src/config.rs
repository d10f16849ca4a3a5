//! Engine configuration
//!
//! Loaded from TOML with `FLOTILLA_*` environment overrides. Every section
//! has defaults, so an empty file is a valid configuration.

use crate::cert_generator::CertificateIssuer;
use crate::error::{FlotillaError, FlotillaResult};
use crate::executor::{ConcurrentExecutor, FanoutMode};
use crate::readiness::{BackoffStrategy, ReadinessChecker, ReadinessPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub paths: PathsConfig,
    pub ssh: SshConfig,
    pub readiness: ReadinessConfig,
    pub certs: CertConfig,
    pub fanout: FanoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Per-cluster data lives under `<data_root>/<cluster name>`
    pub data_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/flotilla/data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub ssh_binary: String,
    pub scp_binary: String,
    pub strict_host_key_checking: bool,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Upper bound for a single remote command or transfer
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            identity_file: None,
            ssh_binary: "ssh".to_string(),
            scp_binary: "scp".to_string(),
            strict_host_key_checking: false,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub attempts: u32,

    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    pub backoff: BackoffKind,

    /// Cap for exponential backoff
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,

    pub status_command: String,
    pub marker: String,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(2),
            backoff: BackoffKind::Fixed,
            max_interval: Duration::from_secs(30),
            status_command: "k0s status".to_string(),
            marker: "Process".to_string(),
        }
    }
}

impl ReadinessConfig {
    pub fn policy(&self) -> ReadinessPolicy {
        let backoff = match self.backoff {
            BackoffKind::Fixed => BackoffStrategy::Fixed(self.interval),
            BackoffKind::Exponential => BackoffStrategy::Exponential {
                base: self.interval,
                max: self.max_interval,
                multiplier: 2.0,
            },
        };
        ReadinessPolicy {
            attempts: self.attempts,
            backoff,
            status_command: self.status_command.clone(),
            marker: self.marker.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertConfig {
    pub organization: String,
    /// Secondary DNS name added to every service certificate
    pub registry_alias: String,
    pub validity_years: u32,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            organization: "flotilla".to_string(),
            registry_alias: "sea.hub".to_string(),
            validity_years: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    pub mode: FanoutMode,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> FlotillaResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            FlotillaError::config("engine", format!("Failed to read config file: {}", e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> FlotillaResult<Self> {
        let mut config: EngineConfig = toml::from_str(contents)
            .map_err(|e| FlotillaError::config("engine", format!("Failed to parse TOML: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> FlotillaResult<()> {
        if let Ok(dir) = std::env::var("FLOTILLA_DATA_ROOT") {
            self.paths.data_root = PathBuf::from(dir);
        }
        if let Ok(user) = std::env::var("FLOTILLA_SSH_USER") {
            self.ssh.user = user;
        }
        if let Ok(attempts) = std::env::var("FLOTILLA_READINESS_ATTEMPTS") {
            self.readiness.attempts = attempts.parse().map_err(|_| {
                FlotillaError::config("readiness", "Invalid FLOTILLA_READINESS_ATTEMPTS")
            })?;
        }
        if let Ok(mode) = std::env::var("FLOTILLA_FANOUT_MODE") {
            self.fanout.mode = mode.parse()?;
        }
        Ok(())
    }

    pub fn executor(&self) -> ConcurrentExecutor {
        ConcurrentExecutor::new(self.fanout.mode)
    }

    pub fn readiness_checker(&self) -> ReadinessChecker {
        ReadinessChecker::new(self.readiness.policy())
    }

    pub fn certificate_issuer(&self) -> CertificateIssuer {
        CertificateIssuer::new(self.certs.clone())
    }

    pub fn validate(&self) -> FlotillaResult<()> {
        if self.paths.data_root.as_os_str().is_empty() {
            return Err(FlotillaError::config("paths", "data_root cannot be empty"));
        }
        if self.readiness.attempts == 0 {
            return Err(FlotillaError::config("readiness", "attempts must be at least 1"));
        }
        if self.readiness.marker.is_empty() {
            return Err(FlotillaError::config("readiness", "marker cannot be empty"));
        }
        if self.certs.organization.is_empty() {
            return Err(FlotillaError::config("certs", "organization cannot be empty"));
        }
        if self.certs.validity_years == 0 {
            return Err(FlotillaError::config("certs", "validity_years must be at least 1"));
        }
        Ok(())
    }
}
