//! Core error types for Flotilla
//!
//! Every remote failure carries the host it happened on and the action that
//! was attempted. Components wrap and propagate; nothing here retries.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// One failed unit of a fan-out call.
#[derive(Debug)]
pub struct HostFailure {
    pub host: IpAddr,
    pub error: FlotillaError,
}

impl std::fmt::Display for HostFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.host, self.error)
    }
}

#[derive(Error, Debug)]
pub enum FlotillaError {
    // Remote execution
    #[error("Remote operation '{action}' failed on host {host}: {details}")]
    Transport {
        host: IpAddr,
        action: String,
        details: String,
    },

    /// The command ran but exited non-zero.
    #[error("Command '{cmd}' exited with status {status} on host {host}: {output}")]
    CommandFailed {
        host: IpAddr,
        cmd: String,
        status: i32,
        output: String,
    },

    #[error("Host {host} is not part of the cluster")]
    UnknownHost { host: IpAddr },

    #[error("{} of the fan-out hosts failed: {}", failures.len(), format_failures(failures))]
    Fanout { failures: Vec<HostFailure> },

    // Distribution
    #[error("Failed to render {path:?}: {message}")]
    Render { path: PathBuf, message: String },

    #[error("Failed to dump config into {path:?}: {message}")]
    ConfigDump { path: PathBuf, message: String },

    // Bootstrap
    #[error("Host {host} not ready after {attempts} attempts ({elapsed:?})")]
    ReadinessTimeout {
        host: IpAddr,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("Certificate error for '{service}': {message}")]
    Certificate { service: String, message: String },

    // Configuration
    #[error("Configuration error in {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Invalid input for {field}: {message}")]
    InvalidInput { field: String, message: String },

    // Wrapped library errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type FlotillaResult<T> = std::result::Result<T, FlotillaError>;

fn format_failures(failures: &[HostFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl FlotillaError {
    pub fn transport(host: IpAddr, action: impl Into<String>, details: impl ToString) -> Self {
        FlotillaError::Transport {
            host,
            action: action.into(),
            details: details.to_string(),
        }
    }

    pub fn command_failed(
        host: IpAddr,
        cmd: impl Into<String>,
        status: i32,
        output: &[u8],
    ) -> Self {
        FlotillaError::CommandFailed {
            host,
            cmd: cmd.into(),
            status,
            output: String::from_utf8_lossy(output).trim().to_string(),
        }
    }

    pub fn certificate(service: &str, message: impl Into<String>) -> Self {
        FlotillaError::Certificate {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn config(component: &str, message: impl Into<String>) -> Self {
        FlotillaError::Configuration {
            component: component.to_string(),
            message: message.into(),
        }
    }

    /// Copy, command and path check failures.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FlotillaError::Transport { .. }
                | FlotillaError::CommandFailed { .. }
                | FlotillaError::UnknownHost { .. }
        )
    }

    /// Remote side was reached and answered with a non-zero exit.
    pub fn is_command_failure(&self) -> bool {
        matches!(self, FlotillaError::CommandFailed { .. })
    }

    pub fn is_readiness_timeout(&self) -> bool {
        matches!(self, FlotillaError::ReadinessTimeout { .. })
    }

    /// Host the error is attributed to, if any.
    pub fn host(&self) -> Option<IpAddr> {
        match self {
            FlotillaError::Transport { host, .. }
            | FlotillaError::CommandFailed { host, .. }
            | FlotillaError::UnknownHost { host }
            | FlotillaError::ReadinessTimeout { host, .. } => Some(*host),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_names_host_and_action() {
        let host: IpAddr = "10.0.0.7".parse().unwrap();
        let err = FlotillaError::transport(host, "copy /tmp/a", "connection reset");

        let msg = err.to_string();
        assert!(msg.contains("10.0.0.7"));
        assert!(msg.contains("copy /tmp/a"));
        assert!(msg.contains("connection reset"));
        assert!(err.is_transport());
        assert_eq!(err.host(), Some(host));
    }

    #[test]
    fn test_fanout_error_lists_every_host() {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        let err = FlotillaError::Fanout {
            failures: vec![
                HostFailure {
                    host: a,
                    error: FlotillaError::transport(a, "rm", "denied"),
                },
                HostFailure {
                    host: b,
                    error: FlotillaError::transport(b, "rm", "timeout"),
                },
            ],
        };

        let msg = err.to_string();
        assert!(msg.starts_with("2 of the fan-out hosts failed"));
        assert!(msg.contains("[10.0.0.1]"));
        assert!(msg.contains("[10.0.0.2]"));
        assert!(!err.is_transport());
    }

    #[test]
    fn test_command_failure_keeps_status_and_output() {
        let host: IpAddr = "10.0.0.4".parse().unwrap();
        let err = FlotillaError::command_failed(host, "k0s status", 1, b"connect failed\n");

        assert!(err.is_command_failure());
        assert!(err.is_transport());
        assert_eq!(err.host(), Some(host));
        match err {
            FlotillaError::CommandFailed { status, output, .. } => {
                assert_eq!(status, 1);
                assert_eq!(output, "connect failed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_readiness_timeout_is_distinct() {
        let err = FlotillaError::ReadinessTimeout {
            host: "10.0.0.3".parse().unwrap(),
            attempts: 5,
            elapsed: Duration::from_secs(8),
        };
        assert!(err.is_readiness_timeout());
        assert!(!err.is_transport());
    }
}
