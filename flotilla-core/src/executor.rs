//! Concurrent per-host fan-out
//!
//! One future per host, all polled together on the calling task. The call
//! returns only after every host has finished; a failure on one host never
//! cancels the others.

use crate::error::{FlotillaError, FlotillaResult, HostFailure};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::{debug, warn};

/// How failures of a fan-out call are reported to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FanoutMode {
    /// Surface only the first failure observed
    #[default]
    FirstError,
    /// Surface every failing host in a `FlotillaError::Fanout`
    AllErrors,
}

impl FromStr for FanoutMode {
    type Err = FlotillaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-error" => Ok(FanoutMode::FirstError),
            "all-errors" => Ok(FanoutMode::AllErrors),
            other => Err(FlotillaError::InvalidInput {
                field: "fanout.mode".to_string(),
                message: format!("unknown fan-out mode '{}'", other),
            }),
        }
    }
}

/// Outcome of a fan-out call that keeps every failure.
#[derive(Debug, Default)]
pub struct FanoutReport {
    pub succeeded: Vec<IpAddr>,
    /// In completion order
    pub failures: Vec<HostFailure>,
}

impl FanoutReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_hosts(&self) -> Vec<IpAddr> {
        self.failures.iter().map(|f| f.host).collect()
    }

    /// Reduce to the first failure observed.
    pub fn into_first_error(self) -> FlotillaResult<()> {
        match self.failures.into_iter().next() {
            Some(failure) => Err(failure.error),
            None => Ok(()),
        }
    }

    pub fn into_result(self) -> FlotillaResult<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(FlotillaError::Fanout {
                failures: self.failures,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConcurrentExecutor {
    mode: FanoutMode,
}

impl ConcurrentExecutor {
    pub fn new(mode: FanoutMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> FanoutMode {
        self.mode
    }

    /// Run `op` on every host and reduce according to the configured mode.
    pub async fn run<F, Fut>(&self, hosts: &[IpAddr], op: F) -> FlotillaResult<()>
    where
        F: Fn(IpAddr) -> Fut,
        Fut: Future<Output = FlotillaResult<()>>,
    {
        let report = Self::run_all_collect(hosts, op).await;
        match self.mode {
            FanoutMode::FirstError => report.into_first_error(),
            FanoutMode::AllErrors => report.into_result(),
        }
    }

    /// Run `op` on every host; the first failure observed is returned.
    pub async fn run_all<F, Fut>(hosts: &[IpAddr], op: F) -> FlotillaResult<()>
    where
        F: Fn(IpAddr) -> Fut,
        Fut: Future<Output = FlotillaResult<()>>,
    {
        Self::run_all_collect(hosts, op).await.into_first_error()
    }

    /// Run `op` on every host and keep every failure.
    pub async fn run_all_collect<F, Fut>(hosts: &[IpAddr], op: F) -> FanoutReport
    where
        F: Fn(IpAddr) -> Fut,
        Fut: Future<Output = FlotillaResult<()>>,
    {
        let mut pending: FuturesUnordered<_> = hosts
            .iter()
            .map(|&host| {
                let unit = op(host);
                async move { (host, unit.await) }
            })
            .collect();

        let mut report = FanoutReport::default();
        while let Some((host, result)) = pending.next().await {
            match result {
                Ok(()) => {
                    debug!(host = %host, "fan-out unit succeeded");
                    report.succeeded.push(host);
                }
                Err(error) => {
                    warn!(host = %host, error = %error, "fan-out unit failed");
                    report.failures.push(HostFailure { host, error });
                }
            }
        }
        report
    }
}
