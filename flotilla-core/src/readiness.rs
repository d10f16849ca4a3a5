//! Bootstrap readiness polling
//!
//! After a runtime is started on a host its status command is polled until
//! the output contains a marker or the attempt budget runs out. The loop is
//! an explicit state machine so the policy can be exercised without a host.

use crate::error::{FlotillaError, FlotillaResult};
use crate::infra_driver::InfraDriver;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Delay between attempts
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Exponential increase in delay (base * multiplier^(attempt-1))
    Exponential {
        base: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl BackoffStrategy {
    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(duration) => *duration,

            BackoffStrategy::Exponential {
                base,
                max,
                multiplier,
            } => {
                let factor = multiplier.powf(attempt.saturating_sub(1) as f64);
                let delay_ms = (base.as_millis() as f64 * factor) as u64;
                std::cmp::min(Duration::from_millis(delay_ms), *max)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub backoff: BackoffStrategy,
    pub status_command: String,
    /// Substring of the status output that means "ready"
    pub marker: String,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: BackoffStrategy::Fixed(Duration::from_secs(2)),
            status_command: "k0s status".to_string(),
            marker: "Process".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    Polling { remaining: u32 },
    Ready { attempts: u32 },
    Exhausted { attempts: u32 },
}

impl ReadinessState {
    pub fn start(policy: &ReadinessPolicy) -> Self {
        if policy.attempts == 0 {
            ReadinessState::Exhausted { attempts: 0 }
        } else {
            ReadinessState::Polling {
                remaining: policy.attempts,
            }
        }
    }

    /// Feed the result of one status attempt. Terminal states absorb.
    pub fn observe(self, policy: &ReadinessPolicy, marker_seen: bool) -> Self {
        match self {
            ReadinessState::Polling { remaining } => {
                let attempts = policy.attempts - remaining + 1;
                if marker_seen {
                    ReadinessState::Ready { attempts }
                } else if remaining <= 1 {
                    ReadinessState::Exhausted { attempts }
                } else {
                    ReadinessState::Polling {
                        remaining: remaining - 1,
                    }
                }
            }
            terminal => terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReadinessState::Polling { .. })
    }
}

/// What a successful wait looked like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessOutcome {
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ReadinessChecker {
    policy: ReadinessPolicy,
}

impl ReadinessChecker {
    pub fn new(policy: ReadinessPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ReadinessPolicy {
        &self.policy
    }

    /// Poll `host` until ready. A failure to reach the host is returned
    /// immediately. A status command that ran but did not print the marker,
    /// whatever its exit status, counts as "not ready yet".
    pub async fn wait(
        &self,
        driver: &dyn InfraDriver,
        host: IpAddr,
    ) -> FlotillaResult<ReadinessOutcome> {
        let started = Instant::now();
        let mut state = ReadinessState::start(&self.policy);
        let mut attempt = 0;

        while let ReadinessState::Polling { .. } = state {
            if attempt > 0 {
                sleep(self.policy.backoff.delay(attempt)).await;
            }
            attempt += 1;

            let marker_seen = match driver.cmd(host, &self.policy.status_command).await {
                Ok(output) => String::from_utf8_lossy(&output).contains(&self.policy.marker),
                Err(FlotillaError::CommandFailed { status, output, .. }) => {
                    debug!(host = %host, attempt, status, %output, "status command failed");
                    false
                }
                Err(e) => return Err(e),
            };
            debug!(host = %host, attempt, marker_seen, "readiness attempt");

            state = state.observe(&self.policy, marker_seen);
        }

        let elapsed = started.elapsed();
        match state {
            ReadinessState::Ready { attempts } => {
                info!(host = %host, attempts, ?elapsed, "host is ready");
                Ok(ReadinessOutcome { attempts, elapsed })
            }
            ReadinessState::Exhausted { attempts } => {
                warn!(host = %host, attempts, ?elapsed, "readiness budget exhausted");
                Err(FlotillaError::ReadinessTimeout {
                    host,
                    attempts,
                    elapsed,
                })
            }
            ReadinessState::Polling { .. } => Err(FlotillaError::Internal {
                message: "readiness loop left while polling".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_state_machine_ready_on_third_attempt() {
        let policy = ReadinessPolicy::default();
        let mut state = ReadinessState::start(&policy);
        state = state.observe(&policy, false);
        state = state.observe(&policy, false);
        assert_eq!(state, ReadinessState::Polling { remaining: 3 });
        state = state.observe(&policy, true);
        assert_eq!(state, ReadinessState::Ready { attempts: 3 });
        assert!(state.is_terminal());
    }

    #[test]
    fn test_state_machine_exhausts() {
        let policy = ReadinessPolicy::default();
        let mut state = ReadinessState::start(&policy);
        for _ in 0..5 {
            state = state.observe(&policy, false);
        }
        assert_eq!(state, ReadinessState::Exhausted { attempts: 5 });
        assert_eq!(
            state.observe(&policy, true),
            ReadinessState::Exhausted { attempts: 5 }
        );
    }

    #[test]
    fn test_single_attempt_budget() {
        let policy = ReadinessPolicy {
            attempts: 1,
            ..Default::default()
        };
        let state = ReadinessState::start(&policy).observe(&policy, false);
        assert_eq!(state, ReadinessState::Exhausted { attempts: 1 });
    }

    #[test]
    fn test_backoff_delays() {
        let fixed = BackoffStrategy::Fixed(Duration::from_secs(2));
        assert_eq!(fixed.delay(1), Duration::from_secs(2));
        assert_eq!(fixed.delay(4), Duration::from_secs(2));

        let exp = BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
            multiplier: 2.0,
        };
        assert_eq!(exp.delay(1), Duration::from_millis(100));
        assert_eq!(exp.delay(2), Duration::from_millis(200));
        assert_eq!(exp.delay(3), Duration::from_millis(350));
    }
}
