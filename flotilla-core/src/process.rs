//! Local process execution
//!
//! Remote transports are driven through local client binaries (`ssh`,
//! `scp`). This trait is the seam that lets them be replaced in tests.

use crate::error::{FlotillaError, FlotillaResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Output from command execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status code, -1 when killed by a signal
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    pub fn failure(status: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> Vec<u8> {
        let mut combined = self.stdout.clone();
        combined.extend_from_slice(&self.stderr);
        combined
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Receives each output line of a streamed command
pub type LineSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run to completion and capture output
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> FlotillaResult<CommandOutput>;

    /// Run to completion, handing every stdout/stderr line to `sink` as it
    /// arrives. The returned output carries only the exit status.
    async fn execute_streaming(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
        sink: LineSink<'_>,
    ) -> FlotillaResult<CommandOutput>;
}

/// Standard implementation using tokio::process
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandExecutor;

#[async_trait]
impl CommandExecutor for TokioCommandExecutor {
    #[instrument(skip(self, args), fields(args_count = args.len()))]
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> FlotillaResult<CommandOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| FlotillaError::Internal {
                message: format!("Command '{}' timed out after {:?}", program, timeout),
            })?
            .map_err(|e| FlotillaError::Internal {
                message: format!("Failed to run '{}': {}", program, e),
            })?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn execute_streaming(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
        sink: LineSink<'_>,
    ) -> FlotillaResult<CommandOutput> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FlotillaError::Internal {
                message: format!("Failed to spawn '{}': {}", program, e),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            let forward_stdout = async {
                if let Some(out) = stdout {
                    let mut lines = BufReader::new(out).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        sink(&line);
                    }
                }
            };
            let forward_stderr = async {
                if let Some(err) = stderr {
                    let mut lines = BufReader::new(err).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        sink(&line);
                    }
                }
            };
            tokio::join!(forward_stdout, forward_stderr);
            child.wait().await
        };

        let status = tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| FlotillaError::Internal {
                message: format!("Command '{}' timed out after {:?}", program, timeout),
            })?
            .map_err(|e| FlotillaError::Internal {
                message: format!("Failed to wait for '{}': {}", program, e),
            })?;

        debug!(program, status = ?status.code(), "streamed command finished");
        Ok(CommandOutput {
            status: status.code().unwrap_or(-1),
            ..Default::default()
        })
    }
}

/// One recorded invocation of the mock executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

/// Mock implementation for testing
///
/// Responses are matched in order against the first expectation whose
/// predicate accepts the invocation; unmatched invocations succeed with
/// empty output.
#[derive(Clone, Default)]
pub struct MockCommandExecutor {
    invocations: Arc<Mutex<Vec<Invocation>>>,
    expectations: Arc<Mutex<VecDeque<MockExpectation>>>,
}

struct MockExpectation {
    matches: Box<dyn Fn(&Invocation) -> bool + Send + Sync>,
    response: CommandOutput,
}

impl MockCommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next invocation whose joined command line contains `needle`.
    pub fn expect_containing(&self, needle: &str, response: CommandOutput) {
        let needle = needle.to_string();
        self.expectations.lock().unwrap().push_back(MockExpectation {
            matches: Box::new(move |inv| {
                inv.args.iter().any(|a| a.contains(&needle)) || inv.program.contains(&needle)
            }),
            response,
        });
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    fn respond(&self, program: &str, args: &[String]) -> CommandOutput {
        let invocation = Invocation {
            program: program.to_string(),
            args: args.to_vec(),
        };
        let mut expectations = self.expectations.lock().unwrap();
        let response = expectations
            .iter()
            .position(|e| (e.matches)(&invocation))
            .and_then(|pos| expectations.remove(pos))
            .map(|e| e.response)
            .unwrap_or_else(|| CommandOutput::success(Vec::new()));
        self.invocations.lock().unwrap().push(invocation);
        response
    }
}

#[async_trait]
impl CommandExecutor for MockCommandExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        _timeout: Duration,
    ) -> FlotillaResult<CommandOutput> {
        Ok(self.respond(program, args))
    }

    async fn execute_streaming(
        &self,
        program: &str,
        args: &[String],
        _timeout: Duration,
        sink: LineSink<'_>,
    ) -> FlotillaResult<CommandOutput> {
        let output = self.respond(program, args);
        for line in String::from_utf8_lossy(&output.combined()).lines() {
            sink(line);
        }
        Ok(CommandOutput {
            status: output.status,
            ..Default::default()
        })
    }
}
