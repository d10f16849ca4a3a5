//! Shells used by the driver tests

#![allow(dead_code)]

use async_trait::async_trait;
use flotilla_core::process::{CommandExecutor, CommandOutput, LineSink, TokioCommandExecutor};
use flotilla_core::{ClusterSpec, FlotillaError, FlotillaResult};
use flotilla_ssh::RemoteShell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub const LOOPBACK: &str = "127.0.0.1";

pub fn loopback() -> IpAddr {
    LOOPBACK.parse().unwrap()
}

pub fn cluster(hosts: &[&str]) -> ClusterSpec {
    ClusterSpec::from_yaml_str(&format!(
        "metadata: {{ name: demo }}\n\
         spec:\n  cmds: [\"true\"]\n  hosts:\n    - ips: [{}]\n      roles: [master]\n",
        hosts.join(", ")
    ))
    .unwrap()
}

/// Runs every command on the local machine through `sh -c`; uploads and
/// downloads are plain file copies. Remote paths are therefore local paths.
#[derive(Default)]
pub struct LoopbackShell {
    uploads: Mutex<Vec<PathBuf>>,
    commands: Mutex<Vec<String>>,
    unreachable: Mutex<HashSet<IpAddr>>,
}

impl LoopbackShell {
    pub fn uploads(&self) -> Vec<PathBuf> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn clear_uploads(&self) {
        self.uploads.lock().unwrap().clear();
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn disconnect(&self, host: IpAddr) {
        self.unreachable.lock().unwrap().insert(host);
    }

    fn reach(&self, host: IpAddr, action: &str) -> FlotillaResult<()> {
        if self.unreachable.lock().unwrap().contains(&host) {
            return Err(FlotillaError::transport(host, action, "Connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteShell for LoopbackShell {
    async fn upload(&self, host: IpAddr, local: &Path, remote: &Path) -> FlotillaResult<()> {
        self.reach(host, "upload")?;
        tokio::fs::copy(local, remote)
            .await
            .map_err(|e| FlotillaError::transport(host, format!("upload {:?}", local), e))?;
        self.uploads.lock().unwrap().push(remote.to_path_buf());
        Ok(())
    }

    async fn download(&self, host: IpAddr, remote: &Path, local: &Path) -> FlotillaResult<()> {
        self.reach(host, "download")?;
        tokio::fs::copy(remote, local)
            .await
            .map_err(|e| FlotillaError::transport(host, format!("download {:?}", remote), e))?;
        Ok(())
    }

    async fn exec(&self, host: IpAddr, cmd: &str) -> FlotillaResult<CommandOutput> {
        self.reach(host, cmd)?;
        self.commands.lock().unwrap().push(cmd.to_string());
        TokioCommandExecutor
            .execute("sh", &["-c".to_string(), cmd.to_string()], Duration::from_secs(30))
            .await
    }

    async fn exec_streaming(
        &self,
        host: IpAddr,
        cmd: &str,
        sink: LineSink<'_>,
    ) -> FlotillaResult<CommandOutput> {
        self.reach(host, cmd)?;
        self.commands.lock().unwrap().push(cmd.to_string());
        TokioCommandExecutor
            .execute_streaming(
                "sh",
                &["-c".to_string(), cmd.to_string()],
                Duration::from_secs(30),
                sink,
            )
            .await
    }
}

/// Answers commands from a script; unscripted commands succeed silently.
#[derive(Default)]
pub struct ScriptedShell {
    replies: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedShell {
    pub fn reply(&self, cmd: &str, output: CommandOutput) {
        self.replies
            .lock()
            .unwrap()
            .entry(cmd.to_string())
            .or_default()
            .push_back(output);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    fn answer(&self, cmd: &str) -> CommandOutput {
        self.executed.lock().unwrap().push(cmd.to_string());
        self.replies
            .lock()
            .unwrap()
            .get_mut(cmd)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn upload(&self, _host: IpAddr, _local: &Path, _remote: &Path) -> FlotillaResult<()> {
        Ok(())
    }

    async fn download(&self, _host: IpAddr, _remote: &Path, _local: &Path) -> FlotillaResult<()> {
        Ok(())
    }

    async fn exec(&self, _host: IpAddr, cmd: &str) -> FlotillaResult<CommandOutput> {
        Ok(self.answer(cmd))
    }

    async fn exec_streaming(
        &self,
        _host: IpAddr,
        cmd: &str,
        sink: LineSink<'_>,
    ) -> FlotillaResult<CommandOutput> {
        let output = self.answer(cmd);
        for line in String::from_utf8_lossy(&output.combined()).lines() {
            sink(line);
        }
        Ok(CommandOutput {
            status: output.status,
            ..Default::default()
        })
    }
}
