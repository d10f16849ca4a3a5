//! In-process `InfraDriver` for tests
//!
//! Every host gets a sandbox directory under a caller supplied root; copies
//! land there so tests can inspect what each host received. Commands are
//! recorded and answered from a script.

use crate::env::EnvMap;
use crate::error::{FlotillaError, FlotillaResult};
use crate::infra_driver::InfraDriver;
use crate::registry::HostRegistry;
use crate::types::{ClusterSpec, Platform};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Copy { host: IpAddr, local: PathBuf, remote: PathBuf },
    CopyR { host: IpAddr, remote: PathBuf, local: PathBuf },
    CmdAsync { host: IpAddr, cmd: String },
    Cmd { host: IpAddr, cmd: String },
    SetHostName { host: IpAddr, name: String },
    Ping { host: IpAddr },
}

impl DriverCall {
    pub fn host(&self) -> IpAddr {
        match self {
            DriverCall::Copy { host, .. }
            | DriverCall::CopyR { host, .. }
            | DriverCall::CmdAsync { host, .. }
            | DriverCall::Cmd { host, .. }
            | DriverCall::SetHostName { host, .. }
            | DriverCall::Ping { host } => *host,
        }
    }
}

/// Scripted answer to `cmd`
#[derive(Debug, Clone)]
pub enum Reply {
    Output(String),
    /// The host could not be reached
    Fail(String),
    /// The command ran and exited with this status and output
    Exit(i32, String),
}

pub struct RecordingDriver {
    registry: HostRegistry,
    cluster: ClusterSpec,
    data_root: PathBuf,
    sandbox: PathBuf,
    calls: Mutex<Vec<DriverCall>>,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    failing: Mutex<HashSet<IpAddr>>,
    hostnames: Mutex<HashMap<IpAddr, String>>,
    platforms: HashMap<IpAddr, Platform>,
}

impl RecordingDriver {
    pub fn new(cluster: ClusterSpec, sandbox: impl Into<PathBuf>) -> Self {
        Self {
            registry: HostRegistry::from_spec(&cluster),
            cluster,
            data_root: PathBuf::from("/var/lib/flotilla/data"),
            sandbox: sandbox.into(),
            calls: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            hostnames: Mutex::new(HashMap::new()),
            platforms: HashMap::new(),
        }
    }

    /// A cluster named `test` whose hosts all carry `role`.
    pub fn with_hosts(hosts: &[IpAddr], role: &str, sandbox: impl Into<PathBuf>) -> Self {
        let yaml = format!(
            "metadata: {{ name: test }}\nspec:\n  hosts:\n    - ips: [{}]\n      roles: [{}]\n",
            hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>().join(", "),
            role
        );
        let cluster = ClusterSpec::from_yaml_str(&yaml).expect("generated cluster spec parses");
        Self::new(cluster, sandbox)
    }

    pub fn with_platform(mut self, host: IpAddr, platform: Platform) -> Self {
        self.platforms.insert(host, platform);
        self
    }

    /// Queue replies for `cmd`; the last reply repeats once the queue drains.
    pub fn respond(&self, cmd: &str, replies: Vec<Reply>) {
        self.replies
            .lock()
            .unwrap()
            .insert(cmd.to_string(), replies.into());
    }

    /// Every operation on `host` fails from now on.
    pub fn fail_host(&self, host: IpAddr) {
        self.failing.lock().unwrap().insert(host);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, host: IpAddr) -> Vec<DriverCall> {
        self.calls().into_iter().filter(|c| c.host() == host).collect()
    }

    /// Where `remote` on `host` lives inside the sandbox.
    pub fn host_path(&self, host: IpAddr, remote: &Path) -> PathBuf {
        let relative = remote.strip_prefix("/").unwrap_or(remote);
        self.sandbox.join(host.to_string()).join(relative)
    }

    fn record(&self, call: DriverCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, host: IpAddr, action: &str) -> FlotillaResult<()> {
        self.registry.require(host)?;
        if self.failing.lock().unwrap().contains(&host) {
            return Err(FlotillaError::transport(host, action, "injected failure"));
        }
        Ok(())
    }

    fn next_reply(&self, cmd: &str) -> Reply {
        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(cmd) {
            Some(queue) if queue.len() > 1 => {
                queue.pop_front().unwrap_or(Reply::Output(String::new()))
            }
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or(Reply::Output(String::new())),
            None => Reply::Output(String::new()),
        }
    }
}

fn copy_tree(source: &Path, target: &Path) -> std::io::Result<()> {
    if source.symlink_metadata()?.file_type().is_symlink() {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        return copy_link(source, target);
    }
    if source.is_file() {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, target)?;
        return Ok(());
    }
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?;
        let destination = target.join(relative);
        if entry.path_is_symlink() {
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            copy_link(entry.path(), &destination)?;
        } else if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else {
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

/// Recreate the link itself, never its target.
#[cfg(unix)]
fn copy_link(link: &Path, destination: &Path) -> std::io::Result<()> {
    let target = std::fs::read_link(link)?;
    if destination.symlink_metadata().is_ok() {
        std::fs::remove_file(destination)?;
    }
    std::os::unix::fs::symlink(target, destination)
}

#[cfg(not(unix))]
fn copy_link(_link: &Path, _destination: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl InfraDriver for RecordingDriver {
    fn host_ips(&self) -> Vec<IpAddr> {
        self.registry.ips()
    }

    fn host_ips_by_role(&self, role: &str) -> Vec<IpAddr> {
        self.registry.ips_by_role(role)
    }

    async fn hosts_platform(
        &self,
        hosts: &[IpAddr],
    ) -> FlotillaResult<BTreeMap<Platform, Vec<IpAddr>>> {
        let mut grouped: BTreeMap<Platform, Vec<IpAddr>> = BTreeMap::new();
        for host in hosts {
            let platform = self.platform(*host).await?;
            grouped.entry(platform).or_default().push(*host);
        }
        Ok(grouped)
    }

    fn host_env(&self, host: IpAddr) -> EnvMap {
        self.registry.host_env(host)
    }

    fn cluster_env(&self) -> EnvMap {
        self.registry.cluster_env().clone()
    }

    fn cluster_name(&self) -> String {
        self.cluster.name().to_string()
    }

    fn cluster_image_name(&self) -> String {
        self.cluster.spec.image.clone()
    }

    fn cluster_launch_cmds(&self) -> Vec<String> {
        self.cluster.spec.cmds.clone()
    }

    fn cluster_rootfs_path(&self) -> PathBuf {
        self.cluster_base_path().join("rootfs")
    }

    fn cluster_base_path(&self) -> PathBuf {
        self.data_root.join(self.cluster.name())
    }

    async fn copy(&self, host: IpAddr, local: &Path, remote: &Path) -> FlotillaResult<()> {
        self.record(DriverCall::Copy {
            host,
            local: local.to_path_buf(),
            remote: remote.to_path_buf(),
        });
        self.check(host, "copy")?;
        copy_tree(local, &self.host_path(host, remote))
            .map_err(|e| FlotillaError::transport(host, format!("copy {:?}", local), e))
    }

    async fn copy_r(&self, host: IpAddr, remote: &Path, local: &Path) -> FlotillaResult<()> {
        self.record(DriverCall::CopyR {
            host,
            remote: remote.to_path_buf(),
            local: local.to_path_buf(),
        });
        self.check(host, "copy_r")?;
        copy_tree(&self.host_path(host, remote), local)
            .map_err(|e| FlotillaError::transport(host, format!("fetch {:?}", remote), e))
    }

    async fn cmd_async(&self, host: IpAddr, cmds: &[String]) -> FlotillaResult<()> {
        for cmd in cmds {
            self.record(DriverCall::CmdAsync {
                host,
                cmd: cmd.clone(),
            });
            self.check(host, cmd)?;
            match self.next_reply(cmd) {
                Reply::Output(_) => {}
                Reply::Fail(details) => {
                    return Err(FlotillaError::transport(host, cmd.as_str(), details))
                }
                Reply::Exit(status, output) => {
                    return Err(FlotillaError::command_failed(
                        host,
                        cmd.as_str(),
                        status,
                        output.as_bytes(),
                    ))
                }
            }
        }
        Ok(())
    }

    async fn cmd(&self, host: IpAddr, cmd: &str) -> FlotillaResult<Vec<u8>> {
        self.record(DriverCall::Cmd {
            host,
            cmd: cmd.to_string(),
        });
        self.check(host, cmd)?;
        match self.next_reply(cmd) {
            Reply::Output(output) => Ok(output.into_bytes()),
            Reply::Fail(details) => Err(FlotillaError::transport(host, cmd, details)),
            Reply::Exit(status, output) => Err(FlotillaError::command_failed(
                host,
                cmd,
                status,
                output.as_bytes(),
            )),
        }
    }

    async fn is_file_exist(&self, host: IpAddr, path: &Path) -> FlotillaResult<bool> {
        self.check(host, "test -f")?;
        Ok(self.host_path(host, path).is_file())
    }

    async fn is_dir_exist(&self, host: IpAddr, path: &Path) -> FlotillaResult<bool> {
        self.check(host, "test -d")?;
        Ok(self.host_path(host, path).is_dir())
    }

    async fn platform(&self, host: IpAddr) -> FlotillaResult<Platform> {
        self.check(host, "uname -m")?;
        Ok(self
            .platforms
            .get(&host)
            .cloned()
            .unwrap_or_else(|| Platform::new("linux", "amd64", "")))
    }

    async fn host_name(&self, host: IpAddr) -> FlotillaResult<String> {
        self.check(host, "hostname")?;
        Ok(self
            .hostnames
            .lock()
            .unwrap()
            .get(&host)
            .cloned()
            .unwrap_or_else(|| format!("host-{}", host).replace(['.', ':'], "-")))
    }

    async fn set_host_name(&self, host: IpAddr, name: &str) -> FlotillaResult<()> {
        self.record(DriverCall::SetHostName {
            host,
            name: name.to_string(),
        });
        self.check(host, "hostnamectl set-hostname")?;
        self.hostnames.lock().unwrap().insert(host, name.to_string());
        Ok(())
    }

    async fn ping(&self, host: IpAddr) -> FlotillaResult<()> {
        self.record(DriverCall::Ping { host });
        self.check(host, "ping")
    }
}
