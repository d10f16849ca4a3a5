use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::env::EnvMap;
use crate::error::FlotillaResult;
use crate::types::Platform;

/// The cluster seen as one machine
///
/// Every interaction with a remote host goes through this trait; higher
/// layers (distributor, readiness, bootstrap) never see the transport.
/// Implementations report failures as `FlotillaError::Transport` naming the
/// host and the action, and never retry on their own.
///
/// ## Copy semantics
///
/// `copy` is convergent: copying the same source to the same destination
/// twice leaves the remote tree unchanged and should not re-transfer files
/// whose content already matches. Implementations compare checksums rather
/// than uploading unconditionally.
///
/// ## Concurrency
///
/// Implementations must be `Send + Sync`; the executor calls the same driver
/// for many hosts at once. Apart from transport connection reuse no state is
/// kept between calls.
#[async_trait]
pub trait InfraDriver: Send + Sync {
    /// All hosts in cluster file order
    fn host_ips(&self) -> Vec<IpAddr>;

    fn host_ips_by_role(&self, role: &str) -> Vec<IpAddr>;

    /// Group hosts by their platform, probing hosts not resolved yet
    async fn hosts_platform(
        &self,
        hosts: &[IpAddr],
    ) -> FlotillaResult<BTreeMap<Platform, Vec<IpAddr>>>;

    /// Host env merged over the cluster env; the host wins on collisions
    fn host_env(&self, host: IpAddr) -> EnvMap;

    fn cluster_env(&self) -> EnvMap;

    fn cluster_name(&self) -> String;

    fn cluster_image_name(&self) -> String;

    fn cluster_launch_cmds(&self) -> Vec<String>;

    /// `<data root>/<cluster name>/rootfs`
    fn cluster_rootfs_path(&self) -> PathBuf;

    /// `<data root>/<cluster name>`
    fn cluster_base_path(&self) -> PathBuf;

    /// Copy a local file or directory to `remote` on `host`
    async fn copy(&self, host: IpAddr, local: &Path, remote: &Path) -> FlotillaResult<()>;

    /// Copy a remote file to the local machine
    async fn copy_r(&self, host: IpAddr, remote: &Path, local: &Path) -> FlotillaResult<()>;

    /// Run commands in order, streaming their output to the log
    async fn cmd_async(&self, host: IpAddr, cmds: &[String]) -> FlotillaResult<()>;

    /// Run a command and return combined stdout and stderr
    async fn cmd(&self, host: IpAddr, cmd: &str) -> FlotillaResult<Vec<u8>>;

    /// Run a command and join its trimmed output lines with `split`
    async fn cmd_to_string(&self, host: IpAddr, cmd: &str, split: &str) -> FlotillaResult<String> {
        let output = self.cmd(host, cmd).await?;
        Ok(join_lines(&output, split))
    }

    async fn is_file_exist(&self, host: IpAddr, path: &Path) -> FlotillaResult<bool>;

    async fn is_dir_exist(&self, host: IpAddr, path: &Path) -> FlotillaResult<bool>;

    async fn platform(&self, host: IpAddr) -> FlotillaResult<Platform>;

    async fn host_name(&self, host: IpAddr) -> FlotillaResult<String>;

    async fn set_host_name(&self, host: IpAddr, name: &str) -> FlotillaResult<()>;

    async fn ping(&self, host: IpAddr) -> FlotillaResult<()>;
}

/// Quote a word for a POSIX shell command line.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

pub(crate) fn join_lines(output: &[u8], split: &str) -> String {
    String::from_utf8_lossy(output)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(split)
}
