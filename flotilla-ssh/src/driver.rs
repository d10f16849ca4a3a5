//! `InfraDriver` on top of any `RemoteShell`

use crate::checksum::{
    link_command, parse_remote_manifest, pending_uploads, remote_manifest_command, LocalTree,
};
use crate::platform::{parse_machine, UNAME_COMMAND};
use crate::shell::RemoteShell;
use async_trait::async_trait;
use flotilla_core::config::PathsConfig;
use flotilla_core::env::EnvMap;
use flotilla_core::infra_driver::{shell_quote, InfraDriver};
use flotilla_core::observability::host_span;
use flotilla_core::process::CommandOutput;
use flotilla_core::{
    ClusterSpec, ConcurrentExecutor, FlotillaError, FlotillaResult, HostRegistry, Platform,
};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, Instrument};

const ROOTFS_DIR: &str = "rootfs";

pub struct ShellInfraDriver<S: RemoteShell> {
    shell: S,
    cluster: ClusterSpec,
    registry: HostRegistry,
    data_root: PathBuf,
    platforms: RwLock<HashMap<IpAddr, Platform>>,
}

impl<S: RemoteShell> ShellInfraDriver<S> {
    pub fn new(cluster: ClusterSpec, shell: S, paths: &PathsConfig) -> FlotillaResult<Self> {
        cluster.validate()?;
        Ok(Self {
            shell,
            registry: HostRegistry::from_spec(&cluster),
            cluster,
            data_root: paths.data_root.clone(),
            platforms: RwLock::new(HashMap::new()),
        })
    }

    /// Resolve every host once so later platform lookups are served from cache.
    pub async fn connect(&self) -> FlotillaResult<()> {
        let hosts = self.registry.ips();
        ConcurrentExecutor::run_all(&hosts, |host| async move {
            let platform = self.platform(host).await?;
            debug!(host = %host, %platform, "host platform resolved");
            Ok(())
        })
        .await?;
        info!(hosts = hosts.len(), "connected to cluster hosts");
        Ok(())
    }

    /// Hosts with every platform resolved so far attached.
    pub async fn registry(&self) -> HostRegistry {
        self.registry
            .clone()
            .with_platforms(&*self.platforms.read().await)
    }

    pub fn shell(&self) -> &S {
        &self.shell
    }

    /// Run `cmd`, turning a non-zero exit into `CommandFailed`.
    async fn run_checked(&self, host: IpAddr, cmd: &str) -> FlotillaResult<CommandOutput> {
        let output = self.shell.exec(host, cmd).await?;
        if !output.is_success() {
            return Err(FlotillaError::command_failed(
                host,
                cmd,
                output.status,
                &output.combined(),
            ));
        }
        Ok(output)
    }

    /// `test -e`-style check: 0 is true, 1 is false, anything else fails.
    async fn test_path(&self, host: IpAddr, flag: &str, path: &Path) -> FlotillaResult<bool> {
        self.registry.require(host)?;
        let cmd = format!("test {} {}", flag, shell_quote(&path.to_string_lossy()));
        let output = self.shell.exec(host, &cmd).await?;
        match output.status {
            0 => Ok(true),
            1 => Ok(false),
            status => Err(FlotillaError::command_failed(
                host,
                cmd,
                status,
                &output.combined(),
            )),
        }
    }

    async fn copy_tree(&self, host: IpAddr, local: &Path, remote: &Path) -> FlotillaResult<()> {
        let source = local.to_path_buf();
        let tree = tokio::task::spawn_blocking(move || LocalTree::scan(&source))
            .await
            .map_err(|e| FlotillaError::Internal {
                message: format!("checksum task failed: {}", e),
            })??;

        let manifest_cmd = remote_manifest_command(remote, tree.is_dir);
        let listing = self.run_checked(host, &manifest_cmd).await?;
        let remote_manifest =
            parse_remote_manifest(&String::from_utf8_lossy(&listing.stdout), tree.is_dir);
        let uploads = pending_uploads(&tree.files, &remote_manifest);

        let dirs: Vec<String> = if tree.is_dir {
            tree.dirs
                .iter()
                .map(|d| shell_quote(&tree.remote_path(remote, d).to_string_lossy()))
                .collect()
        } else {
            remote
                .parent()
                .map(|p| vec![shell_quote(&p.to_string_lossy())])
                .unwrap_or_default()
        };
        let needs_dirs = tree.is_dir || !uploads.is_empty() || !tree.links.is_empty();
        if !dirs.is_empty() && needs_dirs {
            self.run_checked(host, &format!("mkdir -p {}", dirs.join(" "))).await?;
        }

        for relative in &uploads {
            let from = if relative.as_os_str().is_empty() {
                local.to_path_buf()
            } else {
                local.join(relative)
            };
            let to = tree.remote_path(remote, relative);
            self.shell.upload(host, &from, &to).await?;
        }

        if let Some(cmd) = link_command(remote, &tree.links) {
            self.run_checked(host, &cmd).await?;
        }

        info!(
            host = %host,
            files = tree.files.len(),
            links = tree.links.len(),
            uploaded = uploads.len(),
            "copy converged"
        );
        Ok(())
    }
}

#[async_trait]
impl<S: RemoteShell> InfraDriver for ShellInfraDriver<S> {
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
        for &host in hosts {
            let platform = self.platform(host).await?;
            grouped.entry(platform).or_default().push(host);
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
        self.cluster_base_path().join(ROOTFS_DIR)
    }

    fn cluster_base_path(&self) -> PathBuf {
        self.data_root.join(self.cluster.name())
    }

    async fn copy(&self, host: IpAddr, local: &Path, remote: &Path) -> FlotillaResult<()> {
        self.registry.require(host)?;
        self.copy_tree(host, local, remote)
            .instrument(host_span("copy", host))
            .await
    }

    async fn copy_r(&self, host: IpAddr, remote: &Path, local: &Path) -> FlotillaResult<()> {
        self.registry.require(host)?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.shell
            .download(host, remote, local)
            .instrument(host_span("copy_r", host))
            .await
    }

    async fn cmd_async(&self, host: IpAddr, cmds: &[String]) -> FlotillaResult<()> {
        self.registry.require(host)?;
        let sink = |line: &str| info!(host = %host, "{}", line);
        for cmd in cmds {
            let output = self
                .shell
                .exec_streaming(host, cmd, &sink)
                .instrument(host_span("cmd_async", host))
                .await?;
            if !output.is_success() {
                return Err(FlotillaError::command_failed(
                    host,
                    cmd.as_str(),
                    output.status,
                    &[],
                ));
            }
        }
        Ok(())
    }

    async fn cmd(&self, host: IpAddr, cmd: &str) -> FlotillaResult<Vec<u8>> {
        self.registry.require(host)?;
        let output = self
            .run_checked(host, cmd)
            .instrument(host_span("cmd", host))
            .await?;
        Ok(output.combined())
    }

    async fn is_file_exist(&self, host: IpAddr, path: &Path) -> FlotillaResult<bool> {
        self.test_path(host, "-f", path).await
    }

    async fn is_dir_exist(&self, host: IpAddr, path: &Path) -> FlotillaResult<bool> {
        self.test_path(host, "-d", path).await
    }

    async fn platform(&self, host: IpAddr) -> FlotillaResult<Platform> {
        self.registry.require(host)?;
        if let Some(platform) = self.platforms.read().await.get(&host) {
            return Ok(platform.clone());
        }

        let output = self.run_checked(host, UNAME_COMMAND).await?;
        let machine = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let platform = parse_machine(&machine).ok_or_else(|| {
            FlotillaError::transport(
                host,
                UNAME_COMMAND,
                format!("unsupported machine '{}'", machine),
            )
        })?;

        self.platforms.write().await.insert(host, platform.clone());
        Ok(platform)
    }

    async fn host_name(&self, host: IpAddr) -> FlotillaResult<String> {
        self.registry.require(host)?;
        let output = self.run_checked(host, "hostname").await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn set_host_name(&self, host: IpAddr, name: &str) -> FlotillaResult<()> {
        self.registry.require(host)?;
        if name.trim().is_empty() {
            return Err(FlotillaError::InvalidInput {
                field: "hostname".to_string(),
                message: "hostname cannot be empty".to_string(),
            });
        }
        let cmd = format!("hostnamectl set-hostname {}", shell_quote(name));
        self.run_checked(host, &cmd).await?;
        Ok(())
    }

    async fn ping(&self, host: IpAddr) -> FlotillaResult<()> {
        self.registry.require(host)?;
        self.run_checked(host, "true").await?;
        Ok(())
    }
}
