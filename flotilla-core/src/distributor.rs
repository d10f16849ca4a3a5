//! Rootfs and registry distribution
//!
//! For every mounted image layer, in the order supplied:
//! dump config -> render templates -> copy top-level entries to all hosts.
//! The `registry` directory never goes out with the rootfs; it is shipped
//! separately to the registry host by `distribute_registry`.

use crate::config_dump::ConfigDumper;
use crate::error::{FlotillaError, FlotillaResult};
use crate::executor::ConcurrentExecutor;
use crate::infra_driver::{shell_quote, InfraDriver};
use crate::observability::stage_span;
use crate::render::{TemplateRenderer, TeraRenderer};
use crate::types::{ConfigEntry, MountInfo};
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, Instrument};

pub const REGISTRY_DIR_NAME: &str = "registry";
pub const ETC_DIR: &str = "etc";
pub const CHARTS_DIR: &str = "charts";
pub const MANIFESTS_DIR: &str = "manifests";

/// Subdirectories of a rootfs that may contain templates
pub const RENDER_DIRS: [&str; 3] = [ETC_DIR, CHARTS_DIR, MANIFESTS_DIR];

#[async_trait]
pub trait Distributor: Send + Sync {
    /// Copy each mounted rootfs, minus its registry, to `rootfs_path` on every host
    async fn distribute_rootfs(&self, hosts: &[IpAddr], rootfs_path: &Path) -> FlotillaResult<()>;

    /// Copy each mounted registry directory to `data_dir` on one host
    async fn distribute_registry(&self, deploy_host: IpAddr, data_dir: &Path) -> FlotillaResult<()>;

    /// Remove `target_dir` from every host
    async fn restore(&self, target_dir: &Path, hosts: &[IpAddr]) -> FlotillaResult<()>;
}

pub struct ScpDistributor {
    driver: Arc<dyn InfraDriver>,
    mounts: MountInfo,
    dumper: ConfigDumper,
    renderer: Arc<dyn TemplateRenderer>,
    executor: ConcurrentExecutor,
}

impl ScpDistributor {
    pub fn new(mounts: MountInfo, driver: Arc<dyn InfraDriver>, configs: Vec<ConfigEntry>) -> Self {
        Self {
            driver,
            mounts,
            dumper: ConfigDumper::new(configs),
            renderer: Arc::new(TeraRenderer::new()),
            executor: ConcurrentExecutor::default(),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_executor(mut self, executor: ConcurrentExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Dump and render run on the blocking pool; both are plain file IO.
    async fn prepare_mount_dir(&self, mount_dir: &Path) -> FlotillaResult<()> {
        let dumper = self.dumper.clone();
        let renderer = self.renderer.clone();
        let data = self.driver.cluster_env();
        let mount_dir = mount_dir.to_path_buf();

        tokio::task::spawn_blocking(move || {
            dumper.dump(&mount_dir)?;
            render_rootfs(renderer.as_ref(), &mount_dir, &data)
        })
        .await
        .map_err(|e| FlotillaError::Internal {
            message: format!("rootfs preparation task failed: {}", e),
        })?
    }

    async fn copy_to_hosts(
        &self,
        source: &Path,
        target: &Path,
        hosts: &[IpAddr],
    ) -> FlotillaResult<()> {
        let driver = self.driver.as_ref();
        self.executor
            .run(hosts, |host| async move {
                driver.copy(host, source, target).await.map_err(|e| match e {
                    FlotillaError::Transport { host, action, details } => FlotillaError::Transport {
                        host,
                        action: format!("copy rootfs files ({})", action),
                        details,
                    },
                    other => other,
                })
            })
            .await
    }
}

#[async_trait]
impl Distributor for ScpDistributor {
    #[instrument(skip(self, hosts), fields(hosts = hosts.len()))]
    async fn distribute_rootfs(&self, hosts: &[IpAddr], rootfs_path: &Path) -> FlotillaResult<()> {
        for (layer, mount_dir) in self.mounts.iter() {
            info!(layer, mount_dir = ?mount_dir, "distributing rootfs");
            self.prepare_mount_dir(mount_dir)
                .instrument(stage_span("prepare", layer))
                .await?;

            let targets = filter_rootfs(mount_dir)?;
            if targets.is_empty() {
                debug!(layer, "nothing to copy besides the registry");
            }
            for source in targets {
                let Some(name) = source.file_name() else {
                    continue;
                };
                let target = rootfs_path.join(name);
                self.copy_to_hosts(&source, &target, hosts)
                    .instrument(stage_span("copy", layer))
                    .await?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn distribute_registry(
        &self,
        deploy_host: IpAddr,
        data_dir: &Path,
    ) -> FlotillaResult<()> {
        for (layer, mount_dir) in self.mounts.iter() {
            let registry = mount_dir.join(REGISTRY_DIR_NAME);
            if !registry.is_dir() {
                debug!(layer, "layer has no registry data");
                continue;
            }
            info!(layer, host = %deploy_host, "distributing registry data");
            self.driver
                .copy(deploy_host, &registry, data_dir)
                .await
                .map_err(|e| match e {
                    FlotillaError::Transport { host, details, .. } => FlotillaError::Transport {
                        host,
                        action: format!("copy registry data {:?}", mount_dir),
                        details,
                    },
                    other => other,
                })?;
        }
        Ok(())
    }

    #[instrument(skip(self, hosts), fields(hosts = hosts.len()))]
    async fn restore(&self, target_dir: &Path, hosts: &[IpAddr]) -> FlotillaResult<()> {
        validate_removal_target(target_dir)?;
        let command = vec![format!("rm -rf {}", shell_quote(&target_dir.to_string_lossy()))];
        let driver = self.driver.as_ref();
        let command = &command;

        self.executor
            .run(hosts, |host| async move {
                driver.cmd_async(host, command).await.map_err(|e| FlotillaError::Transport {
                    host,
                    action: "delete rootfs".to_string(),
                    details: e.to_string(),
                })
            })
            .await
    }
}

/// Render the template directories that exist under `mount_dir`.
pub fn render_rootfs(
    renderer: &dyn TemplateRenderer,
    mount_dir: &Path,
    data: &crate::env::EnvMap,
) -> FlotillaResult<()> {
    for name in RENDER_DIRS {
        let dir = mount_dir.join(name);
        if dir.is_dir() {
            renderer.render_dir(&dir, data)?;
        } else {
            debug!(dir = ?dir, "render directory absent, skipping");
        }
    }
    Ok(())
}

/// Top-level entries of a mount directory, sorted, without the registry.
pub fn filter_rootfs(mount_dir: &Path) -> FlotillaResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(mount_dir).map_err(|e| FlotillaError::Io(std::io::Error::new(
        e.kind(),
        format!("failed to read dir {:?}: {}", mount_dir, e),
    )))?;

    let mut targets = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_name() == REGISTRY_DIR_NAME {
            continue;
        }
        targets.push(entry.path());
    }
    targets.sort();
    Ok(targets)
}

fn validate_removal_target(target: &Path) -> FlotillaResult<()> {
    let has_name = target
        .components()
        .any(|c| matches!(c, Component::Normal(_)));
    if !target.is_absolute() || !has_name {
        return Err(FlotillaError::InvalidInput {
            field: "target_dir".to_string(),
            message: format!("refusing to remove {:?}", target),
        });
    }
    Ok(())
}
