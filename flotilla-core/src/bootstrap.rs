//! Runtime bootstrap on freshly distributed hosts

use crate::cert_generator::{CertificateIssuer, IssuedCertificates};
use crate::error::{FlotillaError, FlotillaResult};
use crate::executor::{ConcurrentExecutor, FanoutReport};
use crate::infra_driver::InfraDriver;
use crate::readiness::ReadinessChecker;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument};

/// Local and remote locations used when taking over cluster admin access
#[derive(Debug, Clone)]
pub struct KubeconfigPaths {
    pub remote_kubeconfig: PathBuf,
    pub local_admin_conf: PathBuf,
    pub local_kubectl: PathBuf,
}

impl Default for KubeconfigPaths {
    fn default() -> Self {
        Self {
            remote_kubeconfig: PathBuf::from("/root/.kube/config"),
            local_admin_conf: PathBuf::from("/etc/kubernetes/admin.conf"),
            local_kubectl: PathBuf::from("/usr/bin/kubectl"),
        }
    }
}

pub struct RuntimeBootstrapper {
    driver: Arc<dyn InfraDriver>,
    checker: ReadinessChecker,
    executor: ConcurrentExecutor,
}

impl RuntimeBootstrapper {
    pub fn new(driver: Arc<dyn InfraDriver>, checker: ReadinessChecker) -> Self {
        Self {
            driver,
            checker,
            executor: ConcurrentExecutor::default(),
        }
    }

    pub fn with_executor(mut self, executor: ConcurrentExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Run the bootstrap commands on every host, then wait for each host
    /// to report ready. `cmds` defaults to the cluster launch commands.
    #[instrument(skip(self, hosts, cmds), fields(hosts = hosts.len()))]
    pub async fn bootstrap(&self, hosts: &[IpAddr], cmds: Option<&[String]>) -> FlotillaResult<()> {
        let cmds = self.commands(cmds);
        let cmds = &cmds;
        self.executor
            .run(hosts, |host| async move { self.bootstrap_host(host, cmds).await })
            .await
    }

    /// Same as `bootstrap` but keeps the outcome of every host.
    pub async fn bootstrap_report(
        &self,
        hosts: &[IpAddr],
        cmds: Option<&[String]>,
    ) -> FanoutReport {
        let cmds = self.commands(cmds);
        let cmds = &cmds;
        ConcurrentExecutor::run_all_collect(hosts, |host| async move {
            self.bootstrap_host(host, cmds).await
        })
        .await
    }

    fn commands(&self, cmds: Option<&[String]>) -> Vec<String> {
        match cmds {
            Some(cmds) => cmds.to_vec(),
            None => self.driver.cluster_launch_cmds(),
        }
    }

    async fn bootstrap_host(&self, host: IpAddr, cmds: &[String]) -> FlotillaResult<()> {
        if !cmds.is_empty() {
            self.driver.cmd_async(host, cmds).await?;
        }
        let outcome = self.checker.wait(self.driver.as_ref(), host).await?;
        info!(host = %host, attempts = outcome.attempts, "bootstrap complete");
        Ok(())
    }

    /// Copy the admin kubeconfig back from `host` and install kubectl from
    /// the local rootfs when it is not installed yet.
    pub async fn fetch_kubeconfig(
        &self,
        host: IpAddr,
        rootfs: &Path,
        paths: &KubeconfigPaths,
    ) -> FlotillaResult<()> {
        if let Some(parent) = paths.local_admin_conf.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.driver
            .copy_r(host, &paths.remote_kubeconfig, &paths.local_admin_conf)
            .await?;

        if tokio::fs::try_exists(&paths.local_kubectl).await? {
            return Ok(());
        }

        let source = rootfs.join("bin/kubectl");
        tokio::fs::copy(&source, &paths.local_kubectl)
            .await
            .map_err(|e| FlotillaError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to install kubectl from {:?}: {}", source, e),
            )))?;
        make_executable(&paths.local_kubectl).await?;
        info!(path = ?paths.local_kubectl, "installed kubectl");
        Ok(())
    }
}

/// Issue the registry's trust material under `cert_dir`.
pub async fn generate_registry_cert(
    issuer: &CertificateIssuer,
    cert_dir: &Path,
    registry_domain: &str,
) -> FlotillaResult<IssuedCertificates> {
    issuer.issue(registry_domain, cert_dir).await
}

async fn make_executable(path: &Path) -> FlotillaResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
