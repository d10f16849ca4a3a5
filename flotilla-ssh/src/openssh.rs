//! `RemoteShell` over the system OpenSSH client
//!
//! Every call spawns `ssh` or `scp` in batch mode; connection multiplexing
//! is left to the user's ssh config.

use crate::shell::RemoteShell;
use async_trait::async_trait;
use flotilla_core::config::SshConfig;
use flotilla_core::process::{CommandExecutor, CommandOutput, LineSink, TokioCommandExecutor};
use flotilla_core::types::SshSpec;
use flotilla_core::{FlotillaError, FlotillaResult, HostRegistry};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Exit status ssh reserves for its own failures
const SSH_ERROR_STATUS: i32 = 255;

/// Connection settings after per-host overrides are applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSsh {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
}

pub struct OpenSshShell<E: CommandExecutor = TokioCommandExecutor> {
    config: SshConfig,
    overrides: HashMap<IpAddr, SshSpec>,
    executor: E,
}

impl OpenSshShell<TokioCommandExecutor> {
    pub fn new(config: SshConfig) -> Self {
        Self::with_executor(config, TokioCommandExecutor)
    }
}

impl<E: CommandExecutor> OpenSshShell<E> {
    pub fn with_executor(config: SshConfig, executor: E) -> Self {
        Self {
            config,
            overrides: HashMap::new(),
            executor,
        }
    }

    /// Take user, key and port overrides from the cluster's host groups.
    pub fn with_registry(mut self, registry: &HostRegistry) -> Self {
        for host in registry.hosts() {
            self.overrides.insert(host.ip, host.ssh.clone());
        }
        self
    }

    pub fn with_host_override(mut self, host: IpAddr, spec: SshSpec) -> Self {
        self.overrides.insert(host, spec);
        self
    }

    pub fn resolve(&self, host: IpAddr) -> ResolvedSsh {
        let spec = self.overrides.get(&host).cloned().unwrap_or_default();
        ResolvedSsh {
            user: spec.user.unwrap_or_else(|| self.config.user.clone()),
            port: spec.port.unwrap_or(self.config.port),
            identity_file: spec.pk.or_else(|| self.config.identity_file.clone()),
        }
    }

    fn common_options(&self, settings: &ResolvedSsh) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)),
        ];
        if self.config.strict_host_key_checking {
            args.extend(["-o".to_string(), "StrictHostKeyChecking=yes".to_string()]);
        } else {
            args.extend([
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
                "-o".to_string(),
                "LogLevel=ERROR".to_string(),
            ]);
        }
        if let Some(identity) = &settings.identity_file {
            args.extend(["-i".to_string(), identity.to_string_lossy().into_owned()]);
        }
        args
    }

    pub fn ssh_args(&self, host: IpAddr, cmd: &str) -> Vec<String> {
        let settings = self.resolve(host);
        let mut args = self.common_options(&settings);
        args.extend([
            "-p".to_string(),
            settings.port.to_string(),
            format!("{}@{}", settings.user, host),
            "--".to_string(),
            cmd.to_string(),
        ]);
        args
    }

    pub fn scp_upload_args(&self, host: IpAddr, local: &Path, remote: &Path) -> Vec<String> {
        let settings = self.resolve(host);
        let mut args = self.scp_options(&settings);
        args.push(local.to_string_lossy().into_owned());
        args.push(scp_target(&settings, host, remote));
        args
    }

    pub fn scp_download_args(&self, host: IpAddr, remote: &Path, local: &Path) -> Vec<String> {
        let settings = self.resolve(host);
        let mut args = self.scp_options(&settings);
        args.push("-r".to_string());
        args.push(scp_target(&settings, host, remote));
        args.push(local.to_string_lossy().into_owned());
        args
    }

    fn scp_options(&self, settings: &ResolvedSsh) -> Vec<String> {
        let mut args = vec!["-q".to_string(), "-p".to_string()];
        args.extend(self.common_options(settings));
        args.extend(["-P".to_string(), settings.port.to_string()]);
        args
    }

    async fn transfer(&self, host: IpAddr, action: &str, args: Vec<String>) -> FlotillaResult<()> {
        let output = self
            .executor
            .execute(&self.config.scp_binary, &args, self.config.command_timeout)
            .await
            .map_err(|e| FlotillaError::transport(host, action, e))?;
        if !output.is_success() {
            return Err(FlotillaError::transport(
                host,
                action,
                format!("scp exited with {}: {}", output.status, output.stderr_lossy()),
            ));
        }
        Ok(())
    }
}

fn scp_target(settings: &ResolvedSsh, host: IpAddr, remote: &Path) -> String {
    let host = match host {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    };
    format!("{}@{}:{}", settings.user, host, remote.to_string_lossy())
}

fn check_channel(host: IpAddr, cmd: &str, output: CommandOutput) -> FlotillaResult<CommandOutput> {
    if output.status == SSH_ERROR_STATUS {
        return Err(FlotillaError::transport(
            host,
            cmd,
            format!("ssh connection failed: {}", output.stderr_lossy()),
        ));
    }
    Ok(output)
}

#[async_trait]
impl<E: CommandExecutor> RemoteShell for OpenSshShell<E> {
    #[instrument(skip(self), fields(host = %host))]
    async fn upload(&self, host: IpAddr, local: &Path, remote: &Path) -> FlotillaResult<()> {
        let args = self.scp_upload_args(host, local, remote);
        self.transfer(host, &format!("upload {:?}", local), args).await
    }

    #[instrument(skip(self), fields(host = %host))]
    async fn download(&self, host: IpAddr, remote: &Path, local: &Path) -> FlotillaResult<()> {
        let args = self.scp_download_args(host, remote, local);
        self.transfer(host, &format!("download {:?}", remote), args).await
    }

    async fn exec(&self, host: IpAddr, cmd: &str) -> FlotillaResult<CommandOutput> {
        debug!(host = %host, cmd, "exec");
        let output = self
            .executor
            .execute(
                &self.config.ssh_binary,
                &self.ssh_args(host, cmd),
                self.config.command_timeout,
            )
            .await
            .map_err(|e| FlotillaError::transport(host, cmd, e))?;
        check_channel(host, cmd, output)
    }

    async fn exec_streaming(
        &self,
        host: IpAddr,
        cmd: &str,
        sink: LineSink<'_>,
    ) -> FlotillaResult<CommandOutput> {
        debug!(host = %host, cmd, "exec streaming");
        let output = self
            .executor
            .execute_streaming(
                &self.config.ssh_binary,
                &self.ssh_args(host, cmd),
                self.config.command_timeout,
                sink,
            )
            .await
            .map_err(|e| FlotillaError::transport(host, cmd, e))?;
        check_channel(host, cmd, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::process::MockCommandExecutor;
    use flotilla_core::ClusterSpec;
    use pretty_assertions::assert_eq;

    fn host() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_ssh_args_defaults() {
        let shell = OpenSshShell::new(SshConfig::default());
        let args = shell.ssh_args(host(), "k0s status");

        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(!args.contains(&"-i".to_string()));
        assert_eq!(
            &args[args.len() - 5..],
            &["-p", "22", "root@10.0.0.1", "--", "k0s status"].map(String::from)
        );
    }

    #[test]
    fn test_registry_overrides() {
        let cluster = ClusterSpec::from_yaml_str(
            r#"
metadata: { name: demo }
spec:
  ssh: { user: ops, port: 2222 }
  hosts:
    - ips: [10.0.0.1]
      ssh: { user: admin, pk: /keys/admin }
    - ips: [10.0.0.2]
"#,
        )
        .unwrap();
        let shell = OpenSshShell::new(SshConfig::default())
            .with_registry(&HostRegistry::from_spec(&cluster));

        assert_eq!(
            shell.resolve(host()),
            ResolvedSsh {
                user: "admin".into(),
                port: 2222,
                identity_file: Some(PathBuf::from("/keys/admin")),
            }
        );
        assert_eq!(shell.resolve("10.0.0.2".parse().unwrap()).user, "ops");
        assert_eq!(shell.resolve("10.0.0.9".parse().unwrap()).user, "root");
    }

    #[test]
    fn test_scp_target_brackets_ipv6() {
        let shell = OpenSshShell::new(SshConfig::default());
        let host = "fd00::1".parse().unwrap();
        let args = shell.scp_upload_args(host, Path::new("/tmp/a"), Path::new("/srv/a"));
        assert_eq!(args.last().unwrap(), "root@[fd00::1]:/srv/a");
        assert!(args.windows(2).any(|w| w == ["-P", "22"]));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_a_channel_error() {
        let mock = MockCommandExecutor::new();
        mock.expect_containing("test -f", CommandOutput::failure(1, ""));
        let shell = OpenSshShell::with_executor(SshConfig::default(), mock.clone());

        let output = shell.exec(host(), "test -f /etc/hosts").await.unwrap();
        assert_eq!(output.status, 1);
        assert_eq!(mock.invocations()[0].program, "ssh");
    }

    #[tokio::test]
    async fn test_ssh_failure_is_transport_error() {
        let mock = MockCommandExecutor::new();
        mock.expect_containing("true", CommandOutput::failure(255, "Connection refused"));
        let shell = OpenSshShell::with_executor(SshConfig::default(), mock);

        let err = shell.exec(host(), "true").await.unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("Connection refused"));
    }

    #[tokio::test]
    async fn test_failed_upload() {
        let mock = MockCommandExecutor::new();
        mock.expect_containing("scp", CommandOutput::failure(1, "No such file or directory"));
        let shell = OpenSshShell::with_executor(SshConfig::default(), mock.clone());

        let err = shell
            .upload(host(), Path::new("/tmp/a"), Path::new("/missing/a"))
            .await
            .unwrap_err();
        assert_eq!(err.host(), Some(host()));
        assert_eq!(mock.invocations()[0].program, "scp");
    }
}
