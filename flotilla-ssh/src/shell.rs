use async_trait::async_trait;
use flotilla_core::process::{CommandOutput, LineSink};
use flotilla_core::FlotillaResult;
use std::net::IpAddr;
use std::path::Path;

/// Authenticated, encrypted channel to a single host
///
/// An `Err` means the channel itself failed (connection refused, timeout,
/// authentication). A remote command that ran and exited non-zero is an
/// `Ok` carrying its status; callers decide what that means.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Upload one local file to `remote`. The parent directory must exist.
    async fn upload(&self, host: IpAddr, local: &Path, remote: &Path) -> FlotillaResult<()>;

    /// Download `remote` (file or directory) to `local`.
    async fn download(&self, host: IpAddr, remote: &Path, local: &Path) -> FlotillaResult<()>;

    async fn exec(&self, host: IpAddr, cmd: &str) -> FlotillaResult<CommandOutput>;

    /// Like `exec`, handing output lines to `sink` as they arrive.
    async fn exec_streaming(
        &self,
        host: IpAddr,
        cmd: &str,
        sink: LineSink<'_>,
    ) -> FlotillaResult<CommandOutput>;
}
