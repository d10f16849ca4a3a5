//! OpenSSH transport for Flotilla
//!
//! [`ShellInfraDriver`] implements the core `InfraDriver` on top of any
//! [`RemoteShell`]; [`OpenSshShell`] is the production shell, driving the
//! system `ssh` and `scp` binaries.

pub mod checksum;
pub mod driver;
pub mod openssh;
pub mod platform;
pub mod shell;

pub use driver::ShellInfraDriver;
pub use openssh::OpenSshShell;
pub use shell::RemoteShell;
