//! Flotilla core: cluster-wide remote execution and rootfs distribution
//!
//! The engine treats a set of hosts as one machine. Everything that talks
//! to a host goes through [`InfraDriver`]; the distributor, readiness
//! checker and bootstrapper build on it, and [`ConcurrentExecutor`] fans
//! per-host work out concurrently.

pub mod bootstrap;
pub mod cert_generator;
pub mod config;
pub mod config_dump;
pub mod distributor;
pub mod env;
pub mod error;
pub mod executor;
pub mod infra_driver;
pub mod observability;
pub mod process;
pub mod readiness;
pub mod registry;
pub mod render;
pub mod types;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use bootstrap::{generate_registry_cert, KubeconfigPaths, RuntimeBootstrapper};
pub use cert_generator::{CertificateIssuer, CertificatePaths, IssuedCertificates};
pub use config::EngineConfig;
pub use distributor::{Distributor, ScpDistributor};
pub use error::{FlotillaError, FlotillaResult, HostFailure};
pub use executor::{ConcurrentExecutor, FanoutMode, FanoutReport};
pub use infra_driver::InfraDriver;
pub use readiness::{BackoffStrategy, ReadinessChecker, ReadinessOutcome, ReadinessPolicy};
pub use registry::{Host, HostRegistry};
pub use types::{ClusterSpec, ConfigEntry, ConfigStrategy, MountInfo, Platform};
