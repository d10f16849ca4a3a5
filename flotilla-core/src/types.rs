//! Cluster description types shared by every Flotilla component

use crate::error::{FlotillaError, FlotillaResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

pub const ROLE_MASTER: &str = "master";
pub const ROLE_NODE: &str = "node";

/// Operating system / architecture pair of a host or image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
}

impl Platform {
    pub fn new(os: &str, architecture: &str, variant: &str) -> Self {
        Self {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant: variant.to_string(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.variant.is_empty() {
            write!(f, "{}/{}", self.os, self.architecture)
        } else {
            write!(f, "{}/{}/{}", self.os, self.architecture, self.variant)
        }
    }
}

/// SSH connection settings; every field is optional so host groups can
/// override only what differs from the cluster default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SshSpec {
    pub user: Option<String>,
    pub pk: Option<PathBuf>,
    pub port: Option<u16>,
}

impl SshSpec {
    /// Fields set on `self` win over `base`.
    pub fn merged_over(&self, base: &SshSpec) -> SshSpec {
        SshSpec {
            user: self.user.clone().or_else(|| base.user.clone()),
            pk: self.pk.clone().or_else(|| base.pk.clone()),
            port: self.port.or(base.port),
        }
    }
}

/// A group of hosts sharing roles, env and SSH overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostGroup {
    pub ips: Vec<IpAddr>,
    pub roles: Vec<String>,
    pub env: Vec<String>,
    pub ssh: SshSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterMetadata {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSpecBody {
    pub image: String,
    pub cmds: Vec<String>,
    pub env: Vec<String>,
    pub ssh: SshSpec,
    pub hosts: Vec<HostGroup>,
}

/// Desired cluster as written by the operator in a cluster file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ClusterMetadata,
    pub spec: ClusterSpecBody,
}

impl ClusterSpec {
    pub fn from_yaml_str(contents: &str) -> FlotillaResult<Self> {
        let cluster: ClusterSpec = serde_yaml::from_str(contents)?;
        cluster.validate()?;
        Ok(cluster)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> FlotillaResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            FlotillaError::config(
                "cluster",
                format!("failed to read {:?}: {}", path.as_ref(), e),
            )
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn validate(&self) -> FlotillaResult<()> {
        if self.metadata.name.is_empty() {
            return Err(FlotillaError::InvalidInput {
                field: "metadata.name".to_string(),
                message: "cluster name cannot be empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for group in &self.spec.hosts {
            for ip in &group.ips {
                if !seen.insert(*ip) {
                    return Err(FlotillaError::InvalidInput {
                        field: "spec.hosts".to_string(),
                        message: format!("host {} listed more than once", ip),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Image layer id to local mount directory, in distribution order.
#[derive(Debug, Clone, Default)]
pub struct MountInfo {
    entries: Vec<(String, PathBuf)>,
}

impl MountInfo {
    /// Rejects duplicate layer ids and duplicate mount paths.
    pub fn new(entries: Vec<(String, PathBuf)>) -> FlotillaResult<Self> {
        let mut ids = HashSet::new();
        let mut paths = HashSet::new();
        for (id, path) in &entries {
            if !ids.insert(id.as_str()) {
                return Err(FlotillaError::InvalidInput {
                    field: "mount_info".to_string(),
                    message: format!("layer '{}' mounted twice", id),
                });
            }
            if !paths.insert(path.as_path()) {
                return Err(FlotillaError::InvalidInput {
                    field: "mount_info".to_string(),
                    message: format!("mount directory {:?} shared by two layers", path),
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn single(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            entries: vec![(id.into(), path.into())],
        }
    }

    pub fn mount_dirs(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|(_, p)| p.as_path())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.entries.iter().map(|(id, p)| (id.as_str(), p.as_path()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How a config entry combines with a file already present in the rootfs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigStrategy {
    #[default]
    Override,
    Merge,
}

/// A configuration file to be written into every mounted rootfs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigEntry {
    pub name: String,
    /// Path relative to the mount directory.
    pub path: PathBuf,
    pub data: String,
    pub strategy: ConfigStrategy,
    /// `|` separated value pipeline, e.g. `value|toJson|toBase64`.
    pub process: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CLUSTER: &str = r#"
apiVersion: flotilla.io/v1
kind: Cluster
metadata:
  name: demo
spec:
  image: docker.io/library/k0s:v1.26
  cmds: ["k0s install controller"]
  env: ["PodCIDR=100.64.0.0/10"]
  ssh:
    user: root
    port: 22
  hosts:
    - ips: [192.168.0.2]
      roles: [master]
    - ips: [192.168.0.3, 192.168.0.4]
      roles: [node]
      ssh:
        port: 2222
"#;

    #[test]
    fn test_cluster_from_yaml() {
        let cluster = ClusterSpec::from_yaml_str(CLUSTER).unwrap();
        assert_eq!(cluster.name(), "demo");
        assert_eq!(cluster.spec.hosts.len(), 2);
        assert_eq!(cluster.spec.hosts[1].ips.len(), 2);
        assert_eq!(cluster.spec.hosts[1].ssh.port, Some(2222));
        assert_eq!(cluster.spec.cmds, vec!["k0s install controller".to_string()]);
    }

    #[test]
    fn test_duplicate_host_rejected() {
        let yaml = r#"
metadata: { name: dup }
spec:
  hosts:
    - ips: [10.0.0.1]
    - ips: [10.0.0.1]
"#;
        let err = ClusterSpec::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("10.0.0.1"));
    }

    #[test]
    fn test_ssh_override_merge() {
        let base = SshSpec {
            user: Some("root".into()),
            pk: Some("/root/.ssh/id_rsa".into()),
            port: Some(22),
        };
        let host = SshSpec {
            port: Some(2222),
            ..Default::default()
        };
        let merged = host.merged_over(&base);
        assert_eq!(merged.user.as_deref(), Some("root"));
        assert_eq!(merged.port, Some(2222));
    }

    #[test]
    fn test_mount_info_keys_disjoint() {
        let err = MountInfo::new(vec![
            ("layer-a".into(), "/mnt/a".into()),
            ("layer-a".into(), "/mnt/b".into()),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("layer-a"));

        let err = MountInfo::new(vec![
            ("layer-a".into(), "/mnt/a".into()),
            ("layer-b".into(), "/mnt/a".into()),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("/mnt/a"));

        let ok = MountInfo::new(vec![
            ("layer-b".into(), "/mnt/b".into()),
            ("layer-a".into(), "/mnt/a".into()),
        ])
        .unwrap();
        let dirs: Vec<_> = ok.mount_dirs().collect();
        assert_eq!(dirs, vec![Path::new("/mnt/b"), Path::new("/mnt/a")]);
    }

    #[test]
    fn test_platform_display() {
        assert_eq!(Platform::new("linux", "amd64", "").to_string(), "linux/amd64");
        assert_eq!(Platform::new("linux", "arm", "v7").to_string(), "linux/arm/v7");
    }
}
