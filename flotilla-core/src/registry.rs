//! Immutable view of the cluster's hosts

use crate::env::{merge_env, parse_env, EnvMap};
use crate::error::{FlotillaError, FlotillaResult};
use crate::types::{ClusterSpec, Platform, SshSpec};
use std::collections::HashMap;
use std::net::IpAddr;

#[derive(Debug, Clone)]
pub struct Host {
    pub ip: IpAddr,
    pub roles: Vec<String>,
    /// Host-level env only; see `HostRegistry::host_env` for the merged map
    pub env: EnvMap,
    /// Cluster SSH defaults with the host group's overrides applied
    pub ssh: SshSpec,
    pub platform: Option<Platform>,
}

impl Host {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    hosts: Vec<Host>,
    cluster_env: EnvMap,
}

impl HostRegistry {
    pub fn from_spec(spec: &ClusterSpec) -> Self {
        let hosts = spec
            .spec
            .hosts
            .iter()
            .flat_map(|group| {
                let env = parse_env(&group.env);
                let ssh = group.ssh.merged_over(&spec.spec.ssh);
                group.ips.iter().map(move |ip| Host {
                    ip: *ip,
                    roles: group.roles.clone(),
                    env: env.clone(),
                    ssh: ssh.clone(),
                    platform: None,
                })
            })
            .collect();

        Self {
            hosts,
            cluster_env: parse_env(&spec.spec.env),
        }
    }

    /// Attach resolved platforms. Hosts missing from `platforms` keep theirs.
    pub fn with_platforms(mut self, platforms: &HashMap<IpAddr, Platform>) -> Self {
        for host in &mut self.hosts {
            if let Some(platform) = platforms.get(&host.ip) {
                host.platform = Some(platform.clone());
            }
        }
        self
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn ips(&self) -> Vec<IpAddr> {
        self.hosts.iter().map(|h| h.ip).collect()
    }

    pub fn ips_by_role(&self, role: &str) -> Vec<IpAddr> {
        self.hosts
            .iter()
            .filter(|h| h.has_role(role))
            .map(|h| h.ip)
            .collect()
    }

    pub fn get(&self, ip: IpAddr) -> Option<&Host> {
        self.hosts.iter().find(|h| h.ip == ip)
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.get(ip).is_some()
    }

    pub fn require(&self, ip: IpAddr) -> FlotillaResult<&Host> {
        self.get(ip).ok_or(FlotillaError::UnknownHost { host: ip })
    }

    pub fn cluster_env(&self) -> &EnvMap {
        &self.cluster_env
    }

    /// Unknown hosts get the plain cluster env.
    pub fn host_env(&self, ip: IpAddr) -> EnvMap {
        match self.get(ip) {
            Some(host) => merge_env(&self.cluster_env, &host.env),
            None => self.cluster_env.clone(),
        }
    }
}
