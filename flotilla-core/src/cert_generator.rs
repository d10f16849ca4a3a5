//! Certificate issuance for inter-node trust
//!
//! Each service gets its own self-signed authority plus a leaf certificate
//! signed by it. Files are named after the service so the runtime can find
//! them by convention:
//!
//! - `<service>-ca.crt` / `<service>-ca.key`
//! - `<service>.crt` / `<service>.key`

use crate::config::CertConfig;
use crate::error::{FlotillaError, FlotillaResult};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose, SanType,
};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Shape of a certificate before it is generated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDescriptor {
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub organization: Vec<String>,
    pub validity_years: u32,
}

/// Where the material for one service lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl CertificatePaths {
    pub fn for_service(dir: &Path, service: &str) -> Self {
        Self {
            ca_cert: dir.join(format!("{}-ca.crt", service)),
            ca_key: dir.join(format!("{}-ca.key", service)),
            cert: dir.join(format!("{}.crt", service)),
            key: dir.join(format!("{}.key", service)),
        }
    }

    fn all(&self) -> [&PathBuf; 4] {
        [&self.ca_cert, &self.ca_key, &self.cert, &self.key]
    }

    fn is_key(&self, path: &Path) -> bool {
        path == self.ca_key || path == self.key
    }
}

/// Generated material in PEM form
#[derive(Debug, Clone)]
pub struct IssuedCertificates {
    pub descriptor: CertificateDescriptor,
    pub ca_cert_pem: String,
    pub ca_key_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub paths: CertificatePaths,
}

#[derive(Debug, Clone, Default)]
pub struct CertificateIssuer {
    config: CertConfig,
}

impl CertificateIssuer {
    pub fn new(config: CertConfig) -> Self {
        Self { config }
    }

    /// CN and first SAN are the service name; the registry alias is added
    /// unless the service is the alias itself.
    pub fn descriptor(&self, service: &str) -> CertificateDescriptor {
        let mut dns_names = vec![service.to_string()];
        if service != self.config.registry_alias {
            dns_names.push(self.config.registry_alias.clone());
        }
        CertificateDescriptor {
            common_name: service.to_string(),
            dns_names,
            organization: vec![self.config.organization.clone()],
            validity_years: self.config.validity_years,
        }
    }

    /// Generate CA and leaf for `service` and persist them under `dir`.
    /// Existing material for the same service is replaced as a whole.
    pub async fn issue(&self, service: &str, dir: &Path) -> FlotillaResult<IssuedCertificates> {
        validate_service_name(service)?;
        info!(service, dir = ?dir, "issuing certificates");

        let descriptor = self.descriptor(service);
        let ca = generate_authority(&descriptor)?;
        let ca_cert_pem = ca
            .serialize_pem()
            .map_err(|e| {
                FlotillaError::certificate(service, format!("failed to serialize CA: {}", e))
            })?;
        let ca_key_pem = ca.serialize_private_key_pem();

        let leaf = generate_leaf(&descriptor)?;
        let cert_pem = leaf.serialize_pem_with_signer(&ca).map_err(|e| {
            FlotillaError::certificate(service, format!("failed to sign leaf certificate: {}", e))
        })?;
        let key_pem = leaf.serialize_private_key_pem();

        let paths = CertificatePaths::for_service(dir, service);
        persist(
            service,
            dir,
            &paths,
            [&ca_cert_pem, &ca_key_pem, &cert_pem, &key_pem],
        )
        .await?;

        info!(service, cert = ?paths.cert, "certificates written");
        Ok(IssuedCertificates {
            descriptor,
            ca_cert_pem,
            ca_key_pem,
            cert_pem,
            key_pem,
            paths,
        })
    }
}

fn validate_service_name(service: &str) -> FlotillaResult<()> {
    if service.is_empty() || service.contains('/') || service.contains('\\') || service == ".." {
        return Err(FlotillaError::certificate(
            service,
            "service name must be a non-empty file name",
        ));
    }
    Ok(())
}

fn base_params(descriptor: &CertificateDescriptor) -> FlotillaResult<CertificateParams> {
    let mut params = CertificateParams::new(Vec::<String>::new());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, descriptor.common_name.as_str());
    for org in &descriptor.organization {
        dn.push(DnType::OrganizationName, org.as_str());
    }
    params.distinguished_name = dn;

    params.subject_alt_names = descriptor
        .dns_names
        .iter()
        .map(|name| match name.parse::<std::net::IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(name.clone()),
        })
        .collect();

    let days = i64::from(descriptor.validity_years) * 365;
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params
        .not_before
        .checked_add(time::Duration::days(days))
        .ok_or_else(|| {
            FlotillaError::certificate(&descriptor.common_name, "validity period overflows")
        })?;
    Ok(params)
}

fn generate_authority(descriptor: &CertificateDescriptor) -> FlotillaResult<Certificate> {
    let mut params = base_params(descriptor)?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    Certificate::from_params(params).map_err(|e| {
        FlotillaError::certificate(
            &descriptor.common_name,
            format!("failed to generate CA certificate: {}", e),
        )
    })
}

fn generate_leaf(descriptor: &CertificateDescriptor) -> FlotillaResult<Certificate> {
    let mut params = base_params(descriptor)?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    Certificate::from_params(params).map_err(|e| {
        FlotillaError::certificate(
            &descriptor.common_name,
            format!("failed to generate leaf certificate: {}", e),
        )
    })
}

/// Stage all four files, then rename them into place. A failure removes
/// the staged files so no partial pair appears under the final names.
async fn persist(
    service: &str,
    dir: &Path,
    paths: &CertificatePaths,
    contents: [&String; 4],
) -> FlotillaResult<()> {
    fs::create_dir_all(dir).await.map_err(|e| {
        FlotillaError::certificate(service, format!("failed to create {:?}: {}", dir, e))
    })?;

    let staged: Vec<PathBuf> = paths
        .all()
        .iter()
        .map(|p| p.with_extension(format!("{}.tmp", extension(p))))
        .collect();

    let result = async {
        for ((staging, target), pem) in staged.iter().zip(paths.all()).zip(contents) {
            write_file(staging, pem, paths.is_key(target)).await.map_err(|e| {
                FlotillaError::certificate(service, format!("failed to write {:?}: {}", staging, e))
            })?;
        }
        for (staging, target) in staged.iter().zip(paths.all()) {
            fs::rename(staging, target).await.map_err(|e| {
                FlotillaError::certificate(service, format!("failed to move {:?}: {}", target, e))
            })?;
            debug!(path = ?target, "saved certificate material");
        }
        Ok::<(), FlotillaError>(())
    }
    .await;

    if result.is_err() {
        for staging in &staged {
            if let Err(e) = fs::remove_file(staging).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = ?staging, error = %e, "failed to remove staged certificate file");
                }
            }
        }
    }
    result
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_string()
}

async fn write_file(path: &Path, contents: &str, private: bool) -> std::io::Result<()> {
    fs::write(path, contents).await?;

    // Private keys are readable by the owner only
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    #[cfg(not(unix))]
    let _ = private;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_descriptor_adds_alias() {
        let issuer = CertificateIssuer::default();
        let descriptor = issuer.descriptor("registry.local");
        assert_eq!(descriptor.common_name, "registry.local");
        assert_eq!(
            descriptor.dns_names,
            vec!["registry.local".to_string(), "sea.hub".to_string()]
        );
        assert_eq!(descriptor.organization, vec!["flotilla".to_string()]);
        assert_eq!(descriptor.validity_years, 100);
    }

    #[test]
    fn test_descriptor_for_alias_itself() {
        let issuer = CertificateIssuer::default();
        assert_eq!(issuer.descriptor("sea.hub").dns_names, vec!["sea.hub".to_string()]);
    }

    #[tokio::test]
    async fn test_issue_writes_four_files() {
        let dir = TempDir::new().unwrap();
        let issued = CertificateIssuer::default()
            .issue("registry.local", dir.path())
            .await
            .unwrap();

        assert!(issued.ca_cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.key_pem.contains("BEGIN PRIVATE KEY"));
        for path in issued.paths.all() {
            assert!(path.exists(), "{path:?} missing");
        }
        assert_eq!(
            std::fs::read_dir(dir.path()).unwrap().count(),
            4,
            "staging files left behind"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_keys_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let issued = CertificateIssuer::default()
            .issue("registry.local", dir.path())
            .await
            .unwrap();
        let mode = std::fs::metadata(&issued.paths.key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_invalid_service_name() {
        let dir = TempDir::new().unwrap();
        let err = CertificateIssuer::default()
            .issue("../escape", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, FlotillaError::Certificate { .. }));
    }

    #[tokio::test]
    async fn test_unwritable_dir_names_service() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let err = CertificateIssuer::default()
            .issue("registry.local", &blocker.join("certs"))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("registry.local"), "{msg}");
    }
}
