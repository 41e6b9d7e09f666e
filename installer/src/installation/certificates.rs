// TLS certificate provider
//
// Makes sure the edge proxy has a certificate + key for the configured domain:
// - self-signed: generated once with the `openssl` binary and reused while valid
// - provided: caller-supplied paths, checked for existence and expiry
// - disabled: plain HTTP, no material

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::run_cmd_with_timeout;
use crate::config::TlsRequest;
use crate::error::{InstallError, InstallResult};

const SELF_SIGNED_VALIDITY_DAYS: u32 = 825;
/// Reuse an existing self-signed certificate only if it is valid for at least this long.
const RENEW_BEFORE_SECS: u64 = 30 * 24 * 3600;
const OPENSSL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    #[default]
    SelfSigned,
    Provided,
    Disabled,
}

impl SslMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SslMode::SelfSigned => "self-signed",
            SslMode::Provided => "provided",
            SslMode::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificatePaths {
    pub mode: SslMode,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl CertificatePaths {
    pub fn disabled() -> Self {
        Self {
            mode: SslMode::Disabled,
            cert: None,
            key: None,
        }
    }
}

#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Paths that `ensure` would produce, without touching the filesystem.
    fn planned(&self, domain: &str, request: &TlsRequest) -> CertificatePaths;

    /// Ensure a usable certificate + key for `domain` exists.
    async fn ensure(&self, domain: &str, request: &TlsRequest) -> InstallResult<CertificatePaths>;
}

pub struct OpensslCertificateProvider {
    certs_dir: PathBuf,
}

impl OpensslCertificateProvider {
    pub fn new(certs_dir: impl Into<PathBuf>) -> Self {
        Self {
            certs_dir: certs_dir.into(),
        }
    }

    fn self_signed_paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        (
            self.certs_dir.join(format!("{}.crt", domain)),
            self.certs_dir.join(format!("{}.key", domain)),
        )
    }

    fn openssl() -> InstallResult<String> {
        which::which("openssl")
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(|_| {
                InstallError::external(
                    "openssl binary not found in PATH",
                    "Install openssl (e.g. `apt-get install openssl`) or pass --ssl-mode provided/disabled.",
                )
            })
    }

    /// `openssl x509 -checkend`: true when the certificate is still valid `secs` from now.
    async fn valid_for(openssl: &str, cert: &Path, secs: u64) -> bool {
        let args = vec![
            "x509".to_string(),
            "-in".to_string(),
            cert.to_string_lossy().into_owned(),
            "-noout".to_string(),
            "-checkend".to_string(),
            secs.to_string(),
        ];
        matches!(
            run_cmd_with_timeout(openssl, &args, OPENSSL_TIMEOUT, "openssl_checkend").await,
            Ok(out) if out.success()
        )
    }

    async fn generate_self_signed(&self, openssl: &str, domain: &str, cert: &Path, key: &Path) -> InstallResult<()> {
        tokio::fs::create_dir_all(&self.certs_dir).await.map_err(|e| {
            InstallError::permission(
                format!("cannot create {}: {}", self.certs_dir.display(), e),
                "Run the installer with write access to the install directory.",
            )
        })?;

        let args = vec![
            "req".to_string(),
            "-x509".to_string(),
            "-newkey".to_string(),
            "rsa:2048".to_string(),
            "-nodes".to_string(),
            "-sha256".to_string(),
            "-days".to_string(),
            SELF_SIGNED_VALIDITY_DAYS.to_string(),
            "-keyout".to_string(),
            key.to_string_lossy().into_owned(),
            "-out".to_string(),
            cert.to_string_lossy().into_owned(),
            "-subj".to_string(),
            format!("/CN={}", domain),
            "-addext".to_string(),
            format!("subjectAltName=DNS:{}", domain),
        ];
        let out = run_cmd_with_timeout(openssl, &args, OPENSSL_TIMEOUT, "openssl_req")
            .await
            .map_err(|e| {
                InstallError::external(
                    format!("openssl req: {:#}", e),
                    "Check the openssl installation, or pass --ssl-mode provided with --cert/--key.",
                )
            })?;
        if !out.success() {
            return Err(InstallError::external(
                format!("openssl req failed: {}", out.stderr.trim()),
                "Check the openssl installation, or pass --ssl-mode provided with --cert/--key.",
            ));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                tokio::fs::set_permissions(key, std::fs::Permissions::from_mode(0o600)).await
            {
                warn!(
                    "[PHASE: certificates] [STEP: self_signed] Failed to restrict key permissions on {}: {}",
                    key.display(),
                    e
                );
            }
        }

        info!(
            "[PHASE: certificates] [STEP: self_signed] Generated self-signed certificate for {} (days={})",
            domain, SELF_SIGNED_VALIDITY_DAYS
        );
        Ok(())
    }
}

#[async_trait]
impl CertificateProvider for OpensslCertificateProvider {
    fn planned(&self, domain: &str, request: &TlsRequest) -> CertificatePaths {
        match request.mode {
            SslMode::Disabled => CertificatePaths::disabled(),
            SslMode::Provided => CertificatePaths {
                mode: SslMode::Provided,
                cert: request.cert.clone(),
                key: request.key.clone(),
            },
            SslMode::SelfSigned => {
                let (cert, key) = self.self_signed_paths(domain);
                CertificatePaths {
                    mode: SslMode::SelfSigned,
                    cert: Some(cert),
                    key: Some(key),
                }
            }
        }
    }

    async fn ensure(&self, domain: &str, request: &TlsRequest) -> InstallResult<CertificatePaths> {
        let planned = self.planned(domain, request);
        match request.mode {
            SslMode::Disabled => {
                warn!("[PHASE: certificates] [STEP: ensure] TLS disabled; the stack will serve plain HTTP");
                Ok(planned)
            }
            SslMode::Provided => {
                let (Some(cert), Some(key)) = (&planned.cert, &planned.key) else {
                    return Err(InstallError::validation(
                        "--ssl-mode provided requires both --cert and --key",
                        "Pass --cert <path> and --key <path>, or use --ssl-mode self-signed.",
                    ));
                };
                for p in [cert, key] {
                    if !tokio::fs::try_exists(p).await.unwrap_or(false) {
                        return Err(InstallError::validation(
                            format!("TLS file not found: {}", p.display()),
                            "Check the --cert/--key paths.",
                        ));
                    }
                }
                let openssl = Self::openssl()?;
                if !Self::valid_for(&openssl, cert, 0).await {
                    return Err(InstallError::validation(
                        format!("certificate {} is expired or unreadable", cert.display()),
                        "Provide a valid PEM certificate, or use --ssl-mode self-signed.",
                    ));
                }
                info!(
                    "[PHASE: certificates] [STEP: ensure] Using provided certificate {}",
                    cert.display()
                );
                Ok(planned)
            }
            SslMode::SelfSigned => {
                let (cert, key) = self.self_signed_paths(domain);
                let openssl = Self::openssl()?;
                let both_exist = tokio::fs::try_exists(&cert).await.unwrap_or(false)
                    && tokio::fs::try_exists(&key).await.unwrap_or(false);
                if both_exist && Self::valid_for(&openssl, &cert, RENEW_BEFORE_SECS).await {
                    info!(
                        "[PHASE: certificates] [STEP: ensure] Reusing self-signed certificate {}",
                        cert.display()
                    );
                } else {
                    self.generate_self_signed(&openssl, domain, &cert, &key).await?;
                }
                Ok(planned)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn planned_paths_follow_mode() {
        let provider = OpensslCertificateProvider::new("/opt/stack/certs");
        let mut req = TlsRequest::default();
        let planned = provider.planned("app.example.com", &req);
        assert_eq!(planned.mode, SslMode::SelfSigned);
        assert_eq!(
            planned.cert.as_deref(),
            Some(Path::new("/opt/stack/certs/app.example.com.crt"))
        );

        req.mode = SslMode::Disabled;
        assert_eq!(provider.planned("app.example.com", &req), CertificatePaths::disabled());
    }

    #[tokio::test]
    async fn provided_mode_requires_both_paths() {
        let provider = OpensslCertificateProvider::new("/nonexistent");
        let req = TlsRequest {
            mode: SslMode::Provided,
            cert: Some(PathBuf::from("/tmp/x.crt")),
            key: None,
        };
        let err = provider.ensure("app.example.com", &req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn provided_mode_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let provider = OpensslCertificateProvider::new(dir.path());
        let req = TlsRequest {
            mode: SslMode::Provided,
            cert: Some(dir.path().join("missing.crt")),
            key: Some(dir.path().join("missing.key")),
        };
        let err = provider.ensure("app.example.com", &req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("missing.crt"));
    }

    #[tokio::test]
    async fn disabled_mode_needs_no_tooling() {
        let provider = OpensslCertificateProvider::new("/nonexistent");
        let req = TlsRequest {
            mode: SslMode::Disabled,
            ..Default::default()
        };
        let paths = provider.ensure("app.example.com", &req).await.unwrap();
        assert!(paths.cert.is_none());
    }
}
