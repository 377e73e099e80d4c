//! Let's Encrypt certificates through certbot

use tracing::info;

use crate::errors::PodliftError;
use crate::proxy::nginx::ACME_WEBROOT;
use crate::remote::HostSession;
use crate::utils::shell_quote;

pub const LIVE_DIR: &str = "/etc/letsencrypt/live";

/// Certificate and key locations for a domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub cert: String,
    pub key: String,
}

pub fn certificate_paths(domain: &str) -> CertificatePaths {
    CertificatePaths {
        cert: format!("{}/{}/fullchain.pem", LIVE_DIR, domain),
        key: format!("{}/{}/privkey.pem", LIVE_DIR, domain),
    }
}

pub struct Certbot<'a> {
    session: &'a HostSession,
}

impl<'a> Certbot<'a> {
    pub fn new(session: &'a HostSession) -> Self {
        Self { session }
    }

    pub async fn is_installed(&self) -> Result<bool, PodliftError> {
        self.session.check("which certbot").await
    }

    pub async fn install(&self) -> Result<(), PodliftError> {
        if self.is_installed().await? {
            return Ok(());
        }
        info!(host = %self.session.host(), "installing certbot");
        self.session
            .mutate_long("sudo apt-get update && sudo apt-get install -y certbot")
            .await
            .map_err(|e| PodliftError::CertificateError(format!("certbot installation failed: {}", e)))?;
        Ok(())
    }

    pub async fn certificate_exists(&self, domain: &str) -> Result<bool, PodliftError> {
        let paths = certificate_paths(domain);
        self.session
            .check(&format!("sudo test -f {}", shell_quote(&paths.cert)))
            .await
    }

    /// Request a certificate using the webroot served by nginx
    pub async fn obtain(&self, domain: &str, email: &str) -> Result<CertificatePaths, PodliftError> {
        if domain.is_empty() || email.is_empty() {
            return Err(PodliftError::CertificateError(
                "a domain and an email are required".to_string(),
            ));
        }
        self.install().await?;
        info!(host = %self.session.host(), domain, "obtaining certificate");
        self.session
            .mutate_long(&format!(
                "sudo certbot certonly --webroot -w {} -d {} --email {} --agree-tos --non-interactive",
                ACME_WEBROOT,
                shell_quote(domain),
                shell_quote(email)
            ))
            .await
            .map_err(|e| PodliftError::CertificateError(format!("certificate request failed: {}", e)))?;
        Ok(certificate_paths(domain))
    }

    pub async fn renew_all(&self) -> Result<(), PodliftError> {
        self.session
            .mutate_long("sudo certbot renew --quiet")
            .await
            .map_err(|e| PodliftError::CertificateError(format!("certificate renewal failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::remote::fake::FakeHost;

    #[test]
    fn test_paths() {
        let paths = certificate_paths("example.com");
        assert_eq!(paths.cert, "/etc/letsencrypt/live/example.com/fullchain.pem");
        assert_eq!(paths.key, "/etc/letsencrypt/live/example.com/privkey.pem");
    }

    #[tokio::test]
    async fn test_obtain_then_exists() {
        let host = FakeHost::new("h");
        let session = HostSession::new(Arc::new(host.clone()), false);
        let certbot = Certbot::new(&session);
        assert!(!certbot.certificate_exists("example.com").await.unwrap());
        certbot.obtain("example.com", "ops@example.com").await.unwrap();
        assert!(certbot.certificate_exists("example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_failures_are_reported() {
        let host = FakeHost::new("h");
        host.fail_on("certbot renew");
        let session = HostSession::new(Arc::new(host), false);
        let err = Certbot::new(&session).renew_all().await.unwrap_err();
        assert!(matches!(err, PodliftError::CertificateError(_)));
        assert!(Certbot::new(&session).obtain("", "x").await.is_err());
    }
}
