//! Reverse proxy and certificates

pub mod certbot;
pub mod nginx;

use tracing::info;

use crate::config::{AppConfig, Server};
use crate::errors::PodliftError;
use crate::remote::HostSession;

use self::certbot::Certbot;
use self::nginx::{Nginx, TlsConfig, Upstream};

/// Point the service's site on `server` at exactly `upstreams`
///
/// Installs nginx when missing and, with TLS enabled, makes sure a certificate
/// exists first. Getting a certificate never changes where traffic goes: the
/// final reload here is the only one that does. A certificate that cannot be
/// had fails the swap as `ProxyReloadFailed`.
pub async fn route_to(
    session: &HostSession,
    config: &AppConfig,
    server: &Server,
    upstreams: &[Upstream],
) -> Result<(), PodliftError> {
    let nginx = Nginx::new(session);
    nginx.install().await?;

    let domain = config.domain_for(server);
    let tls = if config.proxy.tls_enabled() {
        ensure_certificate(session, config, &nginx, &domain)
            .await
            .map_err(|e| match e {
                PodliftError::CertificateError(reason) => PodliftError::ProxyReloadFailed(format!(
                    "no certificate for {}, site left unchanged: {}",
                    domain, reason
                )),
                other => other,
            })?
    } else {
        TlsConfig::disabled()
    };

    nginx
        .update_upstream(&config.service, upstreams, &domain, &tls)
        .await
}

/// Make sure `domain` answers ACME challenges without moving traffic
///
/// An existing site of the service is left alone, every generated site serves
/// the challenge path. Otherwise a challenge-only site is published.
pub async fn prepare_challenge_site(
    nginx: &Nginx<'_>,
    service: &str,
    domain: &str,
) -> Result<(), PodliftError> {
    if nginx.site_exists(service).await? {
        return Ok(());
    }
    nginx.serve_acme_only(service, domain).await
}

async fn ensure_certificate(
    session: &HostSession,
    config: &AppConfig,
    nginx: &Nginx<'_>,
    domain: &str,
) -> Result<TlsConfig, PodliftError> {
    let certbot = Certbot::new(session);
    let paths = if certbot.certificate_exists(domain).await? {
        certbot::certificate_paths(domain)
    } else {
        let email = config
            .proxy
            .ssl_email
            .as_deref()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                PodliftError::CertificateError(format!(
                    "no certificate for {} and no ssl_email configured",
                    domain
                ))
            })?;
        info!(host = %session.host(), domain, "no certificate yet, requesting one");
        prepare_challenge_site(nginx, &config.service, domain).await?;
        certbot.obtain(domain, email).await?
    };

    Ok(TlsConfig {
        enabled: true,
        cert_path: paths.cert,
        key_path: paths.key,
    })
}
