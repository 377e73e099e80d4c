//! nginx reverse proxy adapter

use std::fmt::Write as _;

use tracing::{info, warn};

use crate::errors::PodliftError;
use crate::remote::HostSession;
use crate::utils::shell_quote;

pub const SITES_AVAILABLE: &str = "/etc/nginx/sites-available";
pub const SITES_ENABLED: &str = "/etc/nginx/sites-enabled";
pub const ACME_WEBROOT: &str = "/var/www/html";

/// One backend in the upstream block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl Upstream {
    /// Backend published on the proxy's own host
    pub fn local(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: "127.0.0.1".to_string(),
            port,
        }
    }
}

/// TLS termination settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: String,
    pub key_path: String,
}

impl TlsConfig {
    pub fn disabled() -> Self {
        Self::default()
    }
}

/// Everything rendered into one site file
#[derive(Debug, Clone)]
pub struct SiteConfig<'a> {
    pub service: &'a str,
    pub domain: &'a str,
    pub upstreams: &'a [Upstream],
    pub tls: &'a TlsConfig,
    /// Extra directives placed in the main server block
    pub custom: Option<&'a str>,
}

pub fn site_path(service: &str) -> String {
    format!("{}/{}", SITES_AVAILABLE, service)
}

pub fn symlink_path(service: &str) -> String {
    format!("{}/{}", SITES_ENABLED, service)
}

pub fn enable_command(service: &str) -> String {
    format!(
        "sudo ln -sf {} {}",
        shell_quote(&site_path(service)),
        shell_quote(&symlink_path(service))
    )
}

pub fn test_command() -> &'static str {
    "sudo nginx -t"
}

pub fn reload_command() -> &'static str {
    "sudo systemctl reload nginx"
}

pub fn install_command() -> &'static str {
    "sudo apt-get update && sudo apt-get install -y nginx"
}

/// Render a site file; the upstream block always lists the full backend set
pub fn generate_config(site: &SiteConfig<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Managed by podlift for {}", site.service);
    let _ = writeln!(out, "upstream {} {{", site.service);
    for upstream in site.upstreams {
        let _ = writeln!(
            out,
            "    server {}:{};  # {}",
            upstream.host, upstream.port, upstream.name
        );
    }
    out.push_str("}\n\n");

    let locations = format!(
        "    location / {{\n\
         \x20       proxy_pass http://{};\n\
         \x20       proxy_http_version 1.1;\n\
         \x20       proxy_set_header Host $host;\n\
         \x20       proxy_set_header X-Real-IP $remote_addr;\n\
         \x20       proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n\
         \x20       proxy_set_header X-Forwarded-Proto $scheme;\n\
         \x20       proxy_set_header Upgrade $http_upgrade;\n\
         \x20       proxy_set_header Connection \"upgrade\";\n\
         \x20   }}\n",
        site.service
    );
    let acme = format!(
        "    location /.well-known/acme-challenge/ {{\n        root {};\n    }}\n",
        ACME_WEBROOT
    );
    let custom = site
        .custom
        .map(|c| {
            c.lines()
                .map(|l| format!("    {}\n", l))
                .collect::<String>()
        })
        .unwrap_or_default();

    if site.tls.enabled {
        let _ = write!(
            out,
            "server {{\n    listen 80;\n    listen [::]:80;\n    server_name {domain};\n\n{acme}\n    location / {{\n        return 301 https://$host$request_uri;\n    }}\n}}\n\n",
            domain = site.domain,
            acme = acme
        );
        let _ = write!(
            out,
            "server {{\n    listen 443 ssl http2;\n    listen [::]:443 ssl http2;\n    server_name {domain};\n\n    ssl_certificate {cert};\n    ssl_certificate_key {key};\n    ssl_protocols TLSv1.2 TLSv1.3;\n    ssl_prefer_server_ciphers on;\n\n{custom}{locations}}}\n",
            domain = site.domain,
            cert = site.tls.cert_path,
            key = site.tls.key_path,
            custom = custom,
            locations = locations
        );
    } else {
        let _ = write!(
            out,
            "server {{\n    listen 80;\n    listen [::]:80;\n    server_name {domain};\n\n{acme}\n{custom}{locations}}}\n",
            domain = site.domain,
            acme = acme,
            custom = custom,
            locations = locations
        );
    }
    out
}

/// Site that only answers ACME challenges, every other request gets 503
pub fn generate_acme_config(service: &str, domain: &str) -> String {
    format!(
        "# Managed by podlift for {service}\n\
         server {{\n    listen 80;\n    listen [::]:80;\n    server_name {domain};\n\n\
         \x20   location /.well-known/acme-challenge/ {{\n        root {webroot};\n    }}\n\n\
         \x20   location / {{\n        return 503;\n    }}\n}}\n",
        service = service,
        domain = domain,
        webroot = ACME_WEBROOT
    )
}

/// nginx on one host
pub struct Nginx<'a> {
    session: &'a HostSession,
}

impl<'a> Nginx<'a> {
    pub fn new(session: &'a HostSession) -> Self {
        Self { session }
    }

    pub async fn is_installed(&self) -> Result<bool, PodliftError> {
        self.session.check("which nginx").await
    }

    /// Install nginx unless present and drop the distribution default site
    pub async fn install(&self) -> Result<(), PodliftError> {
        if self.is_installed().await? {
            return Ok(());
        }
        info!(host = %self.session.host(), "installing nginx");
        self.session.mutate_long(install_command()).await.map_err(|e| {
            PodliftError::ProxyReloadFailed(format!("nginx installation failed: {}", e))
        })?;
        self.session
            .mutate(&format!("sudo rm -f {}/default", SITES_ENABLED))
            .await?;
        Ok(())
    }

    pub async fn site_exists(&self, service: &str) -> Result<bool, PodliftError> {
        self.session
            .check(&format!("sudo test -f {}", shell_quote(&site_path(service))))
            .await
    }

    /// Swap the upstream set of a service in one test-then-reload step
    ///
    /// When the new configuration fails `nginx -t` the previous file is put back
    /// and nothing is reloaded, so the live configuration never changes.
    pub async fn update_upstream(
        &self,
        service: &str,
        upstreams: &[Upstream],
        domain: &str,
        tls: &TlsConfig,
    ) -> Result<(), PodliftError> {
        let config = generate_config(&SiteConfig {
            service,
            domain,
            upstreams,
            tls,
            custom: None,
        });
        self.apply(service, &config).await?;
        info!(host = %self.session.host(), service, backends = upstreams.len(), "nginx reloaded");
        Ok(())
    }

    /// Publish a challenge-only site for a service that has none yet
    pub async fn serve_acme_only(&self, service: &str, domain: &str) -> Result<(), PodliftError> {
        self.apply(service, &generate_acme_config(service, domain)).await?;
        info!(host = %self.session.host(), service, domain, "serving ACME challenges");
        Ok(())
    }

    async fn apply(&self, service: &str, config: &str) -> Result<(), PodliftError> {
        let path = site_path(service);
        let previous = self.session.read_file(&path).await?;

        self.session
            .write_file(config, &path)
            .await
            .map_err(|e| PodliftError::ProxyReloadFailed(format!("failed to write config: {}", e)))?;
        self.session
            .mutate(&enable_command(service))
            .await
            .map_err(|e| PodliftError::ProxyReloadFailed(format!("failed to enable site: {}", e)))?;

        if let Err(e) = self.session.mutate(test_command()).await {
            warn!(host = %self.session.host(), "nginx config test failed, restoring previous site");
            self.restore(service, previous.as_deref()).await;
            return Err(PodliftError::ProxyReloadFailed(format!(
                "nginx config test failed: {}",
                e
            )));
        }

        self.session
            .mutate(reload_command())
            .await
            .map_err(|e| PodliftError::ProxyReloadFailed(format!("nginx reload failed: {}", e)))?;
        Ok(())
    }

    async fn restore(&self, service: &str, previous: Option<&str>) {
        let result = match previous {
            Some(contents) => self.session.write_file(contents, &site_path(service)).await,
            None => self
                .session
                .mutate(&format!(
                    "sudo rm -f {} {}",
                    shell_quote(&symlink_path(service)),
                    shell_quote(&site_path(service))
                ))
                .await
                .map(|_| ()),
        };
        if let Err(e) = result {
            warn!(host = %self.session.host(), "failed to restore nginx site: {}", e);
        }
    }

    /// Remove a service's site and reload
    pub async fn remove_site(&self, service: &str) -> Result<(), PodliftError> {
        self.session
            .mutate(&format!(
                "sudo rm -f {} {}",
                shell_quote(&symlink_path(service)),
                shell_quote(&site_path(service))
            ))
            .await?;
        self.session
            .mutate(test_command())
            .await
            .map_err(|e| PodliftError::ProxyReloadFailed(e.to_string()))?;
        self.session
            .mutate(reload_command())
            .await
            .map_err(|e| PodliftError::ProxyReloadFailed(e.to_string()))?;
        Ok(())
    }
}
