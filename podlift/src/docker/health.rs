//! HTTP health prober

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use crate::config::HealthCheck;
use crate::errors::PodliftError;

pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// One health probe: poll `url` until the status is accepted or attempts run out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub url: String,
    pub expected: Vec<u16>,
    /// Per-attempt timeout
    pub timeout: Option<Duration>,
    pub interval: Option<Duration>,
    pub attempts: Option<u32>,
}

impl ProbeRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expected: vec![200],
            timeout: None,
            interval: None,
            attempts: None,
        }
    }

    /// Probe of a health check against `host:port`
    pub fn for_check(host: &str, port: u16, check: &HealthCheck) -> Self {
        Self {
            url: format!("http://{}:{}{}", host, port, check.path),
            expected: check.expect.clone(),
            timeout: Some(check.timeout()),
            interval: Some(check.interval()),
            attempts: Some(check.retries),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.filter(|a| *a > 0).unwrap_or(DEFAULT_ATTEMPTS)
    }

    pub fn interval(&self) -> Duration {
        self.interval.unwrap_or(DEFAULT_INTERVAL)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn accepts(&self, status: u16) -> bool {
        if self.expected.is_empty() {
            status == 200
        } else {
            self.expected.contains(&status)
        }
    }
}

/// Something that can answer whether an endpoint is healthy
#[async_trait]
pub trait HealthProber: Send + Sync {
    /// Returns the attempt number that succeeded
    async fn probe(&self, request: &ProbeRequest) -> Result<u32, PodliftError>;
}

/// Prober issuing real HTTP GETs
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: Client,
}

impl HttpProber {
    pub fn new() -> Result<Self, PodliftError> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProber for HttpProber {
    async fn probe(&self, request: &ProbeRequest) -> Result<u32, PodliftError> {
        let attempts = request.attempts();
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=attempts {
            debug!(url = %request.url, attempt, "health probe");
            match self
                .client
                .get(&request.url)
                .timeout(request.timeout())
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if request.accepts(status) {
                        info!(url = %request.url, attempt, "health check passed");
                        return Ok(attempt);
                    }
                    last_error = format!("unexpected status {}", status);
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            if attempt < attempts {
                tokio::time::sleep(request.interval()).await;
            }
        }

        Err(PodliftError::HealthCheckFailed {
            attempts,
            reason: format!("{}: {}", request.url, last_error),
        })
    }
}
