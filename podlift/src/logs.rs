//! Logging setup
//!
//! `RUST_LOG` wins over the configured level. Remote command output is logged
//! under the `podlift` target, so a level set here never silences it in favour
//! of dependency crates.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::errors::PodliftError;

/// Verbosity of the `podlift` target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Filter directive: our crate at this level, everything else at warn
    fn directive(&self) -> String {
        format!("warn,podlift={}", self.as_str())
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        if lowered == "warning" {
            return Ok(LogLevel::Warn);
        }
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == lowered)
            .ok_or_else(|| format!("unknown log level '{}'", s))
    }
}

impl Serialize for LogLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

/// Where and how to log
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub log_level: LogLevel,

    /// Human-readable output on stdout
    pub stdout: bool,

    /// Directory for a daily-rolling `podlift.log`
    pub log_dir: Option<PathBuf>,

    /// JSON lines on stdout instead of plain text
    pub json_format: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            stdout: true,
            log_dir: None,
            json_format: false,
        }
    }
}

/// Install the global subscriber
///
/// Hold the returned guard until exit when `log_dir` is set, dropping it
/// flushes the file writer.
pub fn init_logging(options: LogOptions) -> Result<Option<WorkerGuard>, PodliftError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.log_level.directive()));

    let console = options.stdout.then(|| {
        let layer = tracing_subscriber::fmt::layer().with_target(false);
        if options.json_format {
            layer.json().boxed()
        } else {
            layer.compact().boxed()
        }
    });

    let mut guard = None;
    let file = options.log_dir.as_ref().map(|dir| {
        let (writer, file_guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "podlift.log"));
        guard = Some(file_guard);
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .boxed()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| PodliftError::Internal(format!("logging already initialised: {}", e)))?;

    Ok(guard)
}
