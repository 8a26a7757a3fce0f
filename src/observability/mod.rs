//! Logging setup and dispatch counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace.
    Trace,
    /// Debug.
    Debug,
    /// Info.
    #[default]
    Info,
    /// Warn.
    Warn,
    /// Error.
    Error,
}

impl From<LogLevel> for tracing::level_filters::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, for development.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
    /// Single-line text.
    Compact,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum level. `RUST_LOG` takes precedence.
    pub level: LogLevel,
    /// Output format.
    pub format: LogFormat,
}

impl LoggingConfig {
    /// Creates a config.
    pub fn new(level: LogLevel, format: LogFormat) -> Self {
        Self { level, format }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(tracing::level_filters::LevelFilter::from(self.level).into())
            .from_env_lossy()
    }
}

/// Installs the global `tracing` subscriber.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = tracing_subscriber::registry().with(config.filter());

    match config.format {
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init()?,
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init()?,
    }
    Ok(())
}

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    requests: AtomicU64,
    requests_rejected: AtomicU64,
    emails_delivered: AtomicU64,
    emails_failed: AtomicU64,
    whatsapp_delivered: AtomicU64,
    whatsapp_failed: AtomicU64,
    log_write_failures: AtomicU64,
}

impl DispatchMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an accepted request.
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a request that failed before any delivery.
    pub fn record_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the email outcome of one request.
    pub fn record_emails(&self, delivered: usize, failed: usize) {
        self.emails_delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        self.emails_failed.fetch_add(failed as u64, Ordering::Relaxed);
    }

    /// Records the WhatsApp outcome of one request.
    pub fn record_whatsapp(&self, delivered: usize, failed: usize) {
        self.whatsapp_delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        self.whatsapp_failed.fetch_add(failed as u64, Ordering::Relaxed);
    }

    /// Records a delivery log entry that could not be saved.
    pub fn record_log_write_failure(&self) {
        self.log_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            emails_delivered: self.emails_delivered.load(Ordering::Relaxed),
            emails_failed: self.emails_failed.load(Ordering::Relaxed),
            whatsapp_delivered: self.whatsapp_delivered.load(Ordering::Relaxed),
            whatsapp_failed: self.whatsapp_failed.load(Ordering::Relaxed),
            log_write_failures: self.log_write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DispatchMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Accepted requests.
    pub requests: u64,
    /// Requests failing before delivery.
    pub requests_rejected: u64,
    /// Recipients reached by email.
    pub emails_delivered: u64,
    /// Recipients not reached by email.
    pub emails_failed: u64,
    /// Recipients reached on WhatsApp.
    pub whatsapp_delivered: u64,
    /// Recipients not reached on WhatsApp.
    pub whatsapp_failed: u64,
    /// Log rows lost.
    pub log_write_failures: u64,
}

impl MetricsSnapshot {
    /// Fraction of email recipients reached, 1.0 when none were attempted.
    pub fn email_success_rate(&self) -> f64 {
        let total = self.emails_delivered + self.emails_failed;
        if total == 0 {
            1.0
        } else {
            self.emails_delivered as f64 / total as f64
        }
    }
}
