//! Configuration for the dispatch engine.
//!
//! Settings are grouped per concern:
//! - Email worker pools ([`EmailPoolConfig`])
//! - WhatsApp per-recipient behaviour ([`WhatsAppConfig`])
//! - Remote gateway connection ([`GatewayConfig`])
//! - SMTP connection timeouts ([`SmtpConnectionConfig`])
//! - Failure policies for the two open coupling points
//!
//! Build with [`DispatchConfig::builder`] or load with [`DispatchConfig::from_env`].

use std::env;
use std::fmt;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::errors::DispatchError;

/// Maximum number of send + retry workers per batch.
pub const MAX_TOTAL_WORKERS: usize = 20;

/// Default number of send workers.
pub const DEFAULT_SEND_WORKERS: usize = 4;

/// Default number of retry workers.
pub const DEFAULT_RETRY_WORKERS: usize = 4;

/// Default number of addresses per send unit.
pub const DEFAULT_GROUP_SIZE: usize = 10;

/// Default per-unit send timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of text attempts per recipient.
pub const DEFAULT_TEXT_ATTEMPTS: u32 = 3;

/// Default delay between text attempts.
pub const DEFAULT_TEXT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default country code used by phone normalization.
pub const DEFAULT_COUNTRY_CODE: &str = "55";

/// Default gateway request timeout.
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default SMTP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default SMTP command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Email worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailPoolConfig {
    /// Concurrent send workers.
    pub send_workers: usize,
    /// Concurrent retry workers.
    pub retry_workers: usize,
    /// Addresses per send unit.
    pub group_size: usize,
    /// Deadline for one send unit, including connection acquisition.
    pub send_timeout: Duration,
}

impl Default for EmailPoolConfig {
    fn default() -> Self {
        Self {
            send_workers: DEFAULT_SEND_WORKERS,
            retry_workers: DEFAULT_RETRY_WORKERS,
            group_size: DEFAULT_GROUP_SIZE,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// WhatsApp channel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    /// Text attempts per recipient.
    pub text_attempts: u32,
    /// Fixed delay between text attempts.
    pub text_retry_delay: Duration,
    /// Country code digits prepended by phone normalization.
    pub default_country_code: String,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            text_attempts: DEFAULT_TEXT_ATTEMPTS,
            text_retry_delay: DEFAULT_TEXT_RETRY_DELAY,
            default_country_code: DEFAULT_COUNTRY_CODE.to_string(),
        }
    }
}

/// Remote messaging gateway connection.
#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL, e.g. `http://evolution:8080`.
    pub base_url: String,
    /// Static API key sent with every request.
    #[serde(skip_serializing)]
    pub api_key: SecretString,
    /// Request timeout.
    pub timeout: Duration,
}

impl GatewayConfig {
    /// Creates a gateway config with the default timeout.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: SecretString::new(api_key.into()),
            timeout: DEFAULT_GATEWAY_TIMEOUT,
        }
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// SMTP connection timeouts and identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpConnectionConfig {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Per-command timeout.
    pub command_timeout: Duration,
    /// Name announced in EHLO/HELO.
    pub client_id: String,
}

impl Default for SmtpConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            client_id: "localhost".to_string(),
        }
    }
}

/// What to do when the SMTP password cannot be decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecryptionFailurePolicy {
    /// Fail the whole request before contacting anyone.
    #[default]
    AbortRequest,
    /// Mark every recipient as an email failure and continue with WhatsApp.
    SkipEmail,
}

/// How a recipient's attachment list is processed on WhatsApp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentFailurePolicy {
    /// Abandon remaining attachments after the first failure.
    #[default]
    StopAtFirst,
    /// Attempt every attachment; any failure still fails the recipient.
    AttemptAll,
}

/// Complete dispatch engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Email worker pools.
    pub email: EmailPoolConfig,
    /// WhatsApp channel.
    pub whatsapp: WhatsAppConfig,
    /// Remote gateway.
    pub gateway: GatewayConfig,
    /// SMTP connection.
    pub smtp: SmtpConnectionConfig,
    /// Password decryption failure policy.
    pub decryption_failure: DecryptionFailurePolicy,
    /// Attachment failure policy.
    pub attachment_failure: AttachmentFailurePolicy,
}

impl DispatchConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> DispatchConfigBuilder {
        DispatchConfigBuilder::default()
    }

    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, DispatchError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DispatchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host = get("EVOLUTION_HOST")
            .ok_or_else(|| DispatchError::Configuration("EVOLUTION_HOST is required".into()))?;
        let port = get("EVOLUTION_PORT")
            .ok_or_else(|| DispatchError::Configuration("EVOLUTION_PORT is required".into()))?;
        let api_key = get("AUTHENTICATION_API_KEY").ok_or_else(|| {
            DispatchError::Configuration("AUTHENTICATION_API_KEY is required".into())
        })?;

        let mut builder = Self::builder()
            .gateway_url(format!("http://{}:{}", host, port))
            .api_key(api_key);

        if let Some(code) = get("DEFAULT_COUNTRY_CODE") {
            builder = builder.default_country_code(code);
        }
        if let Some(v) = get("UNICAST_SEND_WORKERS") {
            builder = builder.send_workers(parse_number("UNICAST_SEND_WORKERS", &v)?);
        }
        if let Some(v) = get("UNICAST_RETRY_WORKERS") {
            builder = builder.retry_workers(parse_number("UNICAST_RETRY_WORKERS", &v)?);
        }
        if let Some(v) = get("UNICAST_GROUP_SIZE") {
            builder = builder.group_size(parse_number("UNICAST_GROUP_SIZE", &v)?);
        }
        if let Some(v) = get("UNICAST_SEND_TIMEOUT") {
            builder = builder.send_timeout(parse_duration("UNICAST_SEND_TIMEOUT", &v)?);
        }
        if let Some(v) = get("UNICAST_WHATSAPP_ATTEMPTS") {
            builder = builder.text_attempts(parse_number("UNICAST_WHATSAPP_ATTEMPTS", &v)?);
        }
        if let Some(v) = get("UNICAST_WHATSAPP_RETRY_DELAY") {
            builder = builder.text_retry_delay(parse_duration("UNICAST_WHATSAPP_RETRY_DELAY", &v)?);
        }

        builder.build()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), DispatchError> {
        let email = &self.email;
        if email.send_workers == 0 || email.retry_workers == 0 {
            return Err(DispatchError::Configuration(
                "send and retry workers must be greater than 0".into(),
            ));
        }
        if email.send_workers + email.retry_workers > MAX_TOTAL_WORKERS {
            return Err(DispatchError::Configuration(format!(
                "send + retry workers cannot exceed {}",
                MAX_TOTAL_WORKERS
            )));
        }
        if email.group_size == 0 {
            return Err(DispatchError::Configuration("group size must be greater than 0".into()));
        }
        if email.send_timeout.is_zero() {
            return Err(DispatchError::Configuration("send timeout must be greater than 0".into()));
        }
        if self.whatsapp.text_attempts == 0 {
            return Err(DispatchError::Configuration(
                "whatsapp attempts must be greater than 0".into(),
            ));
        }
        let code = &self.whatsapp.default_country_code;
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(DispatchError::Configuration(format!(
                "default country code must be digits only, got {:?}",
                code
            )));
        }
        url::Url::parse(&self.gateway.base_url).map_err(|e| {
            DispatchError::Configuration(format!("invalid gateway url {}: {}", self.gateway.base_url, e))
        })?;
        if self.gateway.api_key.expose_secret().is_empty() {
            return Err(DispatchError::Configuration("gateway api key is required".into()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, DispatchError> {
    value
        .parse()
        .map_err(|_| DispatchError::Configuration(format!("{} must be a number, got {:?}", key, value)))
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, DispatchError> {
    humantime::parse_duration(value)
        .map_err(|e| DispatchError::Configuration(format!("{} is not a valid duration: {}", key, e)))
}

/// Builder for [`DispatchConfig`].
#[derive(Debug, Default)]
pub struct DispatchConfigBuilder {
    email: EmailPoolConfig,
    whatsapp: WhatsAppConfig,
    smtp: SmtpConnectionConfig,
    gateway_url: Option<String>,
    api_key: Option<SecretString>,
    gateway_timeout: Option<Duration>,
    decryption_failure: DecryptionFailurePolicy,
    attachment_failure: AttachmentFailurePolicy,
}

impl DispatchConfigBuilder {
    /// Sets the number of send workers.
    pub fn send_workers(mut self, n: usize) -> Self {
        self.email.send_workers = n;
        self
    }

    /// Sets the number of retry workers.
    pub fn retry_workers(mut self, n: usize) -> Self {
        self.email.retry_workers = n;
        self
    }

    /// Sets the number of addresses per send unit.
    pub fn group_size(mut self, n: usize) -> Self {
        self.email.group_size = n;
        self
    }

    /// Sets the per-unit send timeout.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.email.send_timeout = timeout;
        self
    }

    /// Sets the number of WhatsApp text attempts.
    pub fn text_attempts(mut self, attempts: u32) -> Self {
        self.whatsapp.text_attempts = attempts;
        self
    }

    /// Sets the delay between WhatsApp text attempts.
    pub fn text_retry_delay(mut self, delay: Duration) -> Self {
        self.whatsapp.text_retry_delay = delay;
        self
    }

    /// Sets the default country code.
    pub fn default_country_code(mut self, code: impl Into<String>) -> Self {
        self.whatsapp.default_country_code = code.into();
        self
    }

    /// Sets the gateway base URL.
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = Some(url.into());
        self
    }

    /// Sets the gateway API key.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::new(key.into()));
        self
    }

    /// Sets the gateway request timeout.
    pub fn gateway_timeout(mut self, timeout: Duration) -> Self {
        self.gateway_timeout = Some(timeout);
        self
    }

    /// Sets the SMTP connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.smtp.connect_timeout = timeout;
        self
    }

    /// Sets the SMTP command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.smtp.command_timeout = timeout;
        self
    }

    /// Sets the EHLO client identity.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.smtp.client_id = id.into();
        self
    }

    /// Sets the decryption failure policy.
    pub fn decryption_failure(mut self, policy: DecryptionFailurePolicy) -> Self {
        self.decryption_failure = policy;
        self
    }

    /// Sets the attachment failure policy.
    pub fn attachment_failure(mut self, policy: AttachmentFailurePolicy) -> Self {
        self.attachment_failure = policy;
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<DispatchConfig, DispatchError> {
        let config = DispatchConfig {
            email: self.email,
            whatsapp: self.whatsapp,
            gateway: GatewayConfig {
                base_url: self
                    .gateway_url
                    .ok_or_else(|| DispatchError::Configuration("gateway url is required".into()))?,
                api_key: self
                    .api_key
                    .ok_or_else(|| DispatchError::Configuration("gateway api key is required".into()))?,
                timeout: self.gateway_timeout.unwrap_or(DEFAULT_GATEWAY_TIMEOUT),
            },
            smtp: self.smtp,
            decryption_failure: self.decryption_failure,
            attachment_failure: self.attachment_failure,
        };
        config.validate()?;
        Ok(config)
    }
}
