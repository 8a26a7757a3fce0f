//! SMTP wire layer.
//!
//! A small RFC 5321 client used by the pooled email sender:
//! - [`protocol`]: commands, replies, EHLO capabilities
//! - [`transport`]: TCP stream with optional TLS, session setup and transactions
//! - [`auth`]: SASL PLAIN and LOGIN
//! - [`mime`]: RFC 5322 message encoding
//! - [`pool`]: deadpool-managed connection pool

pub mod auth;
pub mod mime;
pub mod pool;
pub mod protocol;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::config::{SmtpConnectionConfig, DEFAULT_COMMAND_TIMEOUT, DEFAULT_CONNECT_TIMEOUT};
use crate::types::ContentType;

pub use pool::{SmtpConnectionManager, SmtpPool, SmtpPoolFactory};
pub use transport::TcpTransport;

/// Port conventionally used for implicit TLS.
pub const IMPLICIT_TLS_PORT: u16 = 465;

/// TLS mode for SMTP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Plain text only.
    None,
    /// Upgrade with STARTTLS when offered.
    #[default]
    StartTls,
    /// Fail unless STARTTLS succeeds.
    StartTlsRequired,
    /// TLS from the first byte.
    Implicit,
}

impl TlsMode {
    /// Default mode for a port: implicit TLS on 465, opportunistic STARTTLS otherwise.
    pub fn for_port(port: u16) -> Self {
        if port == IMPLICIT_TLS_PORT {
            TlsMode::Implicit
        } else {
            TlsMode::StartTls
        }
    }
}

/// Connection and credential settings for one SMTP account.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Login; authentication is skipped when empty.
    pub username: String,
    /// Plaintext password.
    pub password: SecretString,
    /// TLS mode.
    pub tls_mode: TlsMode,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Per-command timeout.
    pub command_timeout: Duration,
    /// Name announced in EHLO/HELO.
    pub client_id: String,
}

impl SmtpSettings {
    /// Creates settings with defaults derived from the port.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: SecretString,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password,
            tls_mode: TlsMode::for_port(port),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            client_id: "localhost".to_string(),
        }
    }

    /// Overrides the TLS mode.
    pub fn with_tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls_mode = mode;
        self
    }

    /// Applies connection timeouts and identity.
    pub fn with_connection(mut self, config: &SmtpConnectionConfig) -> Self {
        self.connect_timeout = config.connect_timeout;
        self.command_timeout = config.command_timeout;
        self.client_id = config.client_id.clone();
        self
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// True when credentials should be sent.
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

/// File attached to an outgoing email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAttachment {
    /// File name.
    pub file_name: String,
    /// Payload.
    pub data: Vec<u8>,
}

/// One send unit: a message addressed to a group of recipients.
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    /// Sender address.
    pub from: String,
    /// Recipient addresses.
    pub to: Vec<String>,
    /// Subject.
    pub subject: String,
    /// Body.
    pub body: String,
    /// Body content type.
    pub content_type: ContentType,
    /// Attachments, shared between send units.
    pub attachments: Arc<[MailAttachment]>,
}
