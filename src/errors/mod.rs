//! Error types for the dispatch engine.
//!
//! Errors are layered the same way the dispatch pipeline is:
//! - [`SmtpError`]: wire-level SMTP failures (connection, TLS, protocol, pool)
//! - [`MailerError`] / [`EmailSentError`]: the pooled email sender
//! - [`MessagingError`]: the remote messaging gateway client
//! - [`PhoneError`], [`CryptoError`], [`RepositoryError`]: collaborators
//! - [`DispatchError`]: request-level failures surfaced to callers, with an
//!   HTTP status hint

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Result type for SMTP operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// SMTP error kinds categorizing different failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpErrorKind {
    // Connection errors
    /// Connection was refused.
    ConnectionRefused,
    /// Connection timed out.
    ConnectTimeout,
    /// Connection was reset or closed by the server.
    ConnectionReset,

    // TLS errors
    /// TLS handshake failed.
    TlsHandshakeFailed,
    /// STARTTLS required but not supported by server.
    StarttlsNotSupported,

    // Authentication errors
    /// Credentials are invalid.
    CredentialsInvalid,
    /// No mutually supported authentication method.
    AuthMethodNotSupported,
    /// Authentication is required.
    AuthenticationRequired,

    // Protocol errors
    /// Invalid response from server.
    InvalidResponse,
    /// Unexpected response code.
    UnexpectedResponse,
    /// Server is shutting down (421).
    ServerShutdown,

    // Message errors
    /// Invalid sender address.
    InvalidFromAddress,
    /// One or more recipients were rejected.
    InvalidRecipientAddress,
    /// Message exceeds size limit.
    MessageTooLarge,
    /// Invalid header format.
    InvalidHeader,

    // Timeout errors
    /// Read timeout.
    ReadTimeout,
    /// Write timeout.
    WriteTimeout,
    /// The whole send unit exceeded its deadline.
    SendTimeout,

    // Pool errors
    /// Connection pool closed or exhausted.
    PoolExhausted,
    /// Connection is unhealthy.
    ConnectionUnhealthy,

    // Configuration errors
    /// Configuration is invalid.
    ConfigurationInvalid,

    /// Unknown or internal error.
    Unknown,
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpErrorKind::ConnectionRefused => write!(f, "Connection refused"),
            SmtpErrorKind::ConnectTimeout => write!(f, "Connect timeout"),
            SmtpErrorKind::ConnectionReset => write!(f, "Connection reset"),
            SmtpErrorKind::TlsHandshakeFailed => write!(f, "TLS handshake failed"),
            SmtpErrorKind::StarttlsNotSupported => write!(f, "STARTTLS not supported"),
            SmtpErrorKind::CredentialsInvalid => write!(f, "Invalid credentials"),
            SmtpErrorKind::AuthMethodNotSupported => write!(f, "Auth method not supported"),
            SmtpErrorKind::AuthenticationRequired => write!(f, "Authentication required"),
            SmtpErrorKind::InvalidResponse => write!(f, "Invalid server response"),
            SmtpErrorKind::UnexpectedResponse => write!(f, "Unexpected response"),
            SmtpErrorKind::ServerShutdown => write!(f, "Server shutting down"),
            SmtpErrorKind::InvalidFromAddress => write!(f, "Invalid sender address"),
            SmtpErrorKind::InvalidRecipientAddress => write!(f, "Invalid recipient address"),
            SmtpErrorKind::MessageTooLarge => write!(f, "Message too large"),
            SmtpErrorKind::InvalidHeader => write!(f, "Invalid header"),
            SmtpErrorKind::ReadTimeout => write!(f, "Read timeout"),
            SmtpErrorKind::WriteTimeout => write!(f, "Write timeout"),
            SmtpErrorKind::SendTimeout => write!(f, "Send timeout"),
            SmtpErrorKind::PoolExhausted => write!(f, "Connection pool exhausted"),
            SmtpErrorKind::ConnectionUnhealthy => write!(f, "Connection unhealthy"),
            SmtpErrorKind::ConfigurationInvalid => write!(f, "Invalid configuration"),
            SmtpErrorKind::Unknown => write!(f, "Unknown error"),
        }
    }
}

/// SMTP error with detailed information.
#[derive(Error, Debug)]
pub struct SmtpError {
    kind: SmtpErrorKind,
    message: String,
    smtp_code: Option<u16>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SmtpError {
    /// Creates a new SMTP error.
    pub fn new(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP status code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> SmtpErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP status code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConnectionRefused, message)
    }

    /// Creates a timeout error.
    pub fn timeout(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::TlsHandshakeFailed, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::CredentialsInvalid, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::InvalidResponse, message)
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConfigurationInvalid, message)
    }

    /// Creates a pool error.
    pub fn pool(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates an error from an SMTP reply code.
    pub fn from_smtp_response(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            421 => SmtpErrorKind::ServerShutdown,
            500..=503 => SmtpErrorKind::InvalidResponse,
            530 => SmtpErrorKind::AuthenticationRequired,
            535 => SmtpErrorKind::CredentialsInvalid,
            550 | 551 => SmtpErrorKind::InvalidRecipientAddress,
            552 => SmtpErrorKind::MessageTooLarge,
            553 => SmtpErrorKind::InvalidFromAddress,
            400..=599 => SmtpErrorKind::UnexpectedResponse,
            _ => SmtpErrorKind::Unknown,
        };
        Self::new(kind, message).with_smtp_code(code)
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        Ok(())
    }
}

/// Why an address was given up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The batch was cancelled before the address was delivered.
    Cancelled,
    /// The individual retry failed with this error.
    Rejected(String),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Cancelled => f.write_str("cancelled"),
            FailureCause::Rejected(reason) => f.write_str(reason),
        }
    }
}

/// Aggregate failure of an email batch after the retry tier has run.
///
/// `to` lists every permanently failed address exactly once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to deliver \"{subject}\" from {from} to {} address(es): {}", .to.len(), .to.join(", "))]
pub struct EmailSentError {
    /// Sender address.
    pub from: String,
    /// Permanently failed recipient addresses.
    pub to: Vec<String>,
    /// Message subject.
    pub subject: String,
    /// Message body.
    pub body: String,
    /// First recorded cause per address in `to`.
    pub causes: HashMap<String, FailureCause>,
}

impl EmailSentError {
    /// Cause recorded for `address`.
    pub fn cause(&self, address: &str) -> Option<&FailureCause> {
        self.causes.get(address)
    }
}

/// Errors produced by the pooled email sender.
#[derive(Error, Debug)]
pub enum MailerError {
    /// Content type is not one of the supported values.
    #[error("invalid email content type: {0}")]
    InvalidContentType(String),

    /// Send pool size must be positive.
    #[error("send workers must be greater than 0")]
    InvalidSendWorkers,

    /// Retry pool size must be positive.
    #[error("retry workers must be greater than 0")]
    InvalidRetryWorkers,

    /// Group size must be positive.
    #[error("group size must be greater than 0")]
    InvalidGroupSize,

    /// Per-unit timeout must be positive.
    #[error("timeout must be greater than 0")]
    InvalidTimeout,

    /// Send + retry workers above the allowed total.
    #[error("total number of workers (send + retry) cannot exceed {max}")]
    TooManyWorkers {
        /// Allowed maximum.
        max: usize,
    },

    /// Empty recipient list.
    #[error("no recipients provided")]
    NoRecipients,

    /// Empty sender.
    #[error("no sender provided")]
    NoSender,

    /// Empty subject.
    #[error("no subject provided")]
    NoSubject,

    /// Empty body.
    #[error("no body provided")]
    NoBody,

    /// `send_emails` called before `set_data`.
    #[error("mailer data has not been set")]
    DataNotSet,

    /// The underlying pooled transport could not be built.
    #[error("failed to create email pool: {0}")]
    PoolCreation(#[source] SmtpError),

    /// Some addresses were still failing after retry.
    #[error(transparent)]
    Undelivered(#[from] EmailSentError),
}

impl MailerError {
    /// Returns true for errors raised before any network activity.
    pub fn is_validation(&self) -> bool {
        !matches!(self, MailerError::PoolCreation(_) | MailerError::Undelivered(_))
    }
}

/// Errors produced by the remote messaging gateway client.
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Gateway answered with a non-2xx status.
    #[error("gateway returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
    },

    /// Transport-level failure (connect, timeout, TLS).
    #[error("gateway request failed: {0}")]
    Network(String),

    /// Response body could not be decoded.
    #[error("failed to decode gateway response: {0}")]
    Decode(String),

    /// Request could not be built from the given input.
    #[error("invalid gateway request: {0}")]
    InvalidRequest(String),

    /// Client misconfiguration.
    #[error("gateway configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for MessagingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            MessagingError::Decode(err.to_string())
        } else if err.is_builder() {
            MessagingError::InvalidRequest(err.to_string())
        } else {
            MessagingError::Network(err.to_string())
        }
    }
}

/// Phone normalization failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhoneError {
    /// Fewer than the minimum number of digits after stripping.
    #[error("phone number too short: {digits} digit(s), at least {min} required")]
    TooShort {
        /// Digits found.
        digits: usize,
        /// Required minimum.
        min: usize,
    },
}

/// Credential decryption failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Session token could not be decrypted or parsed.
    #[error("invalid session token: {0}")]
    InvalidToken(String),

    /// Key material has an unsupported length or encoding.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// IV/nonce has an unsupported length.
    #[error("invalid iv: expected {expected} bytes, got {actual}")]
    InvalidIv {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Authenticated decryption failed.
    #[error("decryption failed")]
    Decryption,

    /// Encryption failed.
    #[error("encryption failed")]
    Encryption,

    /// Decrypted bytes are not valid UTF-8.
    #[error("decrypted secret is not valid utf-8")]
    Encoding,
}

/// Persistence collaborator failures.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Could not obtain a connection.
    #[error("database connection error: {0}")]
    Connection(String),

    /// Statement failed.
    #[error("database query error: {0}")]
    Query(String),
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for RepositoryError {
    fn from(err: tokio_postgres::Error) -> Self {
        RepositoryError::Query(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<deadpool_postgres::PoolError> for RepositoryError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        RepositoryError::Connection(err.to_string())
    }
}

/// Stable classification of [`DispatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchErrorKind {
    /// No recipient matched the requested IDs.
    RecipientsNotFound,
    /// Email account reference did not resolve.
    SmtpNotFound,
    /// Messaging instance reference did not resolve.
    WhatsAppNotFound,
    /// Token or password decryption failed.
    Decryption,
    /// Request failed validation.
    InvalidRequest,
    /// The email pool could not be built.
    Mailer,
    /// A collaborator repository failed.
    Repository,
    /// Configuration is invalid.
    Configuration,
}

/// Request-level dispatch failure.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No recipient matched the requested IDs.
    #[error("recipients not found")]
    RecipientsNotFound,

    /// Email account reference did not resolve.
    #[error("smtp account not found")]
    SmtpNotFound,

    /// Messaging instance reference did not resolve.
    #[error("whatsapp instance not found")]
    WhatsAppNotFound,

    /// Token or password decryption failed.
    #[error(transparent)]
    Decryption(#[from] CryptoError),

    /// Mailer validation or pool construction failed.
    #[error(transparent)]
    Mailer(MailerError),

    /// A collaborator repository failed.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Error wrapped with a context tag.
    #[error("{context}: {source}")]
    Traced {
        /// Operation name.
        context: String,
        /// Wrapped error.
        #[source]
        source: Box<DispatchError>,
    },
}

impl DispatchError {
    /// Wraps the error with an operation context tag.
    pub fn trace(self, context: impl Into<String>) -> Self {
        DispatchError::Traced {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, skipping context tags.
    pub fn root(&self) -> &DispatchError {
        match self {
            DispatchError::Traced { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns the error classification.
    pub fn kind(&self) -> DispatchErrorKind {
        match self.root() {
            DispatchError::RecipientsNotFound => DispatchErrorKind::RecipientsNotFound,
            DispatchError::SmtpNotFound => DispatchErrorKind::SmtpNotFound,
            DispatchError::WhatsAppNotFound => DispatchErrorKind::WhatsAppNotFound,
            DispatchError::Decryption(_) => DispatchErrorKind::Decryption,
            DispatchError::Mailer(e) if e.is_validation() => DispatchErrorKind::InvalidRequest,
            DispatchError::Mailer(_) => DispatchErrorKind::Mailer,
            DispatchError::Repository(_) => DispatchErrorKind::Repository,
            DispatchError::Configuration(_) => DispatchErrorKind::Configuration,
            DispatchError::Traced { .. } => DispatchErrorKind::Configuration,
        }
    }

    /// Maps the error to an HTTP status code hint.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            DispatchErrorKind::RecipientsNotFound
            | DispatchErrorKind::SmtpNotFound
            | DispatchErrorKind::WhatsAppNotFound => 404,
            DispatchErrorKind::Decryption => 401,
            DispatchErrorKind::InvalidRequest => 400,
            DispatchErrorKind::Mailer
            | DispatchErrorKind::Repository
            | DispatchErrorKind::Configuration => 500,
        }
    }
}

impl From<MailerError> for DispatchError {
    fn from(err: MailerError) -> Self {
        DispatchError::Mailer(err)
    }
}
