//! Domain types shared by the dispatch pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{EmailSentError, MailerError};

/// A resolved recipient. Either contact method may be absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Recipient identity.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Email address, if known.
    pub email: Option<String>,
    /// Free-form phone number, if known.
    pub phone: Option<String>,
}

impl Recipient {
    /// Creates a recipient with no contact methods.
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            email: None,
            phone: None,
        }
    }

    /// Sets the email address.
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Sets the phone number.
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Returns the trimmed email address, or `None` when missing or blank.
    pub fn email_address(&self) -> Option<&str> {
        self.email.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }

    /// Returns the raw phone, or `None` when missing or blank.
    pub fn phone_number(&self) -> Option<&str> {
        self.phone.as_deref().filter(|p| !p.trim().is_empty())
    }
}

/// A file to deliver alongside the message.
///
/// Inline bytes take precedence. An empty inline payload counts as absent, so
/// the URL is used on the messaging channel and the email channel skips it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name presented to the recipient.
    pub file_name: String,
    /// Inline payload.
    #[serde(default)]
    pub data: Option<Vec<u8>>,
    /// Remote payload location.
    #[serde(default)]
    pub url: Option<String>,
}

impl Attachment {
    /// Creates an attachment with an inline payload.
    pub fn inline(file_name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            data: Some(data.into()),
            url: None,
        }
    }

    /// Creates an attachment that points to a remote URL.
    pub fn remote(file_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            data: None,
            url: Some(url.into()),
        }
    }

    /// Non-empty inline payload, if any.
    pub fn inline_bytes(&self) -> Option<&[u8]> {
        self.data.as_deref().filter(|d| !d.is_empty())
    }

    /// Non-blank URL, if any.
    pub fn remote_url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }

    /// MIME type guessed from the file name.
    pub fn mime_type(&self) -> mime::Mime {
        mime_guess::from_path(&self.file_name).first_or_octet_stream()
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("file_name", &self.file_name)
            .field("data_len", &self.data.as_ref().map(Vec::len))
            .field("url", &self.url)
            .finish()
    }
}

/// Email body content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContentType {
    /// `text/plain`.
    #[default]
    #[serde(rename = "text/plain")]
    TextPlain,
    /// `text/html`.
    #[serde(rename = "text/html")]
    TextHtml,
}

impl ContentType {
    /// MIME type string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::TextPlain => "text/plain",
            ContentType::TextHtml => "text/html",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = MailerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text/plain" => Ok(ContentType::TextPlain),
            "text/html" => Ok(ContentType::TextHtml),
            other => Err(MailerError::InvalidContentType(other.to_string())),
        }
    }
}

/// Stored email account credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct SmtpAccount {
    /// Account identity.
    pub id: Uuid,
    /// SMTP server host.
    pub host: String,
    /// SMTP server port.
    pub port: u16,
    /// Login and default sender address.
    pub email: String,
    /// Encrypted password.
    pub encrypted_password: Vec<u8>,
    /// Per-account IV used to encrypt the password.
    pub iv: Vec<u8>,
}

impl fmt::Debug for SmtpAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpAccount")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("email", &self.email)
            .field("encrypted_password", &"[REDACTED]")
            .finish()
    }
}

/// A messaging gateway instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagingInstance {
    /// Instance identity.
    pub id: Uuid,
    /// Opaque instance reference understood by the gateway.
    pub instance_ref: String,
}

/// A single logical notification request.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Sender address. Falls back to the account address when blank.
    pub from: String,
    /// Recipient identities to resolve.
    pub recipient_ids: Vec<Uuid>,
    /// Message subject.
    pub subject: String,
    /// Message body.
    pub body: String,
    /// Email body content type.
    pub content_type: ContentType,
    /// Ordered attachments.
    pub attachments: Vec<Attachment>,
    /// Email account reference.
    pub smtp_account_id: Uuid,
    /// Messaging instance reference.
    pub messaging_instance_id: Uuid,
    /// Session token carrying the password key.
    pub token: SecretString,
}

/// Outcome of a dispatch: per-channel failure sets plus the email batch error.
#[derive(Debug, Clone, Default)]
pub struct DispatchResult {
    /// Recipients not reached by email.
    pub emails_failed: Vec<Recipient>,
    /// Recipients not reached on WhatsApp.
    pub whatsapp_failed: Vec<Recipient>,
    /// Aggregate email failure, if the batch did not fully succeed.
    pub email_error: Option<EmailSentError>,
}

impl DispatchResult {
    /// Returns true when both channels reached every recipient.
    pub fn is_complete_success(&self) -> bool {
        self.emails_failed.is_empty() && self.whatsapp_failed.is_empty()
    }
}

/// Delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    /// SMTP email.
    Email,
    /// WhatsApp gateway.
    WhatsApp,
}

impl Channel {
    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::WhatsApp => "WHATSAPP",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only delivery log row per (recipient, channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    /// Recipient identity.
    pub recipient_id: Uuid,
    /// Channel used.
    pub channel: Channel,
    /// Whether delivery succeeded.
    pub success: bool,
    /// Failure reason.
    pub error_text: Option<String>,
    /// Subject echo.
    pub subject: String,
    /// Body echo.
    pub body: String,
    /// Email account used, for email rows.
    pub smtp_account_id: Option<Uuid>,
    /// Messaging instance used, for WhatsApp rows.
    pub messaging_instance_id: Option<Uuid>,
    /// Attachment file names.
    pub attachment_names: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl DeliveryLogEntry {
    /// Attachment names joined for storage.
    pub fn joined_attachment_names(&self) -> String {
        self.attachment_names.join(",")
    }

    /// Number of attachments.
    pub fn attachment_count(&self) -> usize {
        self.attachment_names.len()
    }
}
