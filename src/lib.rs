//! # Unicast Dispatch
//!
//! Bulk notification engine delivering one message to many recipients over
//! email and WhatsApp:
//! - Pooled SMTP sender with a bounded send tier and a single-retry tier
//! - SMTP wire client with STARTTLS, implicit TLS and PLAIN/LOGIN auth
//! - Evolution API client for WhatsApp text and media
//! - Phone normalization for the messaging gateway
//! - Orchestrator reporting per-recipient failures on each channel and
//!   writing a delivery log
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use unicast_dispatch::{DispatchConfig, MessageService};
//! # use unicast_dispatch::mocks::{InMemoryDirectory, InMemoryDeliveryLog, MockTokenDecryptor};
//! # use unicast_dispatch::DispatchRequest;
//!
//! # async fn run(request: DispatchRequest) -> Result<(), Box<dyn std::error::Error>> {
//! let config = DispatchConfig::from_env()?;
//! let directory = Arc::new(InMemoryDirectory::new());
//!
//! let service = MessageService::builder()
//!     .config(config)
//!     .recipients(directory.clone())
//!     .smtp_accounts(directory.clone())
//!     .instances(directory)
//!     .delivery_log(Arc::new(InMemoryDeliveryLog::new()))
//!     .token_decryptor(Arc::new(MockTokenDecryptor::returning(vec![0u8; 32])))
//!     .build()?;
//!
//! let result = service.send(&CancellationToken::new(), request).await?;
//! println!(
//!     "{} email and {} WhatsApp failures",
//!     result.emails_failed.len(),
//!     result.whatsapp_failed.len()
//! );
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Channels
pub mod mailer;
pub mod messaging;
pub mod phone;
pub mod smtp;

// Collaborators
pub mod crypto;
pub mod repository;

// Resilience
pub mod resilience;

// Observability
pub mod observability;

// Orchestration
pub mod dispatch;

// Mocks for testing
pub mod mocks;

mod tests;

// Re-exports for convenience
pub use config::{
    AttachmentFailurePolicy, DecryptionFailurePolicy, DispatchConfig, DispatchConfigBuilder, EmailPoolConfig,
    GatewayConfig, SmtpConnectionConfig, WhatsAppConfig,
};
pub use crypto::{AesGcmPasswordCipher, PasswordDecryptor, SealedTokenCipher, SessionKeys, TokenDecryptor};
pub use dispatch::{MessageDispatcher, MessageService, MessageServiceBuilder};
pub use errors::{
    CryptoError, DispatchError, DispatchErrorKind, EmailSentError, FailureCause, MailerError, MessagingError,
    PhoneError, RepositoryError, SmtpError, SmtpErrorKind, SmtpResult,
};
pub use mailer::{EmailPool, EmailSender, FailureCollector, MailerData, PoolFactory, SendOptions};
pub use messaging::{send_text_with_retry, EvolutionClient, MessagingGateway};
pub use observability::{init_logging, DispatchMetrics, LogFormat, LogLevel, LoggingConfig};
pub use repository::{DeliveryLogRepository, MessagingInstanceRepository, RecipientRepository, SmtpAccountRepository};
pub use resilience::{RetryExecutor, RetryPolicy};
pub use smtp::{SmtpPool, SmtpPoolFactory, SmtpSettings, TlsMode};
pub use types::{
    Attachment, Channel, ContentType, DeliveryLogEntry, DispatchRequest, DispatchResult, MessagingInstance,
    Recipient, SmtpAccount,
};
