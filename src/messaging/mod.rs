//! Remote messaging gateway (WhatsApp over the Evolution API).
//!
//! Every call is one synchronous HTTP request. Only text messages are
//! retried, through [`send_text_with_retry`]; media sends are single attempts.

mod evolution;

pub use evolution::{EvolutionClient, MessageKey, SendMessageResponse};

use async_trait::async_trait;

use crate::errors::MessagingError;
use crate::resilience::{RetryExecutor, RetryPolicy};

/// Result type for gateway calls.
pub type MessagingResult<T> = Result<T, MessagingError>;

/// One message per call to a channel instance.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Sends a text message.
    async fn send_text(&self, instance: &str, number: &str, text: &str) -> MessagingResult<()>;

    /// Sends a file carried inline.
    async fn send_media(
        &self,
        instance: &str,
        number: &str,
        file_name: &str,
        data: &[u8],
        caption: &str,
    ) -> MessagingResult<()>;

    /// Sends a file the gateway downloads from `url`.
    async fn send_media_url(
        &self,
        instance: &str,
        number: &str,
        url: &str,
        file_name: &str,
        caption: &str,
    ) -> MessagingResult<()>;
}

/// Sends a text message, retrying with a fixed delay per `policy`.
///
/// Returns the last error when every attempt fails.
pub async fn send_text_with_retry(
    gateway: &dyn MessagingGateway,
    instance: &str,
    number: &str,
    text: &str,
    policy: &RetryPolicy,
) -> MessagingResult<()> {
    RetryExecutor::new(*policy)
        .execute(|| gateway.send_text(instance, number, text))
        .await
}

/// Gateway media category for a MIME type.
pub fn infer_media_type(mime_type: &str) -> &'static str {
    if mime_type.starts_with("image/") {
        "image"
    } else if mime_type.starts_with("video/") {
        "video"
    } else if mime_type.starts_with("audio/") {
        "audio"
    } else {
        "document"
    }
}
