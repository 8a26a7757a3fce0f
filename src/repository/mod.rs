//! Persistence collaborators used by the dispatcher.
//!
//! Lookups return `Ok(None)` (or an empty list) when nothing matches; only
//! storage failures are errors.

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::{DatabaseConfig, PgDeliveryLogRepository, PgLookupRepository};

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::RepositoryError;
use crate::types::{DeliveryLogEntry, MessagingInstance, Recipient, SmtpAccount};

/// Result type for repository calls.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Resolves recipients by identity.
#[async_trait]
pub trait RecipientRepository: Send + Sync {
    /// Returns the recipients matching `ids`. Unknown IDs are skipped.
    async fn find_by_ids(&self, ids: &[Uuid]) -> RepositoryResult<Vec<Recipient>>;
}

/// Resolves SMTP accounts.
#[async_trait]
pub trait SmtpAccountRepository: Send + Sync {
    /// Returns the account with `id`, if any.
    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<SmtpAccount>>;
}

/// Resolves messaging channel instances.
#[async_trait]
pub trait MessagingInstanceRepository: Send + Sync {
    /// Returns the instance with `id`, if any.
    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<MessagingInstance>>;
}

/// Append-only delivery log.
#[async_trait]
pub trait DeliveryLogRepository: Send + Sync {
    /// Appends one entry.
    async fn save(&self, entry: &DeliveryLogEntry) -> RepositoryResult<()>;
}
