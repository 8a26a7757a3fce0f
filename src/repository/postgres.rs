//! Postgres-backed repositories on a `deadpool-postgres` pool.

use std::env;
use std::fmt;

use async_trait::async_trait;
use deadpool_postgres::{Config, Pool, Runtime};
use secrecy::{ExposeSecret, SecretString};
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use super::{
    DeliveryLogRepository, MessagingInstanceRepository, RecipientRepository, RepositoryResult,
    SmtpAccountRepository,
};
use crate::errors::RepositoryError;
use crate::types::{DeliveryLogEntry, MessagingInstance, Recipient, SmtpAccount};

const FIND_RECIPIENTS: &str = "SELECT id, name, email, phone FROM students WHERE id = ANY($1)";

const FIND_SMTP_ACCOUNT: &str = "SELECT id, host, port, email, password, iv FROM smtp_instances WHERE id = $1";

const FIND_MESSAGING_INSTANCE: &str = "SELECT id, instance_id FROM whatsapp_instances WHERE id = $1";

const INSERT_LOG: &str = "INSERT INTO message_logs \
    (student_id, channel, success, error_text, subject, body, smtp_id, whatsapp_instance_id, \
    attachment_names, attachment_count, created_at) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)";

/// Database connection settings.
#[derive(Clone)]
pub struct DatabaseConfig {
    /// Host.
    pub host: String,
    /// Port.
    pub port: u16,
    /// User.
    pub user: String,
    /// Password.
    pub password: SecretString,
    /// Database name.
    pub database: String,
    /// Pool size.
    pub max_connections: usize,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl DatabaseConfig {
    /// Reads `DATABASE_URL`, falling back to `POSTGRES_HOST`, `POSTGRES_PORT`,
    /// `POSTGRES_USER`, `POSTGRES_PASSWORD` and `POSTGRES_DB`.
    pub fn from_env() -> Result<Self, RepositoryError> {
        if let Ok(database_url) = env::var("DATABASE_URL") {
            let url = url::Url::parse(&database_url)
                .map_err(|e| RepositoryError::Connection(format!("invalid DATABASE_URL: {}", e)))?;
            return Ok(Self {
                host: url.host_str().unwrap_or("localhost").to_string(),
                port: url.port().unwrap_or(5432),
                user: url.username().to_string(),
                password: SecretString::new(url.password().unwrap_or_default().to_string()),
                database: url.path().trim_start_matches('/').to_string(),
                max_connections: 10,
            });
        }

        Ok(Self {
            host: env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("POSTGRES_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            user: env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: SecretString::new(env::var("POSTGRES_PASSWORD").unwrap_or_default()),
            database: env::var("POSTGRES_DB").unwrap_or_else(|_| "unicast".to_string()),
            max_connections: 10,
        })
    }

    /// Builds a connection pool. No connection is opened yet.
    pub fn create_pool(&self) -> Result<Pool, RepositoryError> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.expose_secret().clone());
        cfg.dbname = Some(self.database.clone());
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(self.max_connections));

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| RepositoryError::Connection(e.to_string()))
    }
}

/// Recipient, SMTP account and messaging instance lookups.
#[derive(Clone)]
pub struct PgLookupRepository {
    pool: Pool,
}

impl PgLookupRepository {
    /// Wraps a pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn recipient_from_row(row: &Row) -> Result<Recipient, tokio_postgres::Error> {
    Ok(Recipient {
        id: row.try_get("id")?,
        name: row.try_get::<_, Option<String>>("name")?.unwrap_or_default(),
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
    })
}

#[async_trait]
impl RecipientRepository for PgLookupRepository {
    async fn find_by_ids(&self, ids: &[Uuid]) -> RepositoryResult<Vec<Recipient>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.pool.get().await?;
        let rows = client.query(FIND_RECIPIENTS, &[&ids]).await?;
        Ok(rows.iter().map(recipient_from_row).collect::<Result<_, _>>()?)
    }
}

#[async_trait]
impl SmtpAccountRepository for PgLookupRepository {
    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<SmtpAccount>> {
        let client = self.pool.get().await?;
        let Some(row) = client.query_opt(FIND_SMTP_ACCOUNT, &[&id]).await? else {
            return Ok(None);
        };

        let port: i32 = row.try_get("port")?;
        let port = u16::try_from(port)
            .map_err(|_| RepositoryError::Query(format!("smtp account {} has invalid port {}", id, port)))?;

        Ok(Some(SmtpAccount {
            id: row.try_get("id")?,
            host: row.try_get("host")?,
            port,
            email: row.try_get("email")?,
            encrypted_password: row.try_get("password")?,
            iv: row.try_get("iv")?,
        }))
    }
}

#[async_trait]
impl MessagingInstanceRepository for PgLookupRepository {
    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<MessagingInstance>> {
        let client = self.pool.get().await?;
        let Some(row) = client.query_opt(FIND_MESSAGING_INSTANCE, &[&id]).await? else {
            return Ok(None);
        };

        Ok(Some(MessagingInstance {
            id: row.try_get("id")?,
            instance_ref: row.try_get("instance_id")?,
        }))
    }
}

/// Writes delivery log rows into `message_logs`.
#[derive(Clone)]
pub struct PgDeliveryLogRepository {
    pool: Pool,
}

impl PgDeliveryLogRepository {
    /// Wraps a pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryLogRepository for PgDeliveryLogRepository {
    async fn save(&self, entry: &DeliveryLogEntry) -> RepositoryResult<()> {
        let client = self.pool.get().await?;
        let attachment_count = i32::try_from(entry.attachment_count()).unwrap_or(i32::MAX);

        client
            .execute(
                INSERT_LOG,
                &[
                    &entry.recipient_id,
                    &entry.channel.as_str(),
                    &entry.success,
                    &entry.error_text,
                    &entry.subject,
                    &entry.body,
                    &entry.smtp_account_id,
                    &entry.messaging_instance_id,
                    &entry.joined_attachment_names(),
                    &attachment_count,
                    &entry.created_at,
                ],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DatabaseConfig {
        DatabaseConfig {
            host: "localhost".into(),
            port: 5432,
            user: "postgres".into(),
            password: SecretString::new("db-secret".into()),
            database: "unicast".into(),
            max_connections: 4,
        }
    }

    #[test]
    fn test_debug_redacts_password() {
        assert!(!format!("{:?}", config()).contains("db-secret"));
    }

    #[tokio::test]
    async fn test_create_pool_is_lazy() {
        let pool = config().create_pool().unwrap();
        assert_eq!(pool.status().max_size, 4);
        assert_eq!(pool.status().size, 0);
    }
}
