//! Connection pool for SMTP sessions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed::{
    Manager, Metrics, Object, Pool, PoolConfig, PoolError, RecycleError, RecycleResult, Timeouts,
};
use tokio::time::timeout;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::mailer::{EmailPool, PoolFactory};
use crate::smtp::mime::MimeEncoder;
use crate::smtp::protocol::TransactionState;
use crate::smtp::transport::TcpTransport;
use crate::smtp::{OutgoingEmail, SmtpSettings};

/// Creates ready-to-send sessions and recycles healthy ones.
#[derive(Debug)]
pub struct SmtpConnectionManager {
    settings: Arc<SmtpSettings>,
    created: AtomicUsize,
}

impl SmtpConnectionManager {
    /// Creates a new connection manager.
    pub fn new(settings: SmtpSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            created: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Manager for SmtpConnectionManager {
    type Type = TcpTransport;
    type Error = SmtpError;

    async fn create(&self) -> Result<TcpTransport, SmtpError> {
        let transport = TcpTransport::establish(&self.settings).await?;
        let n = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(host = %self.settings.host, connections = n, "Opened SMTP connection");
        Ok(transport)
    }

    async fn recycle(&self, conn: &mut TcpTransport, _: &Metrics) -> RecycleResult<SmtpError> {
        // a transaction that was interrupted leaves the session in an unknown state
        if conn.state() != TransactionState::Ready {
            return Err(RecycleError::StaticMessage("connection left mid-transaction"));
        }
        conn.health_check().await.map_err(RecycleError::Backend)
    }
}

/// Pooled SMTP sender shared by all workers of one batch.
pub struct SmtpPool {
    pool: Pool<SmtpConnectionManager>,
    encoder: MimeEncoder,
}

impl SmtpPool {
    /// Builds a pool of at most `max_size` connections. No connection is opened yet.
    pub fn new(settings: SmtpSettings, max_size: usize) -> SmtpResult<Self> {
        if max_size == 0 {
            return Err(SmtpError::configuration("Pool size must be greater than 0"));
        }
        if settings.host.trim().is_empty() {
            return Err(SmtpError::configuration("SMTP host is required"));
        }

        let encoder = MimeEncoder::new(settings.client_id.clone());
        let pool = Pool::builder(SmtpConnectionManager::new(settings))
            .config(PoolConfig {
                max_size,
                ..Default::default()
            })
            .build()
            .map_err(|e| SmtpError::configuration(format!("Failed to create pool: {}", e)))?;

        Ok(Self { pool, encoder })
    }

    /// Current pool status.
    pub fn status(&self) -> deadpool::Status {
        self.pool.status()
    }

    fn map_pool_error(error: PoolError<SmtpError>) -> SmtpError {
        match error {
            PoolError::Backend(e) => e,
            PoolError::Closed => SmtpError::pool(SmtpErrorKind::PoolExhausted, "Pool is closed"),
            other => SmtpError::pool(SmtpErrorKind::PoolExhausted, format!("Failed to acquire connection: {}", other)),
        }
    }
}

#[async_trait]
impl EmailPool for SmtpPool {
    async fn send(&self, email: &OutgoingEmail, deadline: Duration) -> SmtpResult<()> {
        timeout(deadline, async {
            let mut conn = self.pool.get().await.map_err(Self::map_pool_error)?;
            conn.send_mail(email, &self.encoder).await
        })
        .await
        .map_err(|_| {
            SmtpError::timeout(
                SmtpErrorKind::SendTimeout,
                format!("Send to {} recipient(s) exceeded {:?}", email.to.len(), deadline),
            )
        })?
    }

    /// Says QUIT on every idle session, then closes the pool.
    async fn close(&self) {
        // zero timeouts never open a new session: with no runtime configured
        // creation fails immediately once the idle sessions are used up
        let drain = Timeouts {
            wait: Some(Duration::ZERO),
            create: Some(Duration::ZERO),
            recycle: None,
        };
        let mut quit = 0;
        while let Ok(conn) = self.pool.timeout_get(&drain).await {
            let mut transport = Object::take(conn);
            transport.close().await;
            quit += 1;
        }
        self.pool.close();
        tracing::debug!(sessions = quit, "Closed SMTP pool");
    }
}

/// Default factory: a real [`SmtpPool`] per batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmtpPoolFactory;

impl PoolFactory for SmtpPoolFactory {
    fn create(&self, settings: &SmtpSettings, size: usize) -> SmtpResult<Arc<dyn EmailPool>> {
        Ok(Arc::new(SmtpPool::new(settings.clone(), size)?))
    }
}
