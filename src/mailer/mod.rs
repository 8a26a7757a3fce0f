//! Pooled email sender.
//!
//! Recipients are split into fixed-size groups. `send_workers` tasks deliver
//! groups through one shared pool; a failed group is re-queued address by
//! address to `retry_workers` tasks, which try each address once more. Whatever
//! still fails is reported in a single [`EmailSentError`].
//!
//! The pool and both channels are scoped to one [`EmailSender::send_emails`]
//! call. Each channel closes when its last sender is dropped, which happens
//! exactly once on every return path.

mod collector;

pub use collector::FailureCollector;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{EmailPoolConfig, MAX_TOTAL_WORKERS};
use crate::errors::{EmailSentError, FailureCause, MailerError, SmtpResult};
use crate::smtp::{MailAttachment, OutgoingEmail, SmtpPoolFactory, SmtpSettings};
use crate::types::ContentType;

/// A transport able to deliver one [`OutgoingEmail`] at a time, shared by
/// every worker of a batch.
#[async_trait]
pub trait EmailPool: Send + Sync {
    /// Delivers `email` within `timeout`.
    async fn send(&self, email: &OutgoingEmail, timeout: Duration) -> SmtpResult<()>;

    /// Releases pooled connections.
    async fn close(&self);
}

/// Builds the pool used by one batch.
pub trait PoolFactory: Send + Sync {
    /// Creates a pool holding at most `size` connections.
    fn create(&self, settings: &SmtpSettings, size: usize) -> SmtpResult<Arc<dyn EmailPool>>;
}

/// Message to deliver to every recipient.
#[derive(Debug, Clone)]
pub struct MailerData {
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
    /// Attachments sent with every message.
    pub attachments: Vec<MailAttachment>,
}

/// Worker and grouping parameters for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Send workers.
    pub send_workers: usize,
    /// Retry workers.
    pub retry_workers: usize,
    /// Addresses per group.
    pub group_size: usize,
    /// Per-unit timeout.
    pub timeout: Duration,
}

impl SendOptions {
    /// Validates the options.
    pub fn validate(&self) -> Result<(), MailerError> {
        if self.send_workers == 0 {
            return Err(MailerError::InvalidSendWorkers);
        }
        if self.retry_workers == 0 {
            return Err(MailerError::InvalidRetryWorkers);
        }
        if self.group_size == 0 {
            return Err(MailerError::InvalidGroupSize);
        }
        if self.timeout.is_zero() {
            return Err(MailerError::InvalidTimeout);
        }
        if self.send_workers + self.retry_workers > MAX_TOTAL_WORKERS {
            return Err(MailerError::TooManyWorkers { max: MAX_TOTAL_WORKERS });
        }
        Ok(())
    }

    /// Connections needed by the pool.
    pub fn pool_size(&self) -> usize {
        self.send_workers + self.retry_workers
    }
}

impl Default for SendOptions {
    fn default() -> Self {
        (&EmailPoolConfig::default()).into()
    }
}

impl From<&EmailPoolConfig> for SendOptions {
    fn from(config: &EmailPoolConfig) -> Self {
        Self {
            send_workers: config.send_workers,
            retry_workers: config.retry_workers,
            group_size: config.group_size,
            timeout: config.send_timeout,
        }
    }
}

/// Message fields shared by every send unit of a batch.
struct Template {
    from: String,
    subject: String,
    body: String,
    content_type: ContentType,
    attachments: Arc<[MailAttachment]>,
}

impl Template {
    fn address(&self, to: Vec<String>) -> OutgoingEmail {
        OutgoingEmail {
            from: self.from.clone(),
            to,
            subject: self.subject.clone(),
            body: self.body.clone(),
            content_type: self.content_type,
            attachments: Arc::clone(&self.attachments),
        }
    }
}

/// State shared by the workers of one batch.
struct Batch {
    pool: Arc<dyn EmailPool>,
    template: Template,
    timeout: Duration,
    failures: FailureCollector,
    cancel: CancellationToken,
}

/// Concurrent email sender with a retry tier.
pub struct EmailSender {
    settings: SmtpSettings,
    factory: Arc<dyn PoolFactory>,
    data: Option<MailerData>,
}

impl fmt::Debug for EmailSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailSender")
            .field("settings", &self.settings)
            .field("recipients", &self.data.as_ref().map(|d| d.to.len()))
            .finish()
    }
}

impl EmailSender {
    /// Creates a sender using real SMTP connections.
    pub fn new(settings: SmtpSettings) -> Self {
        Self {
            settings,
            factory: Arc::new(SmtpPoolFactory),
            data: None,
        }
    }

    /// Replaces the pool factory.
    pub fn with_pool_factory(mut self, factory: Arc<dyn PoolFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Sets the message to deliver.
    pub fn set_data(&mut self, data: MailerData) {
        self.data = Some(data);
    }

    /// Returns the message, if set.
    pub fn data(&self) -> Option<&MailerData> {
        self.data.as_ref()
    }

    fn validate(data: &MailerData, options: &SendOptions) -> Result<(), MailerError> {
        options.validate()?;
        if data.to.is_empty() {
            return Err(MailerError::NoRecipients);
        }
        if data.from.trim().is_empty() {
            return Err(MailerError::NoSender);
        }
        if data.subject.trim().is_empty() {
            return Err(MailerError::NoSubject);
        }
        if data.body.is_empty() {
            return Err(MailerError::NoBody);
        }
        Ok(())
    }

    /// Delivers the message to every recipient.
    ///
    /// Returns [`MailerError::Undelivered`] naming each address still failing
    /// after its retry. Validation and pool construction errors are returned
    /// before any delivery is attempted.
    ///
    /// Cancelling `cancel` stops new deliveries; every address not yet
    /// delivered is reported as failed. All workers are joined and the pool is
    /// closed before this returns.
    pub async fn send_emails(
        &self,
        options: &SendOptions,
        cancel: &CancellationToken,
    ) -> Result<(), MailerError> {
        let data = self.data.as_ref().ok_or(MailerError::DataNotSet)?;
        Self::validate(data, options)?;

        let pool = self
            .factory
            .create(&self.settings, options.pool_size())
            .map_err(MailerError::PoolCreation)?;

        let batch = Arc::new(Batch {
            pool: Arc::clone(&pool),
            template: Template {
                from: data.from.clone(),
                subject: data.subject.clone(),
                body: data.body.clone(),
                content_type: data.content_type,
                attachments: Arc::from(data.attachments.clone()),
            },
            timeout: options.timeout,
            failures: FailureCollector::new(),
            cancel: cancel.child_token(),
        });

        let groups: Vec<Vec<String>> = data.to.chunks(options.group_size).map(<[String]>::to_vec).collect();

        tracing::info!(
            recipients = data.to.len(),
            groups = groups.len(),
            send_workers = options.send_workers,
            retry_workers = options.retry_workers,
            "Starting email batch"
        );

        // capacities cover every item, so producers never block
        let (group_tx, group_rx) = mpsc::channel::<Vec<String>>(groups.len().max(1));
        let (retry_tx, retry_rx) = mpsc::channel::<String>(data.to.len().max(1));
        let group_rx = Arc::new(Mutex::new(group_rx));
        let retry_rx = Arc::new(Mutex::new(retry_rx));

        let mut retry_workers = JoinSet::new();
        for id in 0..options.retry_workers {
            retry_workers.spawn(retry_worker(id, Arc::clone(&batch), Arc::clone(&retry_rx)));
        }

        let mut send_workers = JoinSet::new();
        for id in 0..options.send_workers {
            send_workers.spawn(send_worker(
                id,
                Arc::clone(&batch),
                Arc::clone(&group_rx),
                retry_tx.clone(),
            ));
        }
        // send workers now own every retry sender
        drop(retry_tx);

        for group in groups {
            if let Err(mpsc::error::SendError(group)) = group_tx.send(group).await {
                batch.failures.extend(group, abandoned());
            }
        }
        drop(group_tx);

        join_workers(&mut send_workers, "send").await;
        join_workers(&mut retry_workers, "retry").await;

        pool.close().await;

        let failures = batch.failures.take();

        if failures.is_empty() {
            tracing::info!(recipients = data.to.len(), "Email batch delivered");
            return Ok(());
        }

        tracing::warn!(
            recipients = data.to.len(),
            failed = failures.len(),
            "Email batch finished with undelivered addresses"
        );

        Err(MailerError::Undelivered(EmailSentError {
            from: data.from.clone(),
            to: failures.iter().map(|(address, _)| address.clone()).collect(),
            subject: data.subject.clone(),
            body: data.body.clone(),
            causes: failures.into_iter().collect(),
        }))
    }
}

/// Cause for addresses no worker was left to take.
fn abandoned() -> FailureCause {
    FailureCause::Rejected("no email worker available".into())
}

async fn join_workers(workers: &mut JoinSet<()>, tier: &'static str) {
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            tracing::error!(tier, error = %e, "Email worker terminated abnormally");
        }
    }
}

/// Sends one unit, or returns `None` when the batch is cancelled first.
async fn deliver(batch: &Batch, email: &OutgoingEmail) -> Option<SmtpResult<()>> {
    tokio::select! {
        result = batch.pool.send(email, batch.timeout) => Some(result),
        _ = batch.cancel.cancelled() => None,
    }
}

async fn send_worker(
    id: usize,
    batch: Arc<Batch>,
    groups: Arc<Mutex<mpsc::Receiver<Vec<String>>>>,
    retry: mpsc::Sender<String>,
) {
    tracing::debug!(worker = id, "Send worker started");

    loop {
        let group = groups.lock().await.recv().await;
        let Some(group) = group else { break };

        if batch.cancel.is_cancelled() {
            batch.failures.extend(group, FailureCause::Cancelled);
            continue;
        }

        let email = batch.template.address(group);
        let Some(result) = deliver(&batch, &email).await else {
            batch.failures.extend(email.to, FailureCause::Cancelled);
            continue;
        };

        if let Err(e) = result {
            tracing::warn!(
                worker = id,
                recipients = email.to.len(),
                error = %e,
                "Group delivery failed, queueing addresses for retry"
            );
            for address in email.to {
                if let Err(mpsc::error::SendError(address)) = retry.send(address).await {
                    batch.failures.push(address, abandoned());
                }
            }
        }
    }

    tracing::debug!(worker = id, "Send worker stopped");
}

async fn retry_worker(id: usize, batch: Arc<Batch>, addresses: Arc<Mutex<mpsc::Receiver<String>>>) {
    tracing::debug!(worker = id, "Retry worker started");

    loop {
        let address = addresses.lock().await.recv().await;
        let Some(address) = address else { break };

        if batch.cancel.is_cancelled() {
            batch.failures.push(address, FailureCause::Cancelled);
            continue;
        }

        let email = batch.template.address(vec![address]);
        let Some(result) = deliver(&batch, &email).await else {
            batch.failures.extend(email.to, FailureCause::Cancelled);
            continue;
        };

        if let Err(e) = result {
            tracing::warn!(worker = id, address = %email.to[0], error = %e, "Retry delivery failed");
            batch.failures.extend(email.to, FailureCause::Rejected(e.to_string()));
        }
    }

    tracing::debug!(worker = id, "Retry worker stopped");
}
