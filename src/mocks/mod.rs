//! Mock collaborators for London-school tests.
//!
//! Every mock records the calls it receives so tests can assert on
//! interactions as well as outcomes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::SecretString;
use uuid::Uuid;

use crate::crypto::{PasswordDecryptor, SessionKeys, TokenDecryptor};
use crate::errors::{
    CryptoError, MessagingError, RepositoryError, SmtpError, SmtpErrorKind, SmtpResult,
};
use crate::mailer::{EmailPool, PoolFactory};
use crate::messaging::{MessagingGateway, MessagingResult};
use crate::repository::{
    DeliveryLogRepository, MessagingInstanceRepository, RecipientRepository, RepositoryResult,
    SmtpAccountRepository,
};
use crate::smtp::{OutgoingEmail, SmtpSettings};
use crate::types::{DeliveryLogEntry, MessagingInstance, Recipient, SmtpAccount};

/// When a [`MockEmailPool`] rejects a send.
#[derive(Debug, Clone, Default)]
enum PoolBehavior {
    #[default]
    Succeed,
    FailAlways,
    /// Every nth call fails unless one of its addresses already failed once.
    FailOnceEvery(usize),
    /// Any unit containing one of these addresses fails.
    FailAddresses(HashSet<String>),
}

/// In-memory [`EmailPool`].
#[derive(Debug, Default)]
pub struct MockEmailPool {
    behavior: PoolBehavior,
    latency: Option<Duration>,
    calls: AtomicUsize,
    failed_once: Mutex<HashSet<String>>,
    sent: Mutex<Vec<OutgoingEmail>>,
    closed: AtomicBool,
}

impl MockEmailPool {
    /// Pool accepting every send.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every send.
    pub fn fail_always(mut self) -> Self {
        self.behavior = PoolBehavior::FailAlways;
        self
    }

    /// Rejects every `n`th call once; the retried addresses then succeed.
    pub fn fail_once_every(mut self, n: usize) -> Self {
        self.behavior = PoolBehavior::FailOnceEvery(n.max(1));
        self
    }

    /// Rejects every unit addressed to one of `addresses`.
    pub fn fail_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.behavior = PoolBehavior::FailAddresses(addresses.into_iter().map(Into::into).collect());
        self
    }

    /// Sleeps for `latency` inside every send.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of send calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Emails accepted so far.
    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().clone()
    }

    /// Every address of every accepted email.
    pub fn delivered_addresses(&self) -> Vec<String> {
        self.sent.lock().iter().flat_map(|e| e.to.iter().cloned()).collect()
    }

    /// True once `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn should_fail(&self, call: usize, email: &OutgoingEmail) -> bool {
        match &self.behavior {
            PoolBehavior::Succeed => false,
            PoolBehavior::FailAlways => true,
            PoolBehavior::FailOnceEvery(n) => {
                if call % n != 0 {
                    return false;
                }
                let mut failed = self.failed_once.lock();
                if email.to.iter().any(|a| failed.contains(a)) {
                    return false;
                }
                failed.extend(email.to.iter().cloned());
                true
            }
            PoolBehavior::FailAddresses(addresses) => email.to.iter().any(|a| addresses.contains(a)),
        }
    }
}

#[async_trait]
impl EmailPool for MockEmailPool {
    async fn send(&self, email: &OutgoingEmail, _timeout: Duration) -> SmtpResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.should_fail(call, email) {
            return Err(SmtpError::new(SmtpErrorKind::ConnectionReset, "mock send failure"));
        }
        self.sent.lock().push(email.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// [`PoolFactory`] handing out one shared [`MockEmailPool`].
#[derive(Debug)]
pub struct MockPoolFactory {
    pool: Arc<MockEmailPool>,
    created: AtomicUsize,
    last_size: Mutex<Option<usize>>,
    last_settings: Mutex<Option<SmtpSettings>>,
}

impl MockPoolFactory {
    /// Wraps `pool`.
    pub fn new(pool: Arc<MockEmailPool>) -> Self {
        Self {
            pool,
            created: AtomicUsize::new(0),
            last_size: Mutex::new(None),
            last_settings: Mutex::new(None),
        }
    }

    /// The shared pool.
    pub fn pool(&self) -> Arc<MockEmailPool> {
        Arc::clone(&self.pool)
    }

    /// Number of pools created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Size requested by the last `create`.
    pub fn last_size(&self) -> Option<usize> {
        *self.last_size.lock()
    }

    /// Settings passed to the last `create`.
    pub fn last_settings(&self) -> Option<SmtpSettings> {
        self.last_settings.lock().clone()
    }
}

impl PoolFactory for MockPoolFactory {
    fn create(&self, settings: &SmtpSettings, size: usize) -> SmtpResult<Arc<dyn EmailPool>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        *self.last_size.lock() = Some(size);
        *self.last_settings.lock() = Some(settings.clone());
        Ok(self.pool.clone())
    }
}

#[derive(Debug)]
struct FailingPoolFactory;

impl PoolFactory for FailingPoolFactory {
    fn create(&self, _settings: &SmtpSettings, _size: usize) -> SmtpResult<Arc<dyn EmailPool>> {
        Err(SmtpError::configuration("mock pool construction failure"))
    }
}

/// A factory whose `create` always fails.
pub fn failing_pool_factory() -> Arc<dyn PoolFactory> {
    Arc::new(FailingPoolFactory)
}

/// A gateway call recorded by [`MockGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    /// `send_text`.
    Text {
        /// Instance.
        instance: String,
        /// Number.
        number: String,
        /// Text.
        text: String,
    },
    /// `send_media`.
    Media {
        /// Number.
        number: String,
        /// File name.
        file_name: String,
        /// Payload length.
        size: usize,
    },
    /// `send_media_url`.
    MediaUrl {
        /// Number.
        number: String,
        /// File name.
        file_name: String,
        /// URL.
        url: String,
    },
}

impl GatewayCall {
    fn number(&self) -> &str {
        match self {
            GatewayCall::Text { number, .. }
            | GatewayCall::Media { number, .. }
            | GatewayCall::MediaUrl { number, .. } => number,
        }
    }
}

/// In-memory [`MessagingGateway`].
#[derive(Debug, Default)]
pub struct MockGateway {
    text_failures_left: AtomicUsize,
    failing_numbers: HashSet<String>,
    failing_media: HashSet<String>,
    text_calls: AtomicUsize,
    calls: Mutex<Vec<(GatewayCall, bool)>>,
}

fn mock_status_error() -> MessagingError {
    MessagingError::Status {
        status: 500,
        body: "mock gateway failure".into(),
    }
}

impl MockGateway {
    /// Gateway accepting every call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` text calls.
    pub fn fail_text_times(self, n: usize) -> Self {
        self.text_failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Fails every call to `number`.
    pub fn fail_number(mut self, number: impl Into<String>) -> Self {
        self.failing_numbers.insert(number.into());
        self
    }

    /// Fails media sends of `file_name`.
    pub fn fail_media(mut self, file_name: impl Into<String>) -> Self {
        self.failing_media.insert(file_name.into());
        self
    }

    /// Number of `send_text` calls, including failed attempts.
    pub fn text_calls(&self) -> usize {
        self.text_calls.load(Ordering::SeqCst)
    }

    /// Every call, in order, with whether it succeeded.
    pub fn calls(&self) -> Vec<(GatewayCall, bool)> {
        self.calls.lock().clone()
    }

    /// Total number of calls.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Successful text calls.
    pub fn texts_delivered(&self) -> Vec<GatewayCall> {
        self.calls
            .lock()
            .iter()
            .filter(|(call, ok)| *ok && matches!(call, GatewayCall::Text { .. }))
            .map(|(call, _)| call.clone())
            .collect()
    }

    /// Calls addressed to `number`.
    pub fn calls_to(&self, number: &str) -> Vec<GatewayCall> {
        self.calls
            .lock()
            .iter()
            .filter(|(call, _)| call.number() == number)
            .map(|(call, _)| call.clone())
            .collect()
    }

    fn record(&self, call: GatewayCall, fail: bool) -> MessagingResult<()> {
        let fail = fail || self.failing_numbers.contains(call.number());
        self.calls.lock().push((call, !fail));
        if fail {
            Err(mock_status_error())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessagingGateway for MockGateway {
    async fn send_text(&self, instance: &str, number: &str, text: &str) -> MessagingResult<()> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .text_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.record(
            GatewayCall::Text {
                instance: instance.to_string(),
                number: number.to_string(),
                text: text.to_string(),
            },
            fail,
        )
    }

    async fn send_media(
        &self,
        _instance: &str,
        number: &str,
        file_name: &str,
        data: &[u8],
        _caption: &str,
    ) -> MessagingResult<()> {
        let fail = self.failing_media.contains(file_name);
        self.record(
            GatewayCall::Media {
                number: number.to_string(),
                file_name: file_name.to_string(),
                size: data.len(),
            },
            fail,
        )
    }

    async fn send_media_url(
        &self,
        _instance: &str,
        number: &str,
        url: &str,
        file_name: &str,
        _caption: &str,
    ) -> MessagingResult<()> {
        let fail = self.failing_media.contains(file_name);
        self.record(
            GatewayCall::MediaUrl {
                number: number.to_string(),
                file_name: file_name.to_string(),
                url: url.to_string(),
            },
            fail,
        )
    }
}

/// In-memory recipient, SMTP account and instance lookups.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    recipients: HashMap<Uuid, Recipient>,
    smtp_accounts: HashMap<Uuid, SmtpAccount>,
    instances: HashMap<Uuid, MessagingInstance>,
    unavailable: bool,
}

impl InMemoryDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds recipients.
    pub fn with_recipients(mut self, recipients: impl IntoIterator<Item = Recipient>) -> Self {
        self.recipients.extend(recipients.into_iter().map(|r| (r.id, r)));
        self
    }

    /// Adds an SMTP account.
    pub fn with_smtp_account(mut self, account: SmtpAccount) -> Self {
        self.smtp_accounts.insert(account.id, account);
        self
    }

    /// Adds a messaging instance.
    pub fn with_instance(mut self, instance: MessagingInstance) -> Self {
        self.instances.insert(instance.id, instance);
        self
    }

    /// Makes every lookup fail with a connection error.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    fn check(&self) -> RepositoryResult<()> {
        if self.unavailable {
            return Err(RepositoryError::Connection("mock directory unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecipientRepository for InMemoryDirectory {
    async fn find_by_ids(&self, ids: &[Uuid]) -> RepositoryResult<Vec<Recipient>> {
        self.check()?;
        Ok(ids.iter().filter_map(|id| self.recipients.get(id).cloned()).collect())
    }
}

#[async_trait]
impl SmtpAccountRepository for InMemoryDirectory {
    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<SmtpAccount>> {
        self.check()?;
        Ok(self.smtp_accounts.get(&id).cloned())
    }
}

#[async_trait]
impl MessagingInstanceRepository for InMemoryDirectory {
    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<MessagingInstance>> {
        self.check()?;
        Ok(self.instances.get(&id).cloned())
    }
}

/// In-memory [`DeliveryLogRepository`].
#[derive(Debug, Default)]
pub struct InMemoryDeliveryLog {
    entries: Mutex<Vec<DeliveryLogEntry>>,
    fail_saves: bool,
}

impl InMemoryDeliveryLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every save.
    pub fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    /// Saved entries in order.
    pub fn entries(&self) -> Vec<DeliveryLogEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl DeliveryLogRepository for InMemoryDeliveryLog {
    async fn save(&self, entry: &DeliveryLogEntry) -> RepositoryResult<()> {
        if self.fail_saves {
            return Err(RepositoryError::Query("mock log write failure".into()));
        }
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

/// [`TokenDecryptor`] returning fixed keys, or failing.
#[derive(Debug, Clone)]
pub struct MockTokenDecryptor {
    keys: Option<SessionKeys>,
}

impl MockTokenDecryptor {
    /// Returns `smtp_key` for every token.
    pub fn returning(smtp_key: impl Into<Vec<u8>>) -> Self {
        Self {
            keys: Some(SessionKeys {
                smtp_key: smtp_key.into(),
            }),
        }
    }

    /// Rejects every token.
    pub fn failing() -> Self {
        Self { keys: None }
    }
}

impl TokenDecryptor for MockTokenDecryptor {
    fn decrypt(&self, _token: &SecretString) -> Result<SessionKeys, CryptoError> {
        self.keys
            .clone()
            .ok_or_else(|| CryptoError::InvalidToken("mock token rejected".into()))
    }
}

/// [`PasswordDecryptor`] returning a fixed password, or failing.
#[derive(Debug, Clone)]
pub struct MockPasswordDecryptor {
    password: Option<String>,
}

impl MockPasswordDecryptor {
    /// Returns `password` for every input.
    pub fn returning(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
        }
    }

    /// Fails every decryption.
    pub fn failing() -> Self {
        Self { password: None }
    }
}

impl PasswordDecryptor for MockPasswordDecryptor {
    fn decrypt(&self, _cipher: &[u8], _key: &[u8], _iv: &[u8]) -> Result<SecretString, CryptoError> {
        self.password
            .clone()
            .map(SecretString::new)
            .ok_or(CryptoError::Decryption)
    }
}

/// Test fixtures.
pub mod fixtures {
    use super::*;
    use crate::types::{Attachment, ContentType, DispatchRequest};

    /// Recipient with the given contacts.
    pub fn recipient(name: &str, email: Option<&str>, phone: Option<&str>) -> Recipient {
        let mut recipient = Recipient::new(Uuid::new_v4(), name);
        recipient.email = email.map(str::to_string);
        recipient.phone = phone.map(str::to_string);
        recipient
    }

    /// `n` recipients with distinct emails and phones.
    pub fn recipients(n: usize) -> Vec<Recipient> {
        (0..n)
            .map(|i| {
                recipient(
                    &format!("Student {}", i),
                    Some(&format!("student{}@example.com", i)),
                    Some(&format!("11 9{:04} {:04}", i / 10_000, i % 10_000)),
                )
            })
            .collect()
    }

    /// SMTP account on `smtp.example.com:587`.
    pub fn smtp_account() -> SmtpAccount {
        SmtpAccount {
            id: Uuid::new_v4(),
            host: "smtp.example.com".into(),
            port: 587,
            email: "school@example.com".into(),
            encrypted_password: vec![0xAA; 24],
            iv: vec![0x01; 12],
        }
    }

    /// Messaging instance named `school`.
    pub fn messaging_instance() -> MessagingInstance {
        MessagingInstance {
            id: Uuid::new_v4(),
            instance_ref: "school".into(),
        }
    }

    /// Request addressed to `recipients` through the given account and instance.
    pub fn dispatch_request(
        recipients: &[Recipient],
        account: &SmtpAccount,
        instance: &MessagingInstance,
    ) -> DispatchRequest {
        DispatchRequest {
            from: "school@example.com".into(),
            recipient_ids: recipients.iter().map(|r| r.id).collect(),
            subject: "Parent meeting".into(),
            body: "The meeting is on Friday.".into(),
            content_type: ContentType::TextPlain,
            attachments: Vec::<Attachment>::new(),
            smtp_account_id: account.id,
            messaging_instance_id: instance.id,
            token: SecretString::new("session-token".into()),
        }
    }
}
