//! Dispatch orchestrator.
//!
//! One request fans out to two channels:
//!
//! 1. recipients, the SMTP account and the messaging instance are resolved;
//! 2. the SMTP password is decrypted with the key carried by the session token;
//! 3. the whole email batch goes through one [`EmailSender`] call;
//! 4. WhatsApp recipients are contacted one at a time;
//! 5. one delivery log row is written per recipient per channel.
//!
//! Missing recipients or credentials abort the request before anyone is
//! contacted. Everything after that is reported per recipient in
//! [`DispatchResult`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::{AttachmentFailurePolicy, DecryptionFailurePolicy, DispatchConfig};
use crate::crypto::{AesGcmPasswordCipher, PasswordDecryptor, TokenDecryptor};
use crate::errors::{DispatchError, EmailSentError, FailureCause, MailerError};
use crate::mailer::{EmailSender, MailerData, PoolFactory, SendOptions};
use crate::messaging::{send_text_with_retry, EvolutionClient, MessagingGateway};
use crate::observability::DispatchMetrics;
use crate::phone;
use crate::repository::{
    DeliveryLogRepository, MessagingInstanceRepository, RecipientRepository, SmtpAccountRepository,
};
use crate::resilience::RetryPolicy;
use crate::smtp::{MailAttachment, SmtpPoolFactory, SmtpSettings};
use crate::types::{
    Attachment, Channel, DeliveryLogEntry, DispatchRequest, DispatchResult, MessagingInstance, Recipient,
    SmtpAccount,
};

const NO_EMAIL: &str = "recipient has no email address";
const NO_PHONE: &str = "recipient has no phone number";
const CANCELLED: &str = "dispatch cancelled";
const PASSWORD_UNAVAILABLE: &str = "smtp password could not be decrypted";

/// Entry point used by request handlers.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    /// Delivers `request` on both channels.
    async fn send(&self, cancel: &CancellationToken, request: DispatchRequest) -> Result<DispatchResult, DispatchError>;
}

/// Per-recipient outcome on one channel; `None` means delivered.
type Outcomes = Vec<Option<String>>;

/// Email channel result for one request.
struct EmailOutcome {
    failures: Outcomes,
    error: Option<EmailSentError>,
}

/// Multi-channel message dispatcher.
pub struct MessageService {
    recipients: Arc<dyn RecipientRepository>,
    smtp_accounts: Arc<dyn SmtpAccountRepository>,
    instances: Arc<dyn MessagingInstanceRepository>,
    delivery_log: Arc<dyn DeliveryLogRepository>,
    tokens: Arc<dyn TokenDecryptor>,
    passwords: Arc<dyn PasswordDecryptor>,
    gateway: Arc<dyn MessagingGateway>,
    pool_factory: Arc<dyn PoolFactory>,
    config: DispatchConfig,
    metrics: Arc<DispatchMetrics>,
}

impl fmt::Debug for MessageService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MessageService {
    /// Creates a builder.
    pub fn builder() -> MessageServiceBuilder {
        MessageServiceBuilder::default()
    }

    /// Dispatch counters.
    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    /// Active configuration.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Delivers `request` by email and WhatsApp.
    ///
    /// # Errors
    ///
    /// Fails before contacting anyone when recipients or credentials cannot be
    /// resolved, when the SMTP password cannot be decrypted (unless
    /// [`DecryptionFailurePolicy::SkipEmail`] is configured), or when the email
    /// batch is rejected before sending. Delivery failures are reported in the
    /// returned [`DispatchResult`] instead.
    #[instrument(skip_all, fields(recipients = request.recipient_ids.len()))]
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        request: DispatchRequest,
    ) -> Result<DispatchResult, DispatchError> {
        self.metrics.record_request();
        match self.dispatch(cancel, &request).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.metrics.record_rejected();
                tracing::warn!(error = %e, "Dispatch rejected");
                Err(e.trace("send"))
            }
        }
    }

    async fn dispatch(
        &self,
        cancel: &CancellationToken,
        request: &DispatchRequest,
    ) -> Result<DispatchResult, DispatchError> {
        let recipients = self.recipients.find_by_ids(&request.recipient_ids).await?;
        if recipients.is_empty() {
            return Err(DispatchError::RecipientsNotFound);
        }

        let account = self
            .smtp_accounts
            .find_by_id(request.smtp_account_id)
            .await?
            .ok_or(DispatchError::SmtpNotFound)?;

        let instance = self
            .instances
            .find_by_id(request.messaging_instance_id)
            .await?
            .ok_or(DispatchError::WhatsAppNotFound)?;

        let email = match self.decrypt_password(request, &account) {
            Ok(password) => self.send_email(cancel, request, &recipients, &account, password).await?,
            Err(e) => match self.config.decryption_failure {
                DecryptionFailurePolicy::AbortRequest => return Err(e),
                DecryptionFailurePolicy::SkipEmail => {
                    tracing::warn!(error = %e, "Skipping email channel");
                    EmailOutcome {
                        failures: vec![Some(PASSWORD_UNAVAILABLE.to_string()); recipients.len()],
                        error: None,
                    }
                }
            },
        };

        let whatsapp = self.send_whatsapp(cancel, request, &recipients, &instance).await;

        self.write_logs(request, &recipients, &account, &instance, &email.failures, &whatsapp)
            .await;

        let result = DispatchResult {
            emails_failed: failed_recipients(&recipients, &email.failures),
            whatsapp_failed: failed_recipients(&recipients, &whatsapp),
            email_error: email.error,
        };

        let total = recipients.len();
        self.metrics
            .record_emails(total - result.emails_failed.len(), result.emails_failed.len());
        self.metrics
            .record_whatsapp(total - result.whatsapp_failed.len(), result.whatsapp_failed.len());

        tracing::info!(
            recipients = total,
            emails_failed = result.emails_failed.len(),
            whatsapp_failed = result.whatsapp_failed.len(),
            "Dispatch completed"
        );

        Ok(result)
    }

    fn decrypt_password(
        &self,
        request: &DispatchRequest,
        account: &SmtpAccount,
    ) -> Result<SecretString, DispatchError> {
        let keys = self.tokens.decrypt(&request.token)?;
        Ok(self
            .passwords
            .decrypt(&account.encrypted_password, &keys.smtp_key, &account.iv)?)
    }

    async fn send_email(
        &self,
        cancel: &CancellationToken,
        request: &DispatchRequest,
        recipients: &[Recipient],
        account: &SmtpAccount,
        password: SecretString,
    ) -> Result<EmailOutcome, DispatchError> {
        let mut failures: Outcomes = vec![None; recipients.len()];
        let mut owners: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut addresses = Vec::new();

        for (i, recipient) in recipients.iter().enumerate() {
            match recipient.email_address() {
                Some(address) => {
                    let owners = owners.entry(address).or_default();
                    if owners.is_empty() {
                        addresses.push(address.to_string());
                    }
                    owners.push(i);
                }
                None => failures[i] = Some(NO_EMAIL.to_string()),
            }
        }

        if addresses.is_empty() {
            tracing::debug!("No recipient has an email address, skipping batch");
            return Ok(EmailOutcome { failures, error: None });
        }

        let from = if request.from.trim().is_empty() {
            account.email.clone()
        } else {
            request.from.trim().to_string()
        };

        let settings = SmtpSettings::new(account.host.clone(), account.port, account.email.clone(), password)
            .with_connection(&self.config.smtp);
        let mut sender = EmailSender::new(settings).with_pool_factory(Arc::clone(&self.pool_factory));
        sender.set_data(MailerData {
            from,
            to: addresses,
            subject: request.subject.clone(),
            body: request.body.clone(),
            content_type: request.content_type,
            attachments: email_attachments(&request.attachments),
        });

        match sender.send_emails(&SendOptions::from(&self.config.email), cancel).await {
            Ok(()) => Ok(EmailOutcome { failures, error: None }),
            Err(MailerError::Undelivered(error)) => {
                for address in &error.to {
                    let reason = match error.cause(address) {
                        Some(FailureCause::Cancelled) => CANCELLED.to_string(),
                        Some(FailureCause::Rejected(why)) => format!("email undelivered after retry: {}", why),
                        None => "email undelivered after retry".to_string(),
                    };
                    for &i in owners.get(address.as_str()).into_iter().flatten() {
                        failures[i] = Some(reason.clone());
                    }
                }
                Ok(EmailOutcome {
                    failures,
                    error: Some(error),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn send_whatsapp(
        &self,
        cancel: &CancellationToken,
        request: &DispatchRequest,
        recipients: &[Recipient],
        instance: &MessagingInstance,
    ) -> Outcomes {
        let policy = RetryPolicy::from(&self.config.whatsapp);
        let mut outcomes = Vec::with_capacity(recipients.len());

        for recipient in recipients {
            if cancel.is_cancelled() {
                outcomes.push(Some(CANCELLED.to_string()));
                continue;
            }

            let outcome = tokio::select! {
                outcome = self.whatsapp_one(request, recipient, instance, &policy) => outcome,
                _ = cancel.cancelled() => Err(CANCELLED.to_string()),
            };

            if let Err(reason) = &outcome {
                tracing::warn!(recipient = %recipient.id, reason = %reason, "WhatsApp delivery failed");
            }
            outcomes.push(outcome.err());
        }

        outcomes
    }

    async fn whatsapp_one(
        &self,
        request: &DispatchRequest,
        recipient: &Recipient,
        instance: &MessagingInstance,
        policy: &RetryPolicy,
    ) -> Result<(), String> {
        let raw = recipient.phone_number().ok_or_else(|| NO_PHONE.to_string())?;
        let number = phone::normalize(raw, &self.config.whatsapp.default_country_code).map_err(|e| e.to_string())?;
        let instance_ref = instance.instance_ref.as_str();

        send_text_with_retry(self.gateway.as_ref(), instance_ref, &number, &request.body, policy)
            .await
            .map_err(|e| e.to_string())?;

        let mut first_error = None;
        for attachment in &request.attachments {
            if let Err(reason) = self.send_attachment(instance_ref, &number, attachment).await {
                first_error.get_or_insert(reason);
                if self.config.attachment_failure == AttachmentFailurePolicy::StopAtFirst {
                    break;
                }
            }
        }

        match first_error {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    async fn send_attachment(&self, instance: &str, number: &str, attachment: &Attachment) -> Result<(), String> {
        let result = if let Some(data) = attachment.inline_bytes() {
            self.gateway
                .send_media(instance, number, &attachment.file_name, data, "")
                .await
        } else if let Some(url) = attachment.remote_url() {
            self.gateway
                .send_media_url(instance, number, url, &attachment.file_name, "")
                .await
        } else {
            return Err(format!("attachment {} has no content", attachment.file_name));
        };

        result.map_err(|e| format!("attachment {}: {}", attachment.file_name, e))
    }

    async fn write_logs(
        &self,
        request: &DispatchRequest,
        recipients: &[Recipient],
        account: &SmtpAccount,
        instance: &MessagingInstance,
        email: &[Option<String>],
        whatsapp: &[Option<String>],
    ) {
        let attachment_names: Vec<String> = request.attachments.iter().map(|a| a.file_name.clone()).collect();
        let now = Utc::now();

        for (i, recipient) in recipients.iter().enumerate() {
            let entries = [
                (Channel::Email, &email[i], Some(account.id), None),
                (Channel::WhatsApp, &whatsapp[i], None, Some(instance.id)),
            ];
            for (channel, failure, smtp_account_id, messaging_instance_id) in entries {
                let entry = DeliveryLogEntry {
                    recipient_id: recipient.id,
                    channel,
                    success: failure.is_none(),
                    error_text: failure.clone(),
                    subject: request.subject.clone(),
                    body: request.body.clone(),
                    smtp_account_id,
                    messaging_instance_id,
                    attachment_names: attachment_names.clone(),
                    created_at: now,
                };
                if let Err(e) = self.delivery_log.save(&entry).await {
                    self.metrics.record_log_write_failure();
                    tracing::error!(
                        recipient = %recipient.id,
                        channel = %channel,
                        error = %e,
                        "Failed to save delivery log"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl MessageDispatcher for MessageService {
    async fn send(
        &self,
        cancel: &CancellationToken,
        request: DispatchRequest,
    ) -> Result<DispatchResult, DispatchError> {
        MessageService::send(self, cancel, request).await
    }
}

/// Inline attachments with content; URL-only entries are not mailed.
fn email_attachments(attachments: &[Attachment]) -> Vec<MailAttachment> {
    attachments
        .iter()
        .filter_map(|a| {
            a.inline_bytes().map(|data| MailAttachment {
                file_name: a.file_name.clone(),
                data: data.to_vec(),
            })
        })
        .collect()
}

fn failed_recipients(recipients: &[Recipient], outcomes: &[Option<String>]) -> Vec<Recipient> {
    recipients
        .iter()
        .zip(outcomes)
        .filter(|(_, failure)| failure.is_some())
        .map(|(r, _)| r.clone())
        .collect()
}

/// Builder for [`MessageService`].
#[derive(Default)]
pub struct MessageServiceBuilder {
    recipients: Option<Arc<dyn RecipientRepository>>,
    smtp_accounts: Option<Arc<dyn SmtpAccountRepository>>,
    instances: Option<Arc<dyn MessagingInstanceRepository>>,
    delivery_log: Option<Arc<dyn DeliveryLogRepository>>,
    tokens: Option<Arc<dyn TokenDecryptor>>,
    passwords: Option<Arc<dyn PasswordDecryptor>>,
    gateway: Option<Arc<dyn MessagingGateway>>,
    pool_factory: Option<Arc<dyn PoolFactory>>,
    config: Option<DispatchConfig>,
    metrics: Option<Arc<DispatchMetrics>>,
}

impl MessageServiceBuilder {
    /// Sets the recipient repository.
    pub fn recipients(mut self, repository: Arc<dyn RecipientRepository>) -> Self {
        self.recipients = Some(repository);
        self
    }

    /// Sets the SMTP account repository.
    pub fn smtp_accounts(mut self, repository: Arc<dyn SmtpAccountRepository>) -> Self {
        self.smtp_accounts = Some(repository);
        self
    }

    /// Sets the messaging instance repository.
    pub fn instances(mut self, repository: Arc<dyn MessagingInstanceRepository>) -> Self {
        self.instances = Some(repository);
        self
    }

    /// Sets the delivery log repository.
    pub fn delivery_log(mut self, repository: Arc<dyn DeliveryLogRepository>) -> Self {
        self.delivery_log = Some(repository);
        self
    }

    /// Sets the session token decryptor.
    pub fn token_decryptor(mut self, decryptor: Arc<dyn TokenDecryptor>) -> Self {
        self.tokens = Some(decryptor);
        self
    }

    /// Sets the SMTP password decryptor. Defaults to [`AesGcmPasswordCipher`].
    pub fn password_decryptor(mut self, decryptor: Arc<dyn PasswordDecryptor>) -> Self {
        self.passwords = Some(decryptor);
        self
    }

    /// Sets the messaging gateway. Defaults to an [`EvolutionClient`] built from
    /// the gateway configuration.
    pub fn gateway(mut self, gateway: Arc<dyn MessagingGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Sets the email pool factory. Defaults to [`SmtpPoolFactory`].
    pub fn pool_factory(mut self, factory: Arc<dyn PoolFactory>) -> Self {
        self.pool_factory = Some(factory);
        self
    }

    /// Sets the configuration.
    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Shares an existing metrics registry.
    pub fn metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the service.
    pub fn build(self) -> Result<MessageService, DispatchError> {
        fn required<T>(value: Option<T>, name: &str) -> Result<T, DispatchError> {
            value.ok_or_else(|| DispatchError::Configuration(format!("{} is required", name)))
        }

        let config = required(self.config, "config")?;
        config.validate()?;

        let gateway = match self.gateway {
            Some(gateway) => gateway,
            None => Arc::new(
                EvolutionClient::new(&config.gateway).map_err(|e| DispatchError::Configuration(e.to_string()))?,
            ),
        };

        Ok(MessageService {
            recipients: required(self.recipients, "recipient repository")?,
            smtp_accounts: required(self.smtp_accounts, "smtp account repository")?,
            instances: required(self.instances, "messaging instance repository")?,
            delivery_log: required(self.delivery_log, "delivery log repository")?,
            tokens: required(self.tokens, "token decryptor")?,
            passwords: self.passwords.unwrap_or_else(|| Arc::new(AesGcmPasswordCipher::new())),
            gateway,
            pool_factory: self.pool_factory.unwrap_or_else(|| Arc::new(SmtpPoolFactory)),
            config,
            metrics: self.metrics.unwrap_or_default(),
        })
    }
}
