//! Dispatch orchestrator scenarios.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{AttachmentFailurePolicy, DecryptionFailurePolicy, DispatchConfig, DispatchConfigBuilder};
use crate::dispatch::MessageService;
use crate::errors::DispatchErrorKind;
use crate::mocks::fixtures::{dispatch_request, messaging_instance, recipient, recipients, smtp_account};
use crate::mocks::{
    failing_pool_factory, GatewayCall, InMemoryDeliveryLog, InMemoryDirectory, MockEmailPool, MockGateway,
    MockPasswordDecryptor, MockPoolFactory, MockTokenDecryptor,
};
use crate::types::{Attachment, Channel, DispatchRequest, MessagingInstance, Recipient, SmtpAccount};

struct Harness {
    service: MessageService,
    factory: Arc<MockPoolFactory>,
    pool: Arc<MockEmailPool>,
    gateway: Arc<MockGateway>,
    log: Arc<InMemoryDeliveryLog>,
    account: SmtpAccount,
    instance: MessagingInstance,
}

impl Harness {
    fn request(&self, recipients: &[Recipient]) -> DispatchRequest {
        dispatch_request(recipients, &self.account, &self.instance)
    }
}

fn config(configure: impl FnOnce(DispatchConfigBuilder) -> DispatchConfigBuilder) -> DispatchConfig {
    configure(
        DispatchConfig::builder()
            .gateway_url("http://localhost:8080")
            .api_key("test-key")
            .text_retry_delay(Duration::from_millis(5)),
    )
    .build()
    .unwrap()
}

struct Setup {
    recipients: Vec<Recipient>,
    pool: MockEmailPool,
    gateway: MockGateway,
    log: InMemoryDeliveryLog,
    config: DispatchConfig,
}

impl Setup {
    fn new(recipients: Vec<Recipient>) -> Self {
        Self {
            recipients,
            pool: MockEmailPool::new(),
            gateway: MockGateway::new(),
            log: InMemoryDeliveryLog::new(),
            config: config(|b| b),
        }
    }

    fn build(self) -> Harness {
        self.build_with(|b| b)
    }

    fn build_with(
        self,
        customize: impl FnOnce(crate::dispatch::MessageServiceBuilder) -> crate::dispatch::MessageServiceBuilder,
    ) -> Harness {
        let account = smtp_account();
        let instance = messaging_instance();
        let directory = Arc::new(
            InMemoryDirectory::new()
                .with_recipients(self.recipients)
                .with_smtp_account(account.clone())
                .with_instance(instance.clone()),
        );
        let pool = Arc::new(self.pool);
        let factory = Arc::new(MockPoolFactory::new(pool.clone()));
        let gateway = Arc::new(self.gateway);
        let log = Arc::new(self.log);

        let builder = MessageService::builder()
            .config(self.config)
            .recipients(directory.clone())
            .smtp_accounts(directory.clone())
            .instances(directory)
            .delivery_log(log.clone())
            .token_decryptor(Arc::new(MockTokenDecryptor::returning(vec![7u8; 32])))
            .password_decryptor(Arc::new(MockPasswordDecryptor::returning("smtp-password")))
            .gateway(gateway.clone())
            .pool_factory(factory.clone());

        Harness {
            service: customize(builder).build().unwrap(),
            factory,
            pool,
            gateway,
            log,
            account,
            instance,
        }
    }
}

fn ids(recipients: &[Recipient]) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = recipients.iter().map(|r| r.id).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_every_recipient_reached() {
    let students = recipients(25);
    let h = Setup::new(students.clone()).build();

    let result = h
        .service
        .send(&CancellationToken::new(), h.request(&students))
        .await
        .unwrap();

    assert!(result.is_complete_success());
    assert!(result.email_error.is_none());
    assert_eq!(h.pool.delivered_addresses().len(), 25);
    assert_eq!(h.gateway.texts_delivered().len(), 25);
    assert_eq!(h.log.entries().len(), 50);
    assert!(h.log.entries().iter().all(|e| e.success && e.error_text.is_none()));

    let metrics = h.service.metrics().snapshot();
    assert_eq!(metrics.requests, 1);
    assert_eq!(metrics.emails_delivered, 25);
    assert_eq!(metrics.whatsapp_delivered, 25);
}

#[tokio::test]
async fn test_missing_contact_fails_only_that_channel() {
    let a = recipient("A", Some("a@example.com"), None);
    let b = recipient("B", None, Some("11 98765-4321"));
    let c = recipient("C", None, None);
    let students = vec![a.clone(), b.clone(), c.clone()];
    let h = Setup::new(students.clone()).build();

    let result = h
        .service
        .send(&CancellationToken::new(), h.request(&students))
        .await
        .unwrap();

    assert_eq!(ids(&result.emails_failed), ids(&[b.clone(), c.clone()]));
    assert_eq!(ids(&result.whatsapp_failed), ids(&[a.clone(), c.clone()]));
    assert!(result.email_error.is_none());

    assert_eq!(h.pool.delivered_addresses(), vec!["a@example.com".to_string()]);
    assert_eq!(h.gateway.total_calls(), 1);
    assert_eq!(h.gateway.calls_to("+5511987654321").len(), 1);
}

#[tokio::test]
async fn test_missing_phone_makes_no_gateway_call() {
    let students = vec![recipient("A", Some("a@example.com"), None)];
    let h = Setup::new(students.clone()).build();

    let result = h
        .service
        .send(&CancellationToken::new(), h.request(&students))
        .await
        .unwrap();

    assert_eq!(result.whatsapp_failed.len(), 1);
    assert_eq!(h.gateway.total_calls(), 0);
    let whatsapp_log = h
        .log
        .entries()
        .into_iter()
        .find(|e| e.channel == Channel::WhatsApp)
        .unwrap();
    assert!(!whatsapp_log.success);
    assert_eq!(whatsapp_log.error_text.as_deref(), Some("recipient has no phone number"));
}

#[tokio::test]
async fn test_short_phone_never_reaches_gateway() {
    let students = vec![recipient("A", Some("a@example.com"), Some("(11) 4321"))];
    let h = Setup::new(students.clone()).build();

    let result = h
        .service
        .send(&CancellationToken::new(), h.request(&students))
        .await
        .unwrap();

    assert_eq!(result.whatsapp_failed.len(), 1);
    assert!(result.emails_failed.is_empty());
    assert_eq!(h.gateway.total_calls(), 0);
}

#[tokio::test]
async fn test_text_retried_before_failing_recipient() {
    let students = vec![
        recipient("A", None, Some("11 91111-1111")),
        recipient("B", None, Some("11 92222-2222")),
    ];
    let mut setup = Setup::new(students.clone());
    setup.gateway = MockGateway::new().fail_number("+5511911111111");
    let h = setup.build();

    let result = h
        .service
        .send(&CancellationToken::new(), h.request(&students))
        .await
        .unwrap();

    assert_eq!(ids(&result.whatsapp_failed), ids(&students[..1]));
    assert_eq!(h.gateway.calls_to("+5511911111111").len(), 3);
    assert_eq!(h.gateway.calls_to("+5511922222222").len(), 1);
}

#[tokio::test]
async fn test_transient_text_failure_recovers() {
    let students = vec![recipient("A", None, Some("11 91111-1111"))];
    let mut setup = Setup::new(students.clone());
    setup.gateway = MockGateway::new().fail_text_times(2);
    let h = setup.build();

    let result = h
        .service
        .send(&CancellationToken::new(), h.request(&students))
        .await
        .unwrap();

    assert!(result.whatsapp_failed.is_empty());
    assert_eq!(h.gateway.text_calls(), 3);
}

#[tokio::test]
async fn test_email_failures_mapped_to_recipients() {
    let a = recipient("A", Some("a@example.com"), None);
    let b = recipient("B", Some(" b@example.com "), None);
    let students = vec![a, b.clone()];
    let mut setup = Setup::new(students.clone());
    setup.pool = MockEmailPool::new().fail_addresses(["b@example.com"]);
    let h = setup.build();

    let result = h
        .service
        .send(&CancellationToken::new(), h.request(&students))
        .await
        .unwrap();

    assert_eq!(ids(&result.emails_failed), ids(&[b]));
    let error = result.email_error.unwrap();
    assert_eq!(error.to, vec!["b@example.com".to_string()]);
    assert_eq!(h.pool.delivered_addresses(), vec!["a@example.com".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_address_keeps_its_reason_when_batch_is_cancelled() {
    let a = recipient("A", Some("a@example.com"), None);
    let b = recipient("B", Some("b@example.com"), None);
    let c = recipient("C", Some("c@example.com"), None);
    let students = vec![a, b.clone(), c.clone()];
    let mut setup = Setup::new(students.clone());
    setup.config = config(|builder| builder.send_workers(1).retry_workers(1).group_size(3));
    setup.pool = MockEmailPool::new()
        .fail_addresses(["b@example.com", "c@example.com"])
        .with_latency(Duration::from_secs(1));
    let h = setup.build();

    // group fails at 1s, a retried by 2s, b rejected at 3s, c interrupted
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(3500)).await;
        trigger.cancel();
    });

    let result = h.service.send(&cancel, h.request(&students)).await.unwrap();

    assert_eq!(ids(&result.emails_failed), ids(&[b.clone(), c.clone()]));
    let reason = |id| {
        h.log
            .entries()
            .into_iter()
            .find(|e| e.channel == Channel::Email && e.recipient_id == id)
            .and_then(|e| e.error_text)
    };
    let rejected = reason(b.id).unwrap();
    assert!(rejected.starts_with("email undelivered after retry: "), "{}", rejected);
    assert!(rejected.contains("mock send failure"), "{}", rejected);
    assert_eq!(reason(c.id).as_deref(), Some("dispatch cancelled"));
}

#[tokio::test]
async fn test_shared_address_sent_once_and_fails_every_owner() {
    let a = recipient("A", Some("family@example.com"), None);
    let b = recipient("B", Some("family@example.com"), None);
    let students = vec![a, b];
    let mut setup = Setup::new(students.clone());
    setup.pool = MockEmailPool::new().fail_always();
    let h = setup.build();

    let result = h
        .service
        .send(&CancellationToken::new(), h.request(&students))
        .await
        .unwrap();

    assert_eq!(ids(&result.emails_failed), ids(&students));
    assert_eq!(result.email_error.unwrap().to, vec!["family@example.com".to_string()]);
    // one group send, one retry
    assert_eq!(h.pool.calls(), 2);
}

#[tokio::test]
async fn test_sender_settings_from_account() {
    let students = recipients(3);
    let h = Setup::new(students.clone()).build();
    let mut request = h.request(&students);
    request.from = "  ".into();

    h.service.send(&CancellationToken::new(), request).await.unwrap();

    let settings = h.factory.last_settings().unwrap();
    assert_eq!(settings.host, h.account.host);
    assert_eq!(settings.port, h.account.port);
    assert_eq!(settings.username, h.account.email);
    assert_eq!(settings.password.expose_secret(), "smtp-password");
    assert_eq!(h.factory.last_size(), Some(8));
    assert_eq!(h.pool.sent()[0].from, h.account.email);
}

#[tokio::test]
async fn test_unknown_recipients_abort_request() {
    let h = Setup::new(Vec::new()).build();
    let request = h.request(&recipients(2));

    let err = h.service.send(&CancellationToken::new(), request).await.unwrap_err();

    assert_eq!(err.kind(), DispatchErrorKind::RecipientsNotFound);
    assert_eq!(err.http_status(), 404);
    assert!(err.to_string().starts_with("send: "));
    assert_eq!(h.factory.created(), 0);
    assert_eq!(h.gateway.total_calls(), 0);
    assert!(h.log.entries().is_empty());
    assert_eq!(h.service.metrics().snapshot().requests_rejected, 1);
}

#[tokio::test]
async fn test_unknown_credentials_abort_request() {
    let students = recipients(2);
    let h = Setup::new(students.clone()).build();

    let mut request = h.request(&students);
    request.smtp_account_id = Uuid::new_v4();
    let err = h.service.send(&CancellationToken::new(), request).await.unwrap_err();
    assert_eq!(err.kind(), DispatchErrorKind::SmtpNotFound);

    let mut request = h.request(&students);
    request.messaging_instance_id = Uuid::new_v4();
    let err = h.service.send(&CancellationToken::new(), request).await.unwrap_err();
    assert_eq!(err.kind(), DispatchErrorKind::WhatsAppNotFound);

    assert_eq!(h.gateway.total_calls(), 0);
    assert_eq!(h.pool.calls(), 0);
}

#[tokio::test]
async fn test_repository_failure_is_fatal() {
    let account = smtp_account();
    let instance = messaging_instance();
    let directory = Arc::new(InMemoryDirectory::new().unavailable());
    let service = MessageService::builder()
        .config(config(|b| b))
        .recipients(directory.clone())
        .smtp_accounts(directory.clone())
        .instances(directory)
        .delivery_log(Arc::new(InMemoryDeliveryLog::new()))
        .token_decryptor(Arc::new(MockTokenDecryptor::returning(vec![7u8; 32])))
        .gateway(Arc::new(MockGateway::new()))
        .build()
        .unwrap();

    let err = service
        .send(&CancellationToken::new(), dispatch_request(&recipients(1), &account, &instance))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), DispatchErrorKind::Repository);
    assert_eq!(err.http_status(), 500);
}

#[tokio::test]
async fn test_decryption_failure_aborts_by_default() {
    let students = recipients(2);
    let h = Setup::new(students.clone())
        .build_with(|b| b.password_decryptor(Arc::new(MockPasswordDecryptor::failing())));

    let err = h
        .service
        .send(&CancellationToken::new(), h.request(&students))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), DispatchErrorKind::Decryption);
    assert_eq!(err.http_status(), 401);
    assert_eq!(h.gateway.total_calls(), 0);
    assert_eq!(h.factory.created(), 0);
}

#[tokio::test]
async fn test_invalid_token_aborts_request() {
    let students = recipients(1);
    let h = Setup::new(students.clone())
        .build_with(|b| b.token_decryptor(Arc::new(MockTokenDecryptor::failing())));

    let err = h
        .service
        .send(&CancellationToken::new(), h.request(&students))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), DispatchErrorKind::Decryption);
}

#[tokio::test]
async fn test_decryption_failure_can_skip_email() {
    let students = recipients(3);
    let mut setup = Setup::new(students.clone());
    setup.config = config(|b| b.decryption_failure(DecryptionFailurePolicy::SkipEmail));
    let h = setup.build_with(|b| b.password_decryptor(Arc::new(MockPasswordDecryptor::failing())));

    let result = h
        .service
        .send(&CancellationToken::new(), h.request(&students))
        .await
        .unwrap();

    assert_eq!(result.emails_failed.len(), 3);
    assert!(result.whatsapp_failed.is_empty());
    assert!(result.email_error.is_none());
    assert_eq!(h.factory.created(), 0);
    assert_eq!(h.gateway.texts_delivered().len(), 3);
}

#[tokio::test]
async fn test_pool_construction_failure_is_fatal() {
    let students = recipients(2);
    let h = Setup::new(students.clone()).build_with(|b| b.pool_factory(failing_pool_factory()));

    let err = h
        .service
        .send(&CancellationToken::new(), h.request(&students))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), DispatchErrorKind::Mailer);
    assert_eq!(h.gateway.total_calls(), 0);
}

#[tokio::test]
async fn test_empty_subject_is_invalid_request() {
    let students = recipients(1);
    let h = Setup::new(students.clone()).build();
    let mut request = h.request(&students);
    request.subject = String::new();

    let err = h.service.send(&CancellationToken::new(), request).await.unwrap_err();
    assert_eq!(err.kind(), DispatchErrorKind::InvalidRequest);
    assert_eq!(err.http_status(), 400);
}

#[tokio::test]
async fn test_attachments_routed_per_channel() {
    let students = vec![recipient("A", Some("a@example.com"), Some("11 91111-1111"))];
    let h = Setup::new(students.clone()).build();
    let mut request = h.request(&students);
    request.attachments = vec![
        Attachment::inline("boletim.pdf", b"%PDF-1.4".to_vec()),
        Attachment::remote("foto.png", "https://files.example.com/foto.png"),
    ];

    let result = h.service.send(&CancellationToken::new(), request).await.unwrap();

    assert!(result.is_complete_success());
    let sent = h.pool.sent();
    assert_eq!(sent[0].attachments.len(), 1);
    assert_eq!(sent[0].attachments[0].file_name, "boletim.pdf");

    let calls: Vec<GatewayCall> = h.gateway.calls().into_iter().map(|(call, _)| call).collect();
    assert_eq!(calls.len(), 3);
    assert!(matches!(&calls[0], GatewayCall::Text { text, .. } if text == "The meeting is on Friday."));
    assert!(matches!(&calls[1], GatewayCall::Media { file_name, size: 8, .. } if file_name == "boletim.pdf"));
    assert!(matches!(&calls[2], GatewayCall::MediaUrl { url, .. } if url == "https://files.example.com/foto.png"));

    let log = h.log.entries();
    assert!(log.iter().all(|e| e.attachment_names == vec!["boletim.pdf", "foto.png"]));
}

#[tokio::test]
async fn test_empty_inline_payload_falls_back_to_url() {
    let students = vec![recipient("A", Some("a@example.com"), Some("11 91111-1111"))];
    let h = Setup::new(students.clone()).build();
    let mut request = h.request(&students);
    request.attachments = vec![Attachment {
        file_name: "foto.png".into(),
        data: Some(Vec::new()),
        url: Some("https://files.example.com/foto.png".into()),
    }];

    let result = h.service.send(&CancellationToken::new(), request).await.unwrap();

    assert!(result.is_complete_success());
    assert!(h.pool.sent()[0].attachments.is_empty());

    let calls: Vec<GatewayCall> = h.gateway.calls().into_iter().map(|(call, _)| call).collect();
    assert_eq!(calls.len(), 2);
    assert!(matches!(&calls[0], GatewayCall::Text { .. }));
    assert!(matches!(
        &calls[1],
        GatewayCall::MediaUrl { url, file_name, .. }
            if url == "https://files.example.com/foto.png" && file_name == "foto.png"
    ));
}

fn attachment_without_content() -> Attachment {
    Attachment {
        file_name: "empty.txt".into(),
        data: Some(Vec::new()),
        url: None,
    }
}

#[tokio::test]
async fn test_attachment_failure_stops_at_first_by_default() {
    let students = vec![recipient("A", None, Some("11 91111-1111"))];
    let h = Setup::new(students.clone()).build();
    let mut request = h.request(&students);
    request.attachments = vec![
        attachment_without_content(),
        Attachment::inline("boletim.pdf", b"%PDF".to_vec()),
    ];

    let result = h.service.send(&CancellationToken::new(), request).await.unwrap();

    assert_eq!(result.whatsapp_failed.len(), 1);
    assert_eq!(h.gateway.total_calls(), 1);
    let entry = h.log.entries().into_iter().find(|e| e.channel == Channel::WhatsApp).unwrap();
    assert_eq!(entry.error_text.as_deref(), Some("attachment empty.txt has no content"));
}

#[tokio::test]
async fn test_attachment_failure_can_attempt_all() {
    let students = vec![recipient("A", None, Some("11 91111-1111"))];
    let mut setup = Setup::new(students.clone());
    setup.config = config(|b| b.attachment_failure(AttachmentFailurePolicy::AttemptAll));
    let h = setup.build();
    let mut request = h.request(&students);
    request.attachments = vec![
        attachment_without_content(),
        Attachment::inline("boletim.pdf", b"%PDF".to_vec()),
    ];

    let result = h.service.send(&CancellationToken::new(), request).await.unwrap();

    assert_eq!(result.whatsapp_failed.len(), 1);
    assert_eq!(h.gateway.total_calls(), 2);
}

#[tokio::test]
async fn test_rejected_media_fails_only_that_recipient() {
    let students = vec![
        recipient("A", None, Some("11 91111-1111")),
        recipient("B", None, Some("11 92222-2222")),
    ];
    let mut setup = Setup::new(students.clone());
    setup.gateway = MockGateway::new().fail_media("foto.png");
    let h = setup.build();
    let mut request = h.request(&students);
    request.attachments = vec![Attachment::remote("foto.png", "https://files.example.com/foto.png")];

    let result = h.service.send(&CancellationToken::new(), request).await.unwrap();

    assert_eq!(result.whatsapp_failed.len(), 2);
    assert_eq!(h.gateway.texts_delivered().len(), 2);
    let errors: Vec<String> = h
        .log
        .entries()
        .into_iter()
        .filter(|e| e.channel == Channel::WhatsApp)
        .filter_map(|e| e.error_text)
        .collect();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.starts_with("attachment foto.png:")));
}

#[tokio::test]
async fn test_log_write_failures_do_not_fail_request() {
    let students = recipients(4);
    let mut setup = Setup::new(students.clone());
    setup.log = InMemoryDeliveryLog::failing();
    let h = setup.build();

    let result = h
        .service
        .send(&CancellationToken::new(), h.request(&students))
        .await
        .unwrap();

    assert!(result.is_complete_success());
    assert_eq!(h.service.metrics().snapshot().log_write_failures, 8);
}

#[tokio::test]
async fn test_cancelled_request_reports_everyone_failed() {
    let students = recipients(5);
    let h = Setup::new(students.clone()).build();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = h.service.send(&cancel, h.request(&students)).await.unwrap();

    assert_eq!(result.emails_failed.len(), 5);
    assert_eq!(result.whatsapp_failed.len(), 5);
    assert_eq!(h.pool.calls(), 0);
    assert_eq!(h.gateway.total_calls(), 0);
    assert!(h
        .log
        .entries()
        .iter()
        .all(|e| e.error_text.as_deref() == Some("dispatch cancelled")));
}

#[tokio::test]
async fn test_log_rows_reference_channel_credentials() {
    let students = recipients(1);
    let h = Setup::new(students.clone()).build();

    h.service
        .send(&CancellationToken::new(), h.request(&students))
        .await
        .unwrap();

    let entries = h.log.entries();
    let email = entries.iter().find(|e| e.channel == Channel::Email).unwrap();
    let whatsapp = entries.iter().find(|e| e.channel == Channel::WhatsApp).unwrap();
    assert_eq!(email.smtp_account_id, Some(h.account.id));
    assert_eq!(email.messaging_instance_id, None);
    assert_eq!(whatsapp.messaging_instance_id, Some(h.instance.id));
    assert_eq!(whatsapp.smtp_account_id, None);
    assert_eq!(email.subject, "Parent meeting");
}
