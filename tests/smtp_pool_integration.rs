//! Pooled SMTP sender against a scripted loopback server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use unicast_dispatch::smtp::{MailAttachment, OutgoingEmail};
use unicast_dispatch::{EmailPool, SmtpErrorKind, SmtpPool, SmtpSettings, TlsMode};

/// Minimal ESMTP server that accepts everything except addresses containing
/// "rejected", recording every command line it sees.
struct ScriptedServer {
    port: u16,
    transcript: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

impl ScriptedServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let transcript = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let log = transcript.clone();
        let count = connections.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket, log.clone()));
            }
        });

        Self {
            port,
            transcript,
            connections,
        }
    }

    fn settings(&self, username: &str) -> SmtpSettings {
        SmtpSettings::new("127.0.0.1", self.port, username, SecretString::new("secret".into()))
            .with_tls_mode(TlsMode::None)
    }

    fn lines(&self) -> Vec<String> {
        self.transcript.lock().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.lines().iter().filter(|l| l.starts_with(prefix)).count()
    }
}

async fn serve(socket: tokio::net::TcpStream, log: Arc<Mutex<Vec<String>>>) {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    if writer.write_all(b"220 mail.test ESMTP ready\r\n").await.is_err() {
        return;
    }

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = line.trim_end().to_string();
        log.lock().push(command.clone());
        let upper = command.to_uppercase();

        let reply: &[u8] = if upper.starts_with("EHLO") {
            b"250-mail.test greets you\r\n250-AUTH PLAIN LOGIN\r\n250 8BITMIME\r\n"
        } else if upper.starts_with("AUTH") {
            b"235 2.7.0 Authentication successful\r\n"
        } else if upper.starts_with("RCPT") && upper.contains("REJECTED") {
            b"550 5.1.1 No such user\r\n"
        } else if upper.starts_with("DATA") {
            if writer.write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n").await.is_err() {
                return;
            }
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                let content = line.trim_end();
                if content == "." {
                    break;
                }
                log.lock().push(format!("> {}", content));
            }
            b"250 2.0.0 Queued\r\n"
        } else if upper.starts_with("QUIT") {
            let _ = writer.write_all(b"221 Bye\r\n").await;
            return;
        } else {
            b"250 OK\r\n"
        };

        if writer.write_all(reply).await.is_err() {
            return;
        }
    }
}

fn email(to: &[&str]) -> OutgoingEmail {
    OutgoingEmail {
        from: "school@example.com".into(),
        to: to.iter().map(|a| a.to_string()).collect(),
        subject: "Parent meeting".into(),
        body: "The meeting is on Friday.".into(),
        content_type: Default::default(),
        attachments: Arc::from(Vec::new()),
    }
}

const DEADLINE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_group_delivered_in_one_transaction() {
    let server = ScriptedServer::start().await;
    let pool = SmtpPool::new(server.settings("school@example.com"), 2).unwrap();

    pool.send(&email(&["a@example.com", "b@example.com", "c@example.com"]), DEADLINE)
        .await
        .unwrap();

    let lines = server.lines();
    assert!(lines.iter().any(|l| l.starts_with("AUTH PLAIN ")));
    assert!(lines.iter().any(|l| l.starts_with("MAIL FROM:<school@example.com>")));
    assert_eq!(server.count("RCPT TO:"), 3);
    assert_eq!(server.count("DATA"), 1);
    assert!(lines.iter().any(|l| l == "> Subject: Parent meeting"));
    assert!(lines.iter().any(|l| l == "> To: a@example.com, b@example.com, c@example.com"));
}

#[tokio::test]
async fn test_connection_reused_between_sends() {
    let server = ScriptedServer::start().await;
    let pool = SmtpPool::new(server.settings("school@example.com"), 1).unwrap();

    for address in ["a@example.com", "b@example.com", "c@example.com"] {
        pool.send(&email(&[address]), DEADLINE).await.unwrap();
    }

    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
    assert_eq!(server.count("EHLO"), 1);
    assert_eq!(server.count("DATA"), 3);
    // every reuse is preceded by a health check
    assert_eq!(server.count("NOOP"), 2);
}

#[tokio::test]
async fn test_close_says_quit_on_idle_sessions() {
    let server = ScriptedServer::start().await;
    let pool = SmtpPool::new(server.settings("school@example.com"), 2).unwrap();

    pool.send(&email(&["a@example.com"]), DEADLINE).await.unwrap();
    pool.close().await;

    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
    assert_eq!(server.count("QUIT"), 1);

    let err = pool.send(&email(&["b@example.com"]), DEADLINE).await.unwrap_err();
    assert_eq!(err.kind(), SmtpErrorKind::PoolExhausted);
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejected_recipient_resets_transaction() {
    let server = ScriptedServer::start().await;
    let pool = SmtpPool::new(server.settings("school@example.com"), 1).unwrap();

    let err = pool
        .send(&email(&["a@example.com", "rejected@example.com"]), DEADLINE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), SmtpErrorKind::InvalidRecipientAddress);
    assert_eq!(server.count("RSET"), 1);
    assert_eq!(server.count("DATA"), 0);

    pool.send(&email(&["a@example.com"]), DEADLINE).await.unwrap();
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
    assert_eq!(server.count("DATA"), 1);
}

#[tokio::test]
async fn test_anonymous_session_skips_auth() {
    let server = ScriptedServer::start().await;
    let pool = SmtpPool::new(server.settings(""), 1).unwrap();

    pool.send(&email(&["a@example.com"]), DEADLINE).await.unwrap();

    assert_eq!(server.count("AUTH"), 0);
    assert_eq!(server.count("DATA"), 1);
}

#[tokio::test]
async fn test_attachment_sent_as_multipart() {
    let server = ScriptedServer::start().await;
    let pool = SmtpPool::new(server.settings("school@example.com"), 1).unwrap();

    let mut message = email(&["a@example.com"]);
    message.attachments = Arc::from(vec![MailAttachment {
        file_name: "boletim.pdf".into(),
        data: b"%PDF-1.4".to_vec(),
    }]);
    pool.send(&message, DEADLINE).await.unwrap();

    let lines = server.lines();
    assert!(lines
        .iter()
        .any(|l| l.starts_with("> Content-Type: multipart/mixed; boundary=")));
    assert!(lines.iter().any(|l| l.contains("boletim.pdf")));
}

#[tokio::test]
async fn test_unreachable_server_refused() {
    // bind then drop to get a port nobody listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let settings = SmtpSettings::new("127.0.0.1", port, "", SecretString::new("x".into()))
        .with_tls_mode(TlsMode::None);
    let pool = SmtpPool::new(settings, 1).unwrap();

    let err = pool.send(&email(&["a@example.com"]), DEADLINE).await.unwrap_err();
    assert_eq!(err.kind(), SmtpErrorKind::ConnectionRefused);
}
