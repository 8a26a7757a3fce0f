//! TCP transport with optional TLS.
//!
//! A [`TcpTransport`] owns one server connection. [`TcpTransport::establish`]
//! runs the session setup (greeting, EHLO, STARTTLS, AUTH) and
//! [`TcpTransport::send_mail`] runs one MAIL/RCPT/DATA transaction.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::smtp::auth::{self, AuthMethod};
use crate::smtp::mime::{prepare_data_content, MimeEncoder};
use crate::smtp::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};
use crate::smtp::{OutgoingEmail, SmtpSettings, TlsMode};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

enum TransportStream {
    Plain(BufReader<TcpStream>),
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
    /// Placeholder while the stream is moved during the TLS upgrade.
    Closed,
}

/// One SMTP connection.
pub struct TcpTransport {
    stream: TransportStream,
    command_timeout: Duration,
    state: TransactionState,
    capabilities: EsmtpCapabilities,
    host: String,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("host", &self.host)
            .field("tls", &self.is_tls())
            .field("state", &self.state)
            .finish()
    }
}

impl TcpTransport {
    /// Connects and reads the server greeting. Implicit TLS is negotiated first.
    pub async fn connect(settings: &SmtpSettings) -> SmtpResult<Self> {
        let address = settings.address();

        let stream = timeout(settings.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| SmtpError::timeout(SmtpErrorKind::ConnectTimeout, "Connect timed out"))?
            .map_err(|e| Self::map_io_error(e, &address))?;
        stream.set_nodelay(true).ok();

        let mut transport = Self {
            stream: TransportStream::Plain(BufReader::new(stream)),
            command_timeout: settings.command_timeout,
            state: TransactionState::Connected,
            capabilities: EsmtpCapabilities::default(),
            host: settings.host.clone(),
        };

        if settings.tls_mode == TlsMode::Implicit {
            transport.upgrade_tls().await?;
        }

        let greeting = transport.read_response().await?;
        if greeting.code != codes::SERVICE_READY {
            return Err(greeting.to_error());
        }

        Ok(transport)
    }

    /// Connects and sets up a ready-to-send session.
    pub async fn establish(settings: &SmtpSettings) -> SmtpResult<Self> {
        let mut transport = Self::connect(settings).await?;
        transport.setup_session(settings).await?;
        Ok(transport)
    }

    /// EHLO (HELO fallback), STARTTLS per the TLS mode, then AUTH.
    async fn setup_session(&mut self, settings: &SmtpSettings) -> SmtpResult<()> {
        self.greet(&settings.client_id).await?;

        if !self.is_tls() {
            match settings.tls_mode {
                TlsMode::StartTls | TlsMode::StartTlsRequired if self.capabilities.starttls => {
                    let response = self.send_command(&SmtpCommand::StartTls).await?;
                    if response.is_success() {
                        self.upgrade_tls().await?;
                        self.greet(&settings.client_id).await?;
                    } else if settings.tls_mode == TlsMode::StartTlsRequired {
                        return Err(response.to_error());
                    }
                }
                TlsMode::StartTlsRequired => {
                    return Err(SmtpError::new(
                        SmtpErrorKind::StarttlsNotSupported,
                        "Server does not support STARTTLS",
                    ));
                }
                _ => {}
            }
        }

        if settings.has_credentials() {
            self.authenticate(&settings.username, settings.password.expose_secret())
                .await?;
        }

        self.state = TransactionState::Ready;
        Ok(())
    }

    async fn greet(&mut self, client_id: &str) -> SmtpResult<()> {
        let response = self.send_command(&SmtpCommand::Ehlo(client_id.to_string())).await?;
        if response.is_success() {
            self.capabilities = EsmtpCapabilities::from_ehlo_response(&response);
            return Ok(());
        }

        let response = self.send_command(&SmtpCommand::Helo(client_id.to_string())).await?;
        if !response.is_success() {
            return Err(response.to_error());
        }
        self.capabilities = EsmtpCapabilities::default();
        Ok(())
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> SmtpResult<()> {
        let method = AuthMethod::select(&self.capabilities.auth_mechanisms)?;

        match method {
            AuthMethod::Plain => {
                let command = SmtpCommand::Auth {
                    mechanism: method.name().to_string(),
                    initial_response: Some(auth::plain_initial_response(username, password)),
                };
                let response = self.send_command(&command).await?;
                Self::expect_code(&response, codes::AUTH_SUCCESS)
            }
            AuthMethod::Login => {
                let command = SmtpCommand::Auth {
                    mechanism: method.name().to_string(),
                    initial_response: None,
                };
                let response = self.send_command(&command).await?;
                Self::expect_code(&response, codes::AUTH_CONTINUE)?;

                let response = self.send_line(&auth::login_step(username)).await?;
                Self::expect_code(&response, codes::AUTH_CONTINUE)?;

                let response = self.send_line(&auth::login_step(password)).await?;
                Self::expect_code(&response, codes::AUTH_SUCCESS)
            }
        }
    }

    /// Sends one message to every address in `email.to`.
    ///
    /// Any rejected recipient aborts the transaction with RSET so the caller
    /// can retry addresses individually.
    pub async fn send_mail(&mut self, email: &OutgoingEmail, encoder: &MimeEncoder) -> SmtpResult<()> {
        if self.state != TransactionState::Ready {
            return Err(SmtpError::new(
                SmtpErrorKind::ConnectionUnhealthy,
                format!("Connection not ready for a transaction ({:?})", self.state),
            ));
        }

        let content = encoder.encode(email)?;
        let data = prepare_data_content(&content);

        if let Some(limit) = self.capabilities.size {
            if content.len() > limit {
                return Err(SmtpError::new(
                    SmtpErrorKind::MessageTooLarge,
                    format!("Message of {} bytes exceeds server limit of {}", content.len(), limit),
                ));
            }
        }

        self.state = TransactionState::InTransaction;

        let mail_from = SmtpCommand::MailFrom {
            address: email.from.clone(),
            size: self.capabilities.size.map(|_| content.len()),
            body_8bit: self.capabilities.eight_bit_mime,
        };
        let response = self.send_command(&mail_from).await?;
        if !response.is_success() {
            self.reset().await;
            return Err(response.to_error());
        }

        for address in &email.to {
            let response = self.send_command(&SmtpCommand::RcptTo(address.clone())).await?;
            if !response.is_success() {
                self.reset().await;
                return Err(SmtpError::from_smtp_response(
                    response.code,
                    format!("Recipient {} rejected: {}", address, response.full_message()),
                ));
            }
        }

        let response = self.send_command(&SmtpCommand::Data).await?;
        if response.code != codes::START_MAIL_INPUT {
            self.reset().await;
            return Err(response.to_error());
        }

        self.write(&data).await?;
        let response = self.read_response().await?;
        if !response.is_success() {
            return Err(response.to_error());
        }

        self.state = TransactionState::Ready;
        Ok(())
    }

    /// RSET; the connection only becomes reusable if the server accepts it.
    async fn reset(&mut self) {
        if let Ok(response) = self.send_command(&SmtpCommand::Rset).await {
            if response.is_success() {
                self.state = TransactionState::Ready;
            }
        }
    }

    /// Sends NOOP and checks the reply.
    pub async fn health_check(&mut self) -> SmtpResult<()> {
        let response = self.send_command(&SmtpCommand::Noop).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(SmtpError::pool(
                SmtpErrorKind::ConnectionUnhealthy,
                format!("Health check failed: {}", response),
            ))
        }
    }

    /// Sends QUIT, ignoring failures.
    pub async fn close(&mut self) {
        if self.state != TransactionState::Closed {
            let _ = self.send_command(&SmtpCommand::Quit).await;
            self.state = TransactionState::Closed;
        }
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// True once TLS is negotiated.
    pub fn is_tls(&self) -> bool {
        matches!(self.stream, TransportStream::Tls(_))
    }

    /// Sends a command and reads its reply.
    pub async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        tracing::trace!(command = %command, "Sending SMTP command");
        self.send_line(&command.to_smtp_string()).await
    }

    async fn send_line(&mut self, line: &str) -> SmtpResult<SmtpResponse> {
        self.write(format!("{}\r\n", line).as_bytes()).await?;
        self.read_response().await
    }

    async fn write(&mut self, data: &[u8]) -> SmtpResult<()> {
        let result = match &mut self.stream {
            TransportStream::Plain(stream) => {
                Self::write_all(stream.get_mut(), data, self.command_timeout).await
            }
            TransportStream::Tls(stream) => {
                Self::write_all(stream.get_mut(), data, self.command_timeout).await
            }
            TransportStream::Closed => Err(Self::closed_error()),
        };
        self.mark_closed_on_reset(result)
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        let result = match &mut self.stream {
            TransportStream::Plain(stream) => Self::read_response_inner(stream, self.command_timeout).await,
            TransportStream::Tls(stream) => {
                Self::read_response_inner(stream.as_mut(), self.command_timeout).await
            }
            TransportStream::Closed => Err(Self::closed_error()),
        };
        let response = self.mark_closed_on_reset(result)?;
        tracing::trace!(code = response.code, message = %response.first_message(), "Received SMTP response");
        Ok(response)
    }

    fn mark_closed_on_reset<T>(&mut self, result: SmtpResult<T>) -> SmtpResult<T> {
        if let Err(e) = &result {
            if e.kind() == SmtpErrorKind::ConnectionReset {
                self.state = TransactionState::Closed;
            }
        }
        result
    }

    async fn upgrade_tls(&mut self) -> SmtpResult<()> {
        let tcp = match std::mem::replace(&mut self.stream, TransportStream::Closed) {
            TransportStream::Plain(reader) => reader.into_inner(),
            other => {
                self.stream = other;
                return Err(SmtpError::tls("Connection is not a plain TCP stream"));
            }
        };

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|_| SmtpError::tls(format!("Invalid server name: {}", self.host)))?;

        let tls = timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| SmtpError::timeout(SmtpErrorKind::ConnectTimeout, "TLS handshake timed out"))?
            .map_err(|e| SmtpError::tls(format!("TLS handshake failed: {}", e)).with_cause(e))?;

        self.stream = TransportStream::Tls(Box::new(BufReader::new(tls)));
        Ok(())
    }

    fn expect_code(response: &SmtpResponse, code: u16) -> SmtpResult<()> {
        if response.code == code {
            Ok(())
        } else {
            Err(response.to_error())
        }
    }

    fn closed_error() -> SmtpError {
        SmtpError::new(SmtpErrorKind::ConnectionReset, "Connection is closed")
    }

    fn map_io_error(error: io::Error, address: &str) -> SmtpError {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => {
                SmtpError::new(SmtpErrorKind::ConnectionRefused, format!("Connection refused to {}", address))
            }
            io::ErrorKind::TimedOut => SmtpError::timeout(SmtpErrorKind::ConnectTimeout, "Connect timed out"),
            io::ErrorKind::ConnectionReset => {
                SmtpError::new(SmtpErrorKind::ConnectionReset, "Connection reset by server")
            }
            _ => SmtpError::connection(format!("Connection error to {}: {}", address, error)).with_cause(error),
        }
    }

    async fn read_response_inner<R: AsyncBufReadExt + Unpin>(
        reader: &mut R,
        timeout_duration: Duration,
    ) -> SmtpResult<SmtpResponse> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();
            let read = timeout(timeout_duration, reader.read_line(&mut line))
                .await
                .map_err(|_| SmtpError::timeout(SmtpErrorKind::ReadTimeout, "Read timed out"))?
                .map_err(|e| SmtpError::new(SmtpErrorKind::ConnectionReset, format!("Read error: {}", e)))?;

            if read == 0 {
                return Err(SmtpError::new(SmtpErrorKind::ConnectionReset, "Server closed connection"));
            }

            let line = line.trim_end().to_string();
            let is_continuation = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);

            if !is_continuation {
                break;
            }
        }

        SmtpResponse::parse(&lines)
    }

    async fn write_all<W: AsyncWrite + Unpin>(
        writer: &mut W,
        data: &[u8],
        timeout_duration: Duration,
    ) -> SmtpResult<()> {
        timeout(timeout_duration, async {
            writer.write_all(data).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| SmtpError::timeout(SmtpErrorKind::WriteTimeout, "Write timed out"))?
        .map_err(|e| SmtpError::new(SmtpErrorKind::ConnectionReset, format!("Write error: {}", e)))
    }
}
