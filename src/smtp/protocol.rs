//! SMTP commands, replies and EHLO capabilities (RFC 5321).

use std::collections::HashSet;
use std::fmt;

use crate::errors::{SmtpError, SmtpResult};
use crate::smtp::auth::AuthMethod;

/// SMTP commands used by the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Mechanism name.
        mechanism: String,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// MAIL FROM.
    MailFrom {
        /// Sender address.
        address: String,
        /// SIZE parameter.
        size: Option<usize>,
        /// BODY=8BITMIME parameter.
        body_8bit: bool,
    },
    /// RCPT TO.
    RcptTo(String),
    /// DATA.
    Data,
    /// Reset transaction.
    Rset,
    /// Keepalive.
    Noop,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command line without CRLF.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response,
            } => match initial_response {
                Some(response) => format!("AUTH {} {}", mechanism, response),
                None => format!("AUTH {}", mechanism),
            },
            SmtpCommand::MailFrom {
                address,
                size,
                body_8bit,
            } => {
                let mut cmd = format!("MAIL FROM:<{}>", address);
                if let Some(s) = size {
                    cmd.push_str(&format!(" SIZE={}", s));
                }
                if *body_8bit {
                    cmd.push_str(" BODY=8BITMIME");
                }
                cmd
            }
            SmtpCommand::RcptTo(address) => format!("RCPT TO:<{}>", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Noop => "NOOP".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never log credentials
        match self {
            SmtpCommand::Auth { mechanism, .. } => write!(f, "AUTH {} ***", mechanism),
            other => f.write_str(&other.to_smtp_string()),
        }
    }
}

/// Reply from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    /// Reply code.
    pub code: u16,
    /// Text of each reply line.
    pub message: Vec<String>,
}

impl SmtpResponse {
    /// Creates a single-line response.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: vec![message.into()],
        }
    }

    /// Parses a response from its raw lines (without CRLF).
    pub fn parse(lines: &[String]) -> SmtpResult<Self> {
        if lines.is_empty() {
            return Err(SmtpError::protocol("Empty response"));
        }

        let mut code = 0u16;
        let mut message = Vec::with_capacity(lines.len());

        for (i, line) in lines.iter().enumerate() {
            let parsed: u16 = line
                .get(..3)
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| SmtpError::protocol(format!("Invalid status line: {}", line)))?;

            if i == 0 {
                code = parsed;
            } else if parsed != code {
                return Err(SmtpError::protocol("Inconsistent status codes in multiline response"));
            }

            message.push(line.get(4..).unwrap_or_default().to_string());
        }

        Ok(Self { code, message })
    }

    /// 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// First reply line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(String::as_str).unwrap_or_default()
    }

    /// All reply lines joined.
    pub fn full_message(&self) -> String {
        self.message.join(" ")
    }

    /// Converts the reply into an error.
    pub fn to_error(&self) -> SmtpError {
        SmtpError::from_smtp_response(self.code, self.full_message())
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.full_message())
    }
}

/// Capabilities advertised in the EHLO reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EsmtpCapabilities {
    /// STARTTLS offered.
    pub starttls: bool,
    /// Supported AUTH mechanisms we know about.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// Maximum message size.
    pub size: Option<usize>,
    /// 8BITMIME offered.
    pub eight_bit_mime: bool,
}

impl EsmtpCapabilities {
    /// Parses capabilities from an EHLO reply. The first line is the greeting.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            let (capability, params) = line.split_once(' ').unwrap_or((line.as_str(), ""));

            match capability {
                "STARTTLS" => caps.starttls = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                "SIZE" => caps.size = params.trim().parse().ok().filter(|s| *s > 0),
                "AUTH" => {
                    caps.auth_mechanisms
                        .extend(params.split_whitespace().filter_map(AuthMethod::from_capability));
                }
                _ => {}
            }
        }

        caps
    }
}

/// Connection lifecycle as seen by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Greeting received, session not yet set up.
    Connected,
    /// Session set up; ready for MAIL FROM.
    Ready,
    /// A transaction is in progress or was interrupted.
    InTransaction,
    /// QUIT sent or stream lost.
    Closed,
}

/// Reply codes.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Auth succeeded.
    pub const AUTH_SUCCESS: u16 = 235;
    /// Action OK.
    pub const OK: u16 = 250;
    /// Auth continuation.
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_command_formatting() {
        assert_eq!(SmtpCommand::Ehlo("client".into()).to_smtp_string(), "EHLO client");
        assert_eq!(
            SmtpCommand::MailFrom {
                address: "a@example.com".into(),
                size: Some(1024),
                body_8bit: true
            }
            .to_smtp_string(),
            "MAIL FROM:<a@example.com> SIZE=1024 BODY=8BITMIME"
        );
        assert_eq!(SmtpCommand::RcptTo("b@example.com".into()).to_smtp_string(), "RCPT TO:<b@example.com>");
    }

    #[test]
    fn test_auth_display_hides_secret() {
        let cmd = SmtpCommand::Auth {
            mechanism: "PLAIN".into(),
            initial_response: Some("c2VjcmV0".into()),
        };
        assert_eq!(cmd.to_string(), "AUTH PLAIN ***");
        assert!(cmd.to_smtp_string().ends_with("c2VjcmV0"));
    }

    #[test]
    fn test_response_parse() {
        let resp = SmtpResponse::parse(&lines(&["250 OK"])).unwrap();
        assert_eq!(resp.code, 250);
        assert!(resp.is_success());
        assert_eq!(resp.first_message(), "OK");

        let resp = SmtpResponse::parse(&lines(&["354"])).unwrap();
        assert_eq!(resp.code, 354);
        assert!(!resp.is_success());
        assert_eq!(resp.first_message(), "");
    }

    #[test]
    fn test_response_parse_rejects_garbage() {
        assert!(SmtpResponse::parse(&[]).is_err());
        assert!(SmtpResponse::parse(&lines(&["OK"])).is_err());
        assert!(SmtpResponse::parse(&lines(&["250-a", "251 b"])).is_err());
    }

    #[test]
    fn test_capabilities_parse() {
        let resp = SmtpResponse::parse(&lines(&[
            "250-mail.example.com Hello",
            "250-SIZE 35882577",
            "250-8BITMIME",
            "250-STARTTLS",
            "250 AUTH PLAIN LOGIN XOAUTH2",
        ]))
        .unwrap();

        let caps = EsmtpCapabilities::from_ehlo_response(&resp);
        assert!(caps.starttls);
        assert!(caps.eight_bit_mime);
        assert_eq!(caps.size, Some(35882577));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Plain));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Login));
        assert_eq!(caps.auth_mechanisms.len(), 2);
    }
}
