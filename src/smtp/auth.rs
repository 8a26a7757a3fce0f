//! SASL PLAIN and LOGIN.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};

/// Supported authentication mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// AUTH PLAIN.
    Plain,
    /// AUTH LOGIN.
    Login,
}

impl AuthMethod {
    /// Parses a mechanism name from the EHLO AUTH line.
    pub fn from_capability(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            _ => None,
        }
    }

    /// Mechanism name.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
        }
    }

    /// Picks PLAIN when offered, then LOGIN.
    pub fn select<'a>(available: impl IntoIterator<Item = &'a AuthMethod>) -> SmtpResult<Self> {
        let mut login = false;
        for method in available {
            match method {
                AuthMethod::Plain => return Ok(AuthMethod::Plain),
                AuthMethod::Login => login = true,
            }
        }
        if login {
            Ok(AuthMethod::Login)
        } else {
            Err(SmtpError::new(
                SmtpErrorKind::AuthMethodNotSupported,
                "Server offers neither PLAIN nor LOGIN authentication",
            ))
        }
    }
}

/// `\0user\0pass`, base64-encoded.
pub fn plain_initial_response(username: &str, password: &str) -> String {
    BASE64.encode(format!("\0{}\0{}", username, password))
}

/// Base64-encodes one LOGIN step.
pub fn login_step(value: &str) -> String {
    BASE64.encode(value)
}
