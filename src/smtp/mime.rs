//! RFC 5322 message encoding.
//!
//! Bodies are UTF-8 quoted-printable; attachments switch the message to
//! `multipart/mixed` with base64 parts typed from the file name.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::smtp::{MailAttachment, OutgoingEmail};
use crate::types::ContentType;

/// MIME encoder for outgoing emails.
#[derive(Debug, Clone)]
pub struct MimeEncoder {
    date: DateTime<Utc>,
    domain: String,
}

impl MimeEncoder {
    /// Creates an encoder generating Message-IDs under `domain`.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            date: Utc::now(),
            domain: domain.into(),
        }
    }

    /// Encodes `email` to wire format (not yet dot-stuffed).
    pub fn encode(&self, email: &OutgoingEmail) -> SmtpResult<Vec<u8>> {
        let mut output = Vec::with_capacity(email.body.len() + 512);

        self.write_header(&mut output, "Date", &self.date.to_rfc2822())?;
        self.write_header(&mut output, "From", &email.from)?;
        self.write_header(&mut output, "To", &email.to.join(", "))?;
        self.write_header(&mut output, "Subject", &encode_header(&email.subject))?;
        self.write_header(&mut output, "Message-ID", &format!("<{}>", self.generate_message_id()))?;
        self.write_header(&mut output, "MIME-Version", "1.0")?;

        if email.attachments.is_empty() {
            self.write_body(&mut output, email)?;
            return Ok(output);
        }

        let boundary = generate_boundary();
        self.write_mime_header(
            &mut output,
            "Content-Type",
            &format!("multipart/mixed; boundary=\"{}\"", boundary),
        )?;
        output.extend_from_slice(b"\r\n");

        output.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        self.write_body(&mut output, email)?;
        output.extend_from_slice(b"\r\n");

        for attachment in email.attachments.iter() {
            output.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            self.write_attachment(&mut output, attachment)?;
        }

        output.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
        Ok(output)
    }

    fn write_body(&self, output: &mut Vec<u8>, email: &OutgoingEmail) -> SmtpResult<()> {
        let mime_type = match email.content_type {
            ContentType::TextPlain => "text/plain; charset=utf-8",
            ContentType::TextHtml => "text/html; charset=utf-8",
        };
        self.write_header(output, "Content-Type", mime_type)?;
        self.write_header(output, "Content-Transfer-Encoding", "quoted-printable")?;
        output.extend_from_slice(b"\r\n");
        output.extend_from_slice(&quoted_printable::encode(email.body.as_bytes()));
        Ok(())
    }

    fn write_attachment(&self, output: &mut Vec<u8>, attachment: &MailAttachment) -> SmtpResult<()> {
        let content_type = mime_guess::from_path(&attachment.file_name).first_or_octet_stream();
        let name = encode_header(&attachment.file_name);

        self.write_mime_header(output, "Content-Type", &format!("{}; name=\"{}\"", content_type, name))?;
        self.write_header(output, "Content-Transfer-Encoding", "base64")?;
        self.write_mime_header(
            output,
            "Content-Disposition",
            &format!("attachment; filename=\"{}\"", name),
        )?;
        output.extend_from_slice(b"\r\n");

        let encoded = BASE64.encode(&attachment.data);
        for chunk in encoded.as_bytes().chunks(76) {
            output.extend_from_slice(chunk);
            output.extend_from_slice(b"\r\n");
        }
        Ok(())
    }

    fn write_header(&self, output: &mut Vec<u8>, name: &str, value: &str) -> SmtpResult<()> {
        check_header_value(name, value)?;
        output.extend_from_slice(fold_header(&format!("{}: {}", name, value)).as_bytes());
        output.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Writes a header carrying MIME parameters (`boundary`, `name`,
    /// `filename`) on a single line so parameter values are never split.
    fn write_mime_header(&self, output: &mut Vec<u8>, name: &str, value: &str) -> SmtpResult<()> {
        check_header_value(name, value)?;
        output.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        Ok(())
    }

    fn generate_message_id(&self) -> String {
        format!("{}.{}@{}", Uuid::new_v4(), self.date.timestamp(), self.domain)
    }
}

/// RFC 2047 B-encoding for non-ASCII header values.
fn encode_header(value: &str) -> String {
    if value.chars().all(|c| c.is_ascii() && !c.is_control()) {
        return value.to_string();
    }
    format!("=?UTF-8?B?{}?=", BASE64.encode(value.as_bytes()))
}

/// Folds a header line at whitespace near 78 columns.
fn fold_header(header: &str) -> String {
    if header.len() <= 78 {
        return header.to_string();
    }

    let mut result = String::with_capacity(header.len() + 16);
    let mut line_len = 0;

    for (i, word) in header.split(' ').enumerate() {
        if i > 0 {
            if line_len + 1 + word.len() > 76 {
                result.push_str("\r\n ");
                line_len = 1;
            } else {
                result.push(' ');
                line_len += 1;
            }
        }
        result.push_str(word);
        line_len += word.len();
    }

    result
}

fn check_header_value(name: &str, value: &str) -> SmtpResult<()> {
    if value.contains('\r') || value.contains('\n') {
        return Err(SmtpError::new(
            SmtpErrorKind::InvalidHeader,
            format!("Header {} contains a line break", name),
        ));
    }
    Ok(())
}

fn generate_boundary() -> String {
    format!("----=_Part_{}", Uuid::new_v4().simple())
}

/// Applies dot-stuffing and appends the `<CRLF>.<CRLF>` terminator.
pub fn prepare_data_content(encoded: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(encoded.len() + 64);
    let mut at_line_start = true;

    for &byte in encoded {
        if at_line_start && byte == b'.' {
            output.push(b'.');
        }
        output.push(byte);
        at_line_start = byte == b'\n';
    }

    if !output.ends_with(b"\r\n") {
        if output.ends_with(b"\n") {
            output.pop();
        }
        output.extend_from_slice(b"\r\n");
    }
    output.extend_from_slice(b".\r\n");
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn email(attachments: Vec<MailAttachment>) -> OutgoingEmail {
        OutgoingEmail {
            from: "school@example.com".into(),
            to: vec!["a@example.com".into(), "b@example.com".into()],
            subject: "Reunião de pais".into(),
            body: "Olá, turma!".into(),
            content_type: ContentType::TextPlain,
            attachments: Arc::from(attachments),
        }
    }

    #[test]
    fn test_encode_plain_message() {
        let out = String::from_utf8(MimeEncoder::new("example.com").encode(&email(vec![])).unwrap()).unwrap();
        assert!(out.contains("From: school@example.com\r\n"));
        assert!(out.contains("To: a@example.com, b@example.com\r\n"));
        assert!(out.contains("Subject: =?UTF-8?B?"));
        assert!(out.contains("@example.com>\r\n"));
        assert!(out.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(out.contains("Content-Transfer-Encoding: quoted-printable\r\n"));
        assert!(out.contains("Ol=C3=A1, turma!"));
        assert!(!out.contains("multipart"));
    }

    #[test]
    fn test_encode_html_message() {
        let mut msg = email(vec![]);
        msg.content_type = ContentType::TextHtml;
        let out = String::from_utf8(MimeEncoder::new("example.com").encode(&msg).unwrap()).unwrap();
        assert!(out.contains("Content-Type: text/html; charset=utf-8\r\n"));
    }

    #[test]
    fn test_encode_with_attachment() {
        let msg = email(vec![MailAttachment {
            file_name: "boletim.pdf".into(),
            data: b"%PDF-1.4".to_vec(),
        }]);
        let out = String::from_utf8(MimeEncoder::new("example.com").encode(&msg).unwrap()).unwrap();
        assert!(out.contains("Content-Type: multipart/mixed; boundary=\"----=_Part_"));
        assert!(out.contains("Content-Type: application/pdf; name=\"boletim.pdf\""));
        assert!(out.contains("Content-Disposition: attachment; filename=\"boletim.pdf\""));
        assert!(out.contains(&BASE64.encode(b"%PDF-1.4")));
        assert!(out.trim_end().ends_with("--"));
    }

    #[test]
    fn test_mime_parameters_stay_on_one_line() {
        let msg = email(vec![MailAttachment {
            file_name: "relatorio de desempenho do primeiro bimestre.pdf".into(),
            data: b"%PDF-1.4".to_vec(),
        }]);
        let out = String::from_utf8(MimeEncoder::new("example.com").encode(&msg).unwrap()).unwrap();

        let boundary_line = out
            .split("\r\n")
            .find(|l| l.starts_with("Content-Type: multipart/mixed;"))
            .unwrap();
        let boundary = boundary_line
            .split("boundary=\"")
            .nth(1)
            .and_then(|rest| rest.strip_suffix('"'))
            .unwrap();
        assert!(boundary.starts_with("----=_Part_"));
        assert!(out.contains(&format!("\r\n--{}--\r\n", boundary)));
        assert!(out.contains(
            "Content-Disposition: attachment; filename=\"relatorio de desempenho do primeiro bimestre.pdf\"\r\n"
        ));
    }

    #[test]
    fn test_rejects_header_injection() {
        let mut msg = email(vec![]);
        msg.to = vec!["a@example.com\r\nBcc: evil@example.com".into()];
        let err = MimeEncoder::new("example.com").encode(&msg).unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidHeader);
    }

    #[test]
    fn test_fold_long_header() {
        let to: Vec<String> = (0..10).map(|i| format!("student{}@example.com", i)).collect();
        let folded = fold_header(&format!("To: {}", to.join(", ")));
        assert!(folded.contains("\r\n "));
        assert!(folded.split("\r\n").all(|line| line.len() <= 78));
    }

    #[test]
    fn test_prepare_data_content() {
        assert_eq!(prepare_data_content(b"Hello\r\n.World\r\n"), b"Hello\r\n..World\r\n.\r\n".to_vec());
        assert_eq!(prepare_data_content(b".start"), b"..start\r\n.\r\n".to_vec());
        assert_eq!(prepare_data_content(b"line\n"), b"line\r\n.\r\n".to_vec());
    }
}
