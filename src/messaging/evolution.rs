//! Evolution API client.

use std::fmt;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use super::{infer_media_type, MessagingGateway, MessagingResult};
use crate::config::GatewayConfig;
use crate::errors::MessagingError;

#[derive(Debug, Serialize)]
struct TextRequest<'a> {
    number: &'a str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaRequest<'a> {
    number: &'a str,
    mediatype: &'static str,
    mimetype: String,
    caption: &'a str,
    media: String,
    file_name: &'a str,
}

/// Key of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    /// Destination JID.
    #[serde(default)]
    pub remote_jid: Option<String>,
    /// Whether the instance itself sent the message.
    #[serde(default)]
    pub from_me: Option<bool>,
    /// Gateway message ID.
    #[serde(default)]
    pub id: Option<String>,
}

/// Gateway reply to a send call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SendMessageResponse {
    /// Message key, when the gateway returns one.
    #[serde(default)]
    pub key: Option<MessageKey>,
    /// Delivery status, e.g. `PENDING`.
    #[serde(default)]
    pub status: Option<String>,
}

/// HTTP client for an Evolution API server.
#[derive(Clone)]
pub struct EvolutionClient {
    client: reqwest::Client,
    base_url: String,
}

impl fmt::Debug for EvolutionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvolutionClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl EvolutionClient {
    /// Creates a client from gateway settings.
    pub fn new(config: &GatewayConfig) -> MessagingResult<Self> {
        let mut api_key = HeaderValue::from_str(config.api_key.expose_secret())
            .map_err(|_| MessagingError::Configuration("API key is not a valid header value".into()))?;
        api_key.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert("apikey", api_key);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| MessagingError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self::with_client(client, config.base_url.clone()))
    }

    /// Creates a client around a preconfigured `reqwest::Client`.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, action: &str, instance: &str) -> MessagingResult<String> {
        if instance.trim().is_empty() {
            return Err(MessagingError::InvalidRequest("instance is required".into()));
        }
        Ok(format!("{}/message/{}/{}", self.base_url, action, instance))
    }

    async fn post<B: Serialize + ?Sized>(&self, url: String, body: &B) -> MessagingResult<SendMessageResponse> {
        let started = std::time::Instant::now();
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        tracing::debug!(
            url = %url,
            status = status.as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Gateway request completed"
        );

        if !status.is_success() {
            return Err(MessagingError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| MessagingError::Decode(e.to_string()))
    }

    async fn send_media_payload(
        &self,
        instance: &str,
        number: &str,
        file_name: &str,
        mimetype: String,
        media: String,
        caption: &str,
    ) -> MessagingResult<()> {
        let request = MediaRequest {
            number,
            mediatype: infer_media_type(&mimetype),
            mimetype,
            caption,
            media,
            file_name,
        };
        self.post(self.url("sendMedia", instance)?, &request).await?;
        Ok(())
    }
}

#[async_trait]
impl MessagingGateway for EvolutionClient {
    async fn send_text(&self, instance: &str, number: &str, text: &str) -> MessagingResult<()> {
        let response = self
            .post(self.url("sendText", instance)?, &TextRequest { number, text })
            .await?;
        tracing::trace!(status = ?response.status, "Text accepted");
        Ok(())
    }

    async fn send_media(
        &self,
        instance: &str,
        number: &str,
        file_name: &str,
        data: &[u8],
        caption: &str,
    ) -> MessagingResult<()> {
        if data.is_empty() {
            return Err(MessagingError::InvalidRequest(format!("{} has no content", file_name)));
        }
        let mimetype = sniff_mimetype(data).unwrap_or_else(|| guess_mimetype(file_name));
        self.send_media_payload(instance, number, file_name, mimetype, BASE64.encode(data), caption)
            .await
    }

    async fn send_media_url(
        &self,
        instance: &str,
        number: &str,
        url: &str,
        file_name: &str,
        caption: &str,
    ) -> MessagingResult<()> {
        url::Url::parse(url).map_err(|e| MessagingError::InvalidRequest(format!("invalid media url: {}", e)))?;
        self.send_media_payload(instance, number, file_name, guess_mimetype(file_name), url.to_string(), caption)
            .await
    }
}

/// MIME type from the payload's magic bytes.
fn sniff_mimetype(data: &[u8]) -> Option<String> {
    infer::get(data).map(|kind| kind.mime_type().to_string())
}

fn guess_mimetype(file_name: &str) -> String {
    mime_guess::from_path(file_name).first_or_octet_stream().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let client = EvolutionClient::with_client(reqwest::Client::new(), "http://evolution:8080/");
        assert_eq!(client.base_url(), "http://evolution:8080");
        assert_eq!(
            client.url("sendText", "school").unwrap(),
            "http://evolution:8080/message/sendText/school"
        );
        assert!(client.url("sendText", " ").is_err());
    }

    #[test]
    fn test_media_request_serialization() {
        let request = MediaRequest {
            number: "+5511999999999",
            mediatype: "document",
            mimetype: "application/pdf".into(),
            caption: "",
            media: "aGk=".into(),
            file_name: "boletim.pdf",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["fileName"], "boletim.pdf");
        assert_eq!(json["mediatype"], "document");
        assert_eq!(json["mimetype"], "application/pdf");
    }

    #[test]
    fn test_mimetype_prefers_payload_signature() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(sniff_mimetype(&png).as_deref(), Some("image/png"));
        assert_eq!(sniff_mimetype(b"plain words"), None);
        assert_eq!(guess_mimetype("boletim.pdf"), "application/pdf");
        assert_eq!(guess_mimetype("notas"), "application/octet-stream");
    }

    #[test]
    fn test_response_tolerates_missing_fields() {
        let response: SendMessageResponse = serde_json::from_str("{}").unwrap();
        assert!(response.key.is_none());

        let response: SendMessageResponse = serde_json::from_str(
            r#"{"key":{"remoteJid":"5511@s.whatsapp.net","fromMe":true,"id":"ABC"},"status":"PENDING"}"#,
        )
        .unwrap();
        assert_eq!(response.key.unwrap().id.as_deref(), Some("ABC"));
        assert_eq!(response.status.as_deref(), Some("PENDING"));
    }

    #[test]
    fn test_debug_hides_client_details() {
        let config = GatewayConfig::new("http://evolution:8080", "secret-key");
        let client = EvolutionClient::new(&config).unwrap();
        let debug = format!("{:?}", client);
        assert!(!debug.contains("secret-key"));
    }
}
