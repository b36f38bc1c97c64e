//! SendGrid v3 mail-send transport over HTTPS.

use async_trait::async_trait;
use outreach_core::config::TransportConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::{OutboundMessage, Transport};
use std::time::Duration;

/// Response header carrying SendGrid's message id on 202 Accepted.
const MESSAGE_ID_HEADER: &str = "x-message-id";

pub struct SendGridTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    from_email: String,
    from_name: Option<String>,
    timeout: Duration,
}

impl SendGridTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let sg = &config.sendgrid;
        if sg.api_key.trim().is_empty() {
            return Err(OutreachError::Config(
                "sendgrid.api_key (or SENDGRID_API_KEY) is required for the sendgrid provider".into(),
            ));
        }
        if config.from.trim().is_empty() {
            return Err(OutreachError::Config("transport.from is required".into()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: sg.endpoint.clone(),
            api_key: sg.api_key.clone(),
            from_email: config.from.clone(),
            from_name: config.from_name.clone().filter(|n| !n.is_empty()),
            timeout: Duration::from_secs(sg.timeout_secs),
        })
    }

    fn payload(&self, message: &OutboundMessage) -> serde_json::Value {
        let mut from = serde_json::json!({ "email": self.from_email });
        if let Some(name) = &self.from_name {
            from["name"] = serde_json::Value::String(name.clone());
        }
        serde_json::json!({
            "personalizations": [{ "to": [{ "email": message.to }] }],
            "from": from,
            "subject": message.subject,
            "content": [{ "type": "text/plain", "value": message.body }],
        })
    }
}

#[async_trait]
impl Transport for SendGridTransport {
    fn name(&self) -> &str {
        "sendgrid"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Option<String>> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.payload(message))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| OutreachError::Transport(format!("SendGrid request failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            let id = resp
                .headers()
                .get(MESSAGE_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            tracing::debug!("📤 SendGrid accepted message for {} ({status})", message.to);
            Ok(id)
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(OutreachError::Transport(format!("SendGrid API error {status}: {body}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(endpoint: &str) -> TransportConfig {
        let mut c = TransportConfig {
            from: "sales@acme.test".into(),
            from_name: Some("Acme".into()),
            ..Default::default()
        };
        c.sendgrid.api_key = "SG.test".into();
        c.sendgrid.endpoint = endpoint.into();
        c
    }

    /// Serve exactly one canned HTTP response and hand back the raw request.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/v3/mail/send", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if buf.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
            }
            sock.write_all(response.as_bytes()).await.unwrap();
            sock.shutdown().await.ok();
            String::from_utf8_lossy(&buf).into_owned()
        });
        (url, handle)
    }

    #[test]
    fn test_requires_api_key() {
        let mut c = config("http://localhost");
        c.sendgrid.api_key.clear();
        assert!(SendGridTransport::new(&c).is_err());
    }

    #[test]
    fn test_payload_shape() {
        let t = SendGridTransport::new(&config("http://localhost")).unwrap();
        let p = t.payload(&OutboundMessage::new("ada@example.com", "Hi", "Body"));
        assert_eq!(p["personalizations"][0]["to"][0]["email"], "ada@example.com");
        assert_eq!(p["from"]["email"], "sales@acme.test");
        assert_eq!(p["from"]["name"], "Acme");
        assert_eq!(p["subject"], "Hi");
        assert_eq!(p["content"][0]["value"], "Body");
    }

    #[tokio::test]
    async fn test_accepted_returns_message_id() {
        let (url, server) = serve_once(
            "HTTP/1.1 202 Accepted\r\nX-Message-Id: sg-123\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let t = SendGridTransport::new(&config(&url)).unwrap();
        let id = t
            .send(&OutboundMessage::new("ada@example.com", "Hi", "Body"))
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("sg-123"));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v3/mail/send"));
        assert!(request.to_lowercase().contains("authorization: bearer sg.test"));
    }

    #[tokio::test]
    async fn test_rejection_is_transport_error() {
        let (url, _server) = serve_once(
            "HTTP/1.1 400 Bad Request\r\nContent-Length: 13\r\nConnection: close\r\n\r\ninvalid email",
        )
        .await;
        let t = SendGridTransport::new(&config(&url)).unwrap();
        let err = t
            .send(&OutboundMessage::new("bad", "Hi", "Body"))
            .await
            .unwrap_err();
        assert!(err.is_recipient_scoped());
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("invalid email"));
    }
}
