//! SMTP transport (async lettre).
//!
//! SMTP has no provider-side id, so each message gets a generated
//! `Message-ID` which is also what the transport reports back.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};
use outreach_core::config::TransportConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::{OutboundMessage, Transport};
use std::time::Duration;

pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    /// Right-hand side of generated Message-IDs.
    id_domain: String,
}

impl SmtpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let smtp = &config.smtp;
        if smtp.host.trim().is_empty() {
            return Err(OutreachError::Config("smtp.host is required for the smtp provider".into()));
        }
        let from = sender_mailbox(config)?;
        let id_domain = from.email.domain().to_string();

        // 465 is implicit TLS; everything else negotiates STARTTLS
        let builder = if smtp.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
        }
        .map_err(|e| OutreachError::Config(format!("SMTP relay: {e}")))?
        .port(smtp.port)
        .timeout(Some(Duration::from_secs(smtp.timeout_secs)));

        let mailer = if smtp.username.is_empty() {
            builder.build()
        } else {
            builder
                .credentials(Credentials::new(smtp.username.clone(), smtp.password.clone()))
                .build()
        };

        Ok(Self {
            mailer,
            from,
            id_domain,
        })
    }

    fn build_message(&self, message: &OutboundMessage, message_id: &str) -> Result<LettreMessage> {
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|e| OutreachError::Transport(format!("Invalid recipient {}: {e}", message.to)))?;

        LettreMessage::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.as_str())
            .message_id(Some(message_id.to_string()))
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| OutreachError::Transport(format!("Build email: {e}")))
    }

    fn next_message_id(&self) -> String {
        format!("<{}@{}>", uuid::Uuid::new_v4(), self.id_domain)
    }
}

/// `"Name <addr>"` or bare `addr` from the transport config.
pub(crate) fn sender_mailbox(config: &TransportConfig) -> Result<Mailbox> {
    if config.from.trim().is_empty() {
        return Err(OutreachError::Config("transport.from is required".into()));
    }
    let raw = match config.from_name.as_deref() {
        Some(name) if !name.is_empty() => format!("{name} <{}>", config.from),
        _ => config.from.clone(),
    };
    raw.parse()
        .map_err(|e| OutreachError::Config(format!("Invalid from address '{raw}': {e}")))
}

#[async_trait]
impl Transport for SmtpTransport {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Option<String>> {
        let message_id = self.next_message_id();
        let email = self.build_message(message, &message_id)?;

        self.mailer
            .send(email)
            .await
            .map_err(|e| OutreachError::Transport(format!("SMTP send: {e}")))?;

        tracing::debug!("📤 SMTP accepted {message_id} for {}", message.to);
        Ok(Some(message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::config::TransportKind;

    fn config() -> TransportConfig {
        let mut c = TransportConfig {
            provider: TransportKind::Smtp,
            from: "sales@acme.test".into(),
            from_name: Some("Acme Sales".into()),
            ..Default::default()
        };
        c.smtp.host = "smtp.acme.test".into();
        c.smtp.username = "sales".into();
        c.smtp.password = "hunter2".into();
        c
    }

    #[tokio::test]
    async fn test_requires_host_and_from() {
        let mut c = config();
        c.smtp.host.clear();
        assert!(SmtpTransport::new(&c).is_err());

        let mut c = config();
        c.from.clear();
        assert!(SmtpTransport::new(&c).is_err());
    }

    #[tokio::test]
    async fn test_message_carries_generated_id() {
        let t = SmtpTransport::new(&config()).unwrap();
        let id = t.next_message_id();
        assert!(id.starts_with('<') && id.ends_with("@acme.test>"));
        assert_ne!(id, t.next_message_id());

        let msg = OutboundMessage::new("ada@example.com", "Hello", "Body text");
        let raw = String::from_utf8(t.build_message(&msg, &id).unwrap().formatted()).unwrap();
        assert!(raw.contains(&format!("Message-ID: {id}")));
        assert!(raw.contains("Acme Sales"));
        assert!(raw.contains("<sales@acme.test>"));
        assert!(raw.contains("To: ada@example.com"));
        assert!(raw.contains("Subject: Hello"));
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_transport_error() {
        let t = SmtpTransport::new(&config()).unwrap();
        let msg = OutboundMessage::new("not an address", "s", "b");
        let err = t.build_message(&msg, "<x@acme.test>").unwrap_err();
        assert!(err.is_recipient_scoped());
    }
}
