//! Dry-run transport: logs the message and reports success.

use async_trait::async_trait;
use outreach_core::error::Result;
use outreach_core::{OutboundMessage, Transport};

#[derive(Debug, Default)]
pub struct LogTransport;

impl LogTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for LogTransport {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Option<String>> {
        let id = format!("log-{}", uuid::Uuid::new_v4());
        tracing::info!(
            "✉️ [dry-run] to={} subject={:?} ({} bytes) id={id}",
            message.to,
            message.subject,
            message.body.len()
        );
        Ok(Some(id))
    }
}
