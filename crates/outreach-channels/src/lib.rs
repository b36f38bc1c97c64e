//! # Outreach Channels
//! Delivery backends behind [`outreach_core::Transport`].
//!
//! The provider is chosen once from config; the scheduler only ever sees
//! `Arc<dyn Transport>`.

pub mod dry_run;
pub mod sendgrid;
pub mod smtp;

use outreach_core::config::{TransportConfig, TransportKind};
use outreach_core::error::Result;
use outreach_core::Transport;
use std::sync::Arc;

pub use dry_run::LogTransport;
pub use sendgrid::SendGridTransport;
pub use smtp::SmtpTransport;

/// Build the configured transport, validating its settings up front.
pub fn from_config(config: &TransportConfig) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match config.provider {
        TransportKind::Smtp => Arc::new(SmtpTransport::new(config)?),
        TransportKind::SendGrid => Arc::new(SendGridTransport::new(config)?),
        TransportKind::Log => Arc::new(LogTransport::new()),
    };
    tracing::info!("📮 Email transport: {}", transport.name());
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_dry_run() {
        let t = from_config(&TransportConfig::default()).unwrap();
        assert_eq!(t.name(), "log");
    }

    #[tokio::test]
    async fn test_provider_selection() {
        let mut c = TransportConfig {
            provider: TransportKind::SendGrid,
            from: "sales@acme.test".into(),
            ..Default::default()
        };
        // Missing key is a startup error, not a per-send failure
        assert!(from_config(&c).is_err());
        c.sendgrid.api_key = "SG.key".into();
        assert_eq!(from_config(&c).unwrap().name(), "sendgrid");

        c.provider = TransportKind::Smtp;
        c.smtp.host = "smtp.acme.test".into();
        assert_eq!(from_config(&c).unwrap().name(), "smtp");
    }
}
