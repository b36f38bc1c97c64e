//! Trait seams between the scheduler core and its collaborators.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::OutboundMessage;

/// Delivery backend. Picked once at startup; the scheduler never branches on
/// which provider sits behind it.
///
/// Implementations must tolerate being called again for the same message
/// after an ambiguous failure (a duplicate send is an accepted risk).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Provider name recorded in message logs.
    fn name(&self) -> &str;

    /// Attempt delivery. Returns the provider-assigned message id when the
    /// provider reports one.
    async fn send(&self, message: &OutboundMessage) -> Result<Option<String>>;
}
