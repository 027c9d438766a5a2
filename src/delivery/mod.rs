//! Delivery port: the narrow seam between the dispatcher and whatever
//! actually puts mail on the wire.

pub mod resend;
pub mod scripted;

use async_trait::async_trait;
use std::time::Duration;

pub use resend::ResendDelivery;
pub use scripted::{ScriptedDelivery, ScriptedResponse};

/// A fully rendered message for one lead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub body_html: String,
    pub tracking_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub provider_message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Network failure, 5xx, rate limiting. The lead stays eligible.
    #[error("Transient delivery failure: {0}")]
    Transient(String),
    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),
    /// Provider-reported permanent failure for this address.
    #[error("Hard bounce: {0}")]
    Bounce(String),
}

impl DeliveryError {
    pub fn is_bounce(&self) -> bool {
        matches!(self, DeliveryError::Bounce(_))
    }
}

#[async_trait]
pub trait DeliveryPort: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DeliveryError>;
}
