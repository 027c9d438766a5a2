use super::{DeliveryError, DeliveryPort, DeliveryReceipt, OutboundMessage};
use crate::lead::normalize_email;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedResponse {
    Deliver,
    Bounce,
    Transient,
    /// Never completes; exercises the dispatcher's timeout.
    Hang,
}

/// In-process delivery double. Every call is recorded in order; recipients
/// without a scripted response are delivered.
#[derive(Debug, Default)]
pub struct ScriptedDelivery {
    responses: Mutex<HashMap<String, ScriptedResponse>>,
    sent: Mutex<Vec<OutboundMessage>>,
    latency: Option<Duration>,
    counter: AtomicU64,
}

impl ScriptedDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn respond(self, email: &str, response: ScriptedResponse) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(normalize_email(email), response);
        self
    }

    /// Every message handed to `send`, in call order.
    pub fn attempts(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempted_recipients(&self) -> Vec<String> {
        self.attempts().into_iter().map(|m| m.to).collect()
    }
}

#[async_trait]
impl DeliveryPort for ScriptedDelivery {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DeliveryError> {
        self.sent.lock().unwrap().push(message.clone());
        let response = self
            .responses
            .lock()
            .unwrap()
            .get(&normalize_email(&message.to))
            .cloned()
            .unwrap_or(ScriptedResponse::Deliver);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match response {
            ScriptedResponse::Deliver => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(DeliveryReceipt {
                    provider_message_id: format!("scripted-{n}"),
                })
            }
            ScriptedResponse::Bounce => Err(DeliveryError::Bounce(format!(
                "550 no such mailbox: {}",
                message.to
            ))),
            ScriptedResponse::Transient => {
                Err(DeliveryError::Transient("503 service unavailable".into()))
            }
            ScriptedResponse::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(to: &str) -> OutboundMessage {
        OutboundMessage {
            to: to.to_string(),
            subject: "s".into(),
            body_html: "b".into(),
            tracking_id: "t".into(),
        }
    }

    #[tokio::test]
    async fn test_scripted_responses_and_recording() {
        let port = ScriptedDelivery::new()
            .respond("Bad@x.com", ScriptedResponse::Bounce)
            .respond("flaky@x.com", ScriptedResponse::Transient);

        let ok = port.send(&message("good@x.com")).await.unwrap();
        assert_eq!(ok.provider_message_id, "scripted-1");
        assert!(port.send(&message("bad@x.com")).await.unwrap_err().is_bounce());
        assert!(matches!(
            port.send(&message("flaky@x.com")).await,
            Err(DeliveryError::Transient(_))
        ));

        assert_eq!(
            port.attempted_recipients(),
            vec!["good@x.com", "bad@x.com", "flaky@x.com"]
        );
    }
}
