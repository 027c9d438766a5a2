#![allow(clippy::uninlined_format_args)]

use super::{DeliveryError, DeliveryPort, DeliveryReceipt, OutboundMessage};
use crate::error::CampaignError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.resend.com";

/// Phrases providers use for a permanently undeliverable address.
const BOUNCE_INDICATORS: &[&str] = &[
    "does not exist",
    "no such user",
    "no such mailbox",
    "mailbox unavailable",
    "invalid recipient",
    "invalid `to` field",
    "undeliverable",
    "recipient address rejected",
    "hard bounce",
];

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
    tags: [Tag<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Tag<'a> {
    name: &'static str,
    value: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

/// HTTP delivery through a Resend-compatible `/emails` endpoint.
pub struct ResendDelivery {
    client: Client,
    api_base_url: String,
    api_key: String,
    from: String,
    reply_to: Option<String>,
    timeout: Duration,
}

impl ResendDelivery {
    pub fn new(
        api_base_url: &str,
        api_key: &str,
        from: &str,
        reply_to: Option<String>,
        timeout: Duration,
    ) -> Result<Self, CampaignError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("outreach-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CampaignError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            from: from.to_string(),
            reply_to,
            timeout,
        })
    }
}

#[async_trait]
impl DeliveryPort for ResendDelivery {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DeliveryError> {
        let request = SendRequest {
            from: &self.from,
            to: [&message.to],
            subject: &message.subject,
            html: &message.body_html,
            reply_to: self.reply_to.as_deref(),
            tags: [Tag {
                name: "tracking_id",
                value: &message.tracking_id,
            }],
        };

        let response = self
            .client
            .post(format!("{}/emails", self.api_base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport_error(e, self.timeout))?;

        let status = response.status();
        if status.is_success() {
            let body: SendResponse = response.json().await.map_err(|e| {
                DeliveryError::Transient(format!("unreadable provider response: {}", e))
            })?;
            return Ok(DeliveryReceipt {
                provider_message_id: body.id,
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

fn classify_transport_error(error: reqwest::Error, timeout: Duration) -> DeliveryError {
    if error.is_timeout() {
        DeliveryError::Timeout(timeout)
    } else {
        DeliveryError::Transient(error.to_string())
    }
}

/// Map a non-success provider response onto the delivery error taxonomy.
///
/// Only a 4xx whose body names the recipient as undeliverable is a bounce.
/// Everything else (auth problems, rate limits, 5xx) leaves the lead for the
/// next run.
pub fn classify_status(status: StatusCode, body: &str) -> DeliveryError {
    let lowered = body.to_lowercase();
    if status.is_client_error()
        && status != StatusCode::TOO_MANY_REQUESTS
        && BOUNCE_INDICATORS.iter().any(|needle| lowered.contains(needle))
    {
        return DeliveryError::Bounce(format!("{}: {}", status, body.trim()));
    }
    DeliveryError::Transient(format!("{}: {}", status, body.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_recipient_is_bounce() {
        let err = classify_status(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"message": "Invalid `to` field. The email address does not exist."}"#,
        );
        assert!(err.is_bounce());
    }

    #[test]
    fn test_server_errors_are_transient() {
        let err = classify_status(StatusCode::BAD_GATEWAY, "mailbox unavailable");
        assert!(matches!(err, DeliveryError::Transient(_)));
    }

    #[test]
    fn test_rate_limit_is_transient() {
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, "invalid recipient");
        assert!(!err.is_bounce());
    }

    #[test]
    fn test_auth_failure_is_not_bounce() {
        let err = classify_status(StatusCode::UNAUTHORIZED, r#"{"message":"API key is invalid"}"#);
        assert!(!err.is_bounce());
    }

    #[test]
    fn test_client_keeps_configuration() {
        let delivery = ResendDelivery::new(
            "https://api.example.com/",
            "re_key",
            "Outreach <hello@example.com>",
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(delivery.api_base_url, "https://api.example.com");
        assert_eq!(delivery.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_request_shape() {
        let request = SendRequest {
            from: "Outreach <hello@example.com>",
            to: ["lead@clinic.com"],
            subject: "Hi",
            html: "<p>Hi</p>",
            reply_to: None,
            tags: [Tag {
                name: "tracking_id",
                value: "abc",
            }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["to"][0], "lead@clinic.com");
        assert_eq!(json["tags"][0]["value"], "abc");
        assert!(json.get("reply_to").is_none());
    }
}
