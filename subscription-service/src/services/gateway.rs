//! Payment gateway client.
//!
//! Implements the gateway's Orders API for checkout initiation and HMAC
//! verification for webhook authentication.

use crate::config::GatewayConfig;
use anyhow::{anyhow, Result};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use service_core::utils::signature::verify_payload;
use uuid::Uuid;

/// Client for the external payment gateway.
#[derive(Clone)]
pub struct GatewayClient {
    client: Client,
    config: GatewayConfig,
}

/// Checkout context echoed back by the gateway on every webhook.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrderNotes {
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "planId", skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<Uuid>,
}

/// Request to create a gateway order.
#[derive(Debug, Serialize)]
struct CreateOrderRequest {
    /// Amount in smallest currency unit.
    amount: i64,
    currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    receipt: Option<String>,
    notes: OrderNotes,
}

/// Response from gateway order creation.
#[derive(Debug, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub notes: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GatewayError {
    error: GatewayErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorDetail {
    code: String,
    description: String,
}

/// Webhook envelope: `{ event, payload: { payment: { entity: {...} } } }`.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    pub payload: WebhookPayload,
}

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub payment: Option<WebhookPaymentEntity>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookPaymentEntity {
    pub entity: PaymentEntity,
}

/// Gateway payment entity.
#[derive(Debug, Deserialize)]
pub struct PaymentEntity {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    pub order_id: Option<String>,
    #[serde(default)]
    pub notes: OrderNotes,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Check if gateway credentials are set.
    pub fn is_configured(&self) -> bool {
        !self.config.key_id.is_empty() && !self.config.key_secret.expose_secret().is_empty()
    }

    pub fn key_id(&self) -> &str {
        &self.config.key_id
    }

    /// Whether webhook authentication is enabled at all. With no secret
    /// configured, signature verification is skipped.
    pub fn webhook_secret_configured(&self) -> bool {
        !self.config.webhook_secret.expose_secret().is_empty()
    }

    /// Create a new order with the gateway.
    ///
    /// The notes travel with the order and come back on every webhook, which
    /// is how a payment event is tied back to a user and plan.
    pub async fn create_order(
        &self,
        amount: i64,
        currency: &str,
        receipt: Option<String>,
        notes: OrderNotes,
    ) -> Result<GatewayOrder> {
        if !self.is_configured() {
            return Err(anyhow!("Gateway credentials not configured"));
        }

        let request = CreateOrderRequest {
            amount,
            currency: currency.to_string(),
            receipt,
            notes,
        };

        let url = format!("{}/orders", self.config.api_base_url);

        let response = self
            .client
            .post(&url)
            .basic_auth(
                &self.config.key_id,
                Some(self.config.key_secret.expose_secret()),
            )
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(status = %status, body = %body, "Gateway create_order response");

        if status.is_success() {
            let order: GatewayOrder = serde_json::from_str(&body)?;
            tracing::info!(
                order_id = %order.id,
                amount = order.amount,
                currency = %order.currency,
                "Gateway order created"
            );
            Ok(order)
        } else {
            let error: GatewayError = serde_json::from_str(&body).unwrap_or_else(|_| GatewayError {
                error: GatewayErrorDetail {
                    code: "UNKNOWN".to_string(),
                    description: body.clone(),
                },
            });
            tracing::error!(
                code = %error.error.code,
                description = %error.error.description,
                "Gateway order creation failed"
            );
            Err(anyhow!(
                "Gateway error: {} - {}",
                error.error.code,
                error.error.description
            ))
        }
    }

    /// Verify a webhook signature: HMAC-SHA256 over the raw body against the
    /// configured webhook secret, compared in constant time.
    pub fn verify_webhook_signature(&self, body: &str, signature: &str) -> Result<bool> {
        let is_valid = verify_payload(
            self.config.webhook_secret.expose_secret(),
            body,
            signature,
        )?;

        if !is_valid {
            tracing::warn!("Webhook signature verification failed");
        }

        Ok(is_valid)
    }

    /// Parse a webhook event from the raw request body.
    pub fn parse_webhook_event(&self, body: &str) -> Result<WebhookEvent> {
        let event: WebhookEvent = serde_json::from_str(body)?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;
    use service_core::utils::signature::sign_payload;

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            key_id: "gw_test_123".to_string(),
            key_secret: Secret::new("test_secret".to_string()),
            webhook_secret: Secret::new("webhook_secret".to_string()),
            api_base_url: "https://api.razorpay.com/v1".to_string(),
        }
    }

    #[test]
    fn test_is_configured() {
        let client = GatewayClient::new(test_config());
        assert!(client.is_configured());

        let empty_config = GatewayConfig {
            key_id: "".to_string(),
            key_secret: Secret::new("".to_string()),
            webhook_secret: Secret::new("".to_string()),
            api_base_url: "".to_string(),
        };
        let client = GatewayClient::new(empty_config);
        assert!(!client.is_configured());
    }

    #[test]
    fn test_webhook_signature_verification() {
        let client = GatewayClient::new(test_config());

        let body = r#"{"event":"payment.captured"}"#;
        let signature = sign_payload("webhook_secret", body).unwrap();

        assert!(client.verify_webhook_signature(body, &signature).unwrap());
    }

    #[test]
    fn test_invalid_webhook_signature() {
        let client = GatewayClient::new(test_config());

        let body = r#"{"event":"payment.captured"}"#;
        assert!(!client
            .verify_webhook_signature(body, "invalid_signature")
            .unwrap());
    }

    #[test]
    fn test_parse_webhook_event() {
        let client = GatewayClient::new(test_config());

        let body = r#"{
            "event": "payment.captured",
            "payload": {
                "payment": {
                    "entity": {
                        "id": "pay_123",
                        "amount": 15000,
                        "currency": "INR",
                        "status": "captured",
                        "order_id": "order_456",
                        "notes": { "userId": "user-1" }
                    }
                }
            }
        }"#;

        let event = client.parse_webhook_event(body).unwrap();
        assert_eq!(event.event, "payment.captured");
        let payment = &event.payload.payment.unwrap().entity;
        assert_eq!(payment.id, "pay_123");
        assert_eq!(payment.amount, 15000);
        assert_eq!(payment.order_id.as_deref(), Some("order_456"));
        assert_eq!(payment.notes.user_id.as_deref(), Some("user-1"));
    }
}
