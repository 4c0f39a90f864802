//! Webhook reconciliation engine.
//!
//! Delivery is at-least-once and may arrive out of order relative to order
//! creation, so every path here must be idempotent. Anomalies (orphans,
//! discrepancies) are held for manual review and acknowledged; they are never
//! resolved automatically in the user's favor, and never bounced back to the
//! gateway to retry.

use anyhow::anyhow;
use chrono::Utc;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{Transaction, TransactionStatus};
use crate::services::gateway::{GatewayClient, PaymentEntity};
use crate::services::metrics::record_webhook_event;
use crate::services::repository::BillingRepository;
use crate::services::subscriptions::SubscriptionManager;

/// A captured-payment event, normalized from the webhook envelope.
#[derive(Debug, Clone)]
pub struct CapturedPayment {
    pub order_id: String,
    pub payment_id: String,
    pub amount: i64,
    pub user_id: Option<String>,
    pub plan_id: Option<Uuid>,
}

/// What the state machine decided to do with a captured-payment event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// No user reference in the notes: consume the event, touch nothing.
    MissingUser,
    /// The transaction was already captured; duplicate delivery.
    Replay,
    /// The transaction is an orphan already under review; stay held.
    HeldOrphan,
    /// No transaction matches the order id; hold a new orphan.
    NewOrphan,
    /// Paid amount differs from what was requested; capture and block.
    Discrepant { expected: i64, paid: i64 },
    /// Amounts match; capture and activate.
    CleanCapture,
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::MissingUser => "missing_user",
            Disposition::Replay => "replay",
            Disposition::HeldOrphan => "held_orphan",
            Disposition::NewOrphan => "new_orphan",
            Disposition::Discrepant { .. } => "discrepant",
            Disposition::CleanCapture => "clean_capture",
        }
    }
}

/// Classify a captured-payment event against the ledger row for its order id.
///
/// Discrepancy is exact amount inequality, deliberately without any tolerance
/// band or currency-aware rounding.
pub fn classify(existing: Option<&Transaction>, event: &CapturedPayment) -> Disposition {
    if event.user_id.is_none() {
        return Disposition::MissingUser;
    }
    match existing {
        Some(tx) if tx.status == TransactionStatus::Captured => Disposition::Replay,
        Some(tx) if tx.is_orphan => Disposition::HeldOrphan,
        None => Disposition::NewOrphan,
        Some(tx) if event.amount != tx.requested_amount => Disposition::Discrepant {
            expected: tx.requested_amount,
            paid: event.amount,
        },
        Some(_) => Disposition::CleanCapture,
    }
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    repo: BillingRepository,
    gateway: GatewayClient,
    subscriptions: SubscriptionManager,
}

impl ReconciliationEngine {
    pub fn new(
        repo: BillingRepository,
        gateway: GatewayClient,
        subscriptions: SubscriptionManager,
    ) -> Self {
        Self {
            repo,
            gateway,
            subscriptions,
        }
    }

    /// Handle one webhook delivery end to end.
    ///
    /// Everything past signature verification acknowledges the event, even on
    /// anomalies; a rejected delivery would only come back in a retry storm.
    pub async fn handle_event(
        &self,
        raw_body: &str,
        signature: Option<&str>,
    ) -> Result<(), AppError> {
        if self.gateway.webhook_secret_configured() {
            let signature = signature.ok_or_else(|| {
                tracing::warn!("Missing webhook signature header");
                AppError::Unauthorized(anyhow!("Missing webhook signature"))
            })?;
            let is_valid = self
                .gateway
                .verify_webhook_signature(raw_body, signature)
                .map_err(|e| {
                    tracing::error!(error = %e, "Webhook signature verification error");
                    AppError::InternalError(anyhow!("Webhook verification failed"))
                })?;
            if !is_valid {
                return Err(AppError::Unauthorized(anyhow!("Invalid webhook signature")));
            }
        }

        let event = match self.gateway.parse_webhook_event(raw_body) {
            Ok(event) => event,
            Err(e) => {
                // Malformed payloads are consumed, not bounced: a retry would
                // deliver the same bytes forever.
                tracing::warn!(error = %e, "Unparseable webhook payload acknowledged");
                record_webhook_event("unparseable");
                return Ok(());
            }
        };

        let Some(payment) = event.payload.payment.map(|p| p.entity) else {
            tracing::debug!(event_type = %event.event, "Webhook without payment entity");
            return Ok(());
        };

        match event.event.as_str() {
            "payment.captured" => self.handle_captured(payment, raw_body).await,
            "payment.authorized" => self.handle_authorized(payment, raw_body).await,
            "payment.failed" => self.handle_failed(payment, raw_body).await,
            other => {
                tracing::debug!(event_type = %other, "Unhandled webhook event type");
                Ok(())
            }
        }
    }

    async fn handle_authorized(
        &self,
        payment: PaymentEntity,
        raw_body: &str,
    ) -> Result<(), AppError> {
        if let Some(ref order_id) = payment.order_id {
            self.repo
                .mark_authorized(order_id, &payment.id, raw_body)
                .await?;
            tracing::info!(
                order_id = %order_id,
                payment_id = %payment.id,
                "Payment authorized"
            );
        }
        record_webhook_event("authorized");
        Ok(())
    }

    async fn handle_failed(&self, payment: PaymentEntity, raw_body: &str) -> Result<(), AppError> {
        if let Some(ref order_id) = payment.order_id {
            self.repo.mark_failed(order_id, raw_body).await?;
            tracing::info!(
                order_id = %order_id,
                payment_id = %payment.id,
                "Payment failed"
            );
        }
        record_webhook_event("failed");
        Ok(())
    }

    async fn handle_captured(
        &self,
        payment: PaymentEntity,
        raw_body: &str,
    ) -> Result<(), AppError> {
        let Some(order_id) = payment.order_id.clone() else {
            tracing::warn!(payment_id = %payment.id, "Captured payment without an order id");
            record_webhook_event("no_order");
            return Ok(());
        };

        let captured = CapturedPayment {
            order_id,
            payment_id: payment.id,
            amount: payment.amount,
            user_id: payment.notes.user_id,
            plan_id: payment.notes.plan_id,
        };

        let existing = self
            .repo
            .get_transaction_by_order_id(&captured.order_id)
            .await?;
        let disposition = classify(existing.as_ref(), &captured);
        record_webhook_event(disposition.label());

        match disposition {
            Disposition::MissingUser => {
                tracing::warn!(
                    order_id = %captured.order_id,
                    payment_id = %captured.payment_id,
                    "Captured payment carries no user reference; acknowledged without action"
                );
                Ok(())
            }
            Disposition::Replay => {
                tracing::debug!(
                    order_id = %captured.order_id,
                    "Replayed capture for an already-captured transaction"
                );
                Ok(())
            }
            Disposition::HeldOrphan => self.park_on_held_orphan(&captured).await,
            Disposition::NewOrphan => self.hold_new_orphan(&captured, raw_body).await,
            Disposition::Discrepant { expected, paid } => {
                self.capture_discrepant(&captured, expected, paid, raw_body)
                    .await
            }
            Disposition::CleanCapture => self.capture_clean(&captured, raw_body).await,
        }
    }

    async fn park_on_held_orphan(&self, captured: &CapturedPayment) -> Result<(), AppError> {
        if let Some(ref user_id) = captured.user_id {
            self.repo
                .append_pending_payment(user_id, &captured.payment_id)
                .await?;
        }
        tracing::warn!(
            order_id = %captured.order_id,
            payment_id = %captured.payment_id,
            "Payment for a held orphan transaction; still held for review"
        );
        Ok(())
    }

    async fn hold_new_orphan(
        &self,
        captured: &CapturedPayment,
        raw_body: &str,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let orphan = Transaction {
            id: Uuid::new_v4(),
            user_id: captured.user_id.clone(),
            plan_id: captured.plan_id,
            requested_amount: 0,
            paid_amount: Some(captured.amount),
            currency: String::new(),
            gateway_order_id: captured.order_id.clone(),
            gateway_payment_id: Some(captured.payment_id.clone()),
            status: TransactionStatus::Created,
            is_discrepant: false,
            is_orphan: true,
            raw_webhook: Some(raw_body.to_string()),
            metadata: Some(serde_json::json!({ "orphan": true, "source": "webhook" })),
            created_at: now,
            updated_at: now,
        };
        let held = self.repo.insert_transaction_if_absent(orphan).await?;

        if let Some(ref user_id) = captured.user_id {
            self.repo
                .append_pending_payment(user_id, &captured.payment_id)
                .await?;
        }

        tracing::warn!(
            order_id = %captured.order_id,
            payment_id = %captured.payment_id,
            transaction_id = %held.id,
            "Orphan payment held for manual review"
        );
        Ok(())
    }

    async fn capture_discrepant(
        &self,
        captured: &CapturedPayment,
        expected: i64,
        paid: i64,
        raw_body: &str,
    ) -> Result<(), AppError> {
        let updated = self
            .repo
            .capture_transaction(
                &captured.order_id,
                captured.amount,
                &captured.payment_id,
                true,
                raw_body,
            )
            .await?;
        if updated.is_none() {
            // Lost the race to a concurrent delivery; nothing left to do.
            tracing::debug!(order_id = %captured.order_id, "Concurrent capture won");
            return Ok(());
        }

        tracing::warn!(
            order_id = %captured.order_id,
            payment_id = %captured.payment_id,
            expected = expected,
            paid = paid,
            "Discrepant payment captured; subscription creation blocked pending review"
        );
        Ok(())
    }

    async fn capture_clean(
        &self,
        captured: &CapturedPayment,
        raw_body: &str,
    ) -> Result<(), AppError> {
        let Some(transaction) = self
            .repo
            .capture_transaction(
                &captured.order_id,
                captured.amount,
                &captured.payment_id,
                false,
                raw_body,
            )
            .await?
        else {
            tracing::debug!(order_id = %captured.order_id, "Concurrent capture won");
            return Ok(());
        };

        let plan = match transaction.plan_id {
            Some(plan_id) => self.repo.get_plan(plan_id).await?,
            None => None,
        };
        let Some(plan) = plan else {
            // Plan vanished or was never known: degrade to an orphan-style
            // hold instead of failing the delivery.
            self.repo.hold_transaction_as_orphan(transaction.id).await?;
            if let Some(ref user_id) = transaction.user_id {
                self.repo
                    .append_pending_payment(user_id, &captured.payment_id)
                    .await?;
            }
            tracing::warn!(
                order_id = %captured.order_id,
                transaction_id = %transaction.id,
                "Captured payment references an unknown plan; held for review"
            );
            return Ok(());
        };

        self.subscriptions
            .activate_from_transaction(&transaction, &plan)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(user: Option<&str>, amount: i64) -> CapturedPayment {
        CapturedPayment {
            order_id: "order_1".to_string(),
            payment_id: "pay_1".to_string(),
            amount,
            user_id: user.map(|u| u.to_string()),
            plan_id: Some(Uuid::new_v4()),
        }
    }

    fn transaction(status: TransactionStatus, requested: i64, is_orphan: bool) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: Uuid::new_v4(),
            user_id: Some("user-1".to_string()),
            plan_id: Some(Uuid::new_v4()),
            requested_amount: requested,
            paid_amount: None,
            currency: "INR".to_string(),
            gateway_order_id: "order_1".to_string(),
            gateway_payment_id: None,
            status,
            is_discrepant: false,
            is_orphan,
            raw_webhook: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn missing_user_short_circuits() {
        let tx = transaction(TransactionStatus::Created, 15000, false);
        assert_eq!(
            classify(Some(&tx), &event(None, 15000)),
            Disposition::MissingUser
        );
        assert_eq!(classify(None, &event(None, 15000)), Disposition::MissingUser);
    }

    #[test]
    fn replay_of_captured_transaction() {
        let tx = transaction(TransactionStatus::Captured, 15000, false);
        assert_eq!(
            classify(Some(&tx), &event(Some("user-1"), 15000)),
            Disposition::Replay
        );
    }

    #[test]
    fn held_orphan_stays_held() {
        // An orphan's requested amount is zero; the mismatch must not be
        // reclassified as a discrepancy.
        let tx = transaction(TransactionStatus::Created, 0, true);
        assert_eq!(
            classify(Some(&tx), &event(Some("user-1"), 15000)),
            Disposition::HeldOrphan
        );
    }

    #[test]
    fn unknown_order_becomes_orphan() {
        assert_eq!(
            classify(None, &event(Some("user-1"), 15000)),
            Disposition::NewOrphan
        );
    }

    #[test]
    fn amount_mismatch_is_discrepant() {
        let tx = transaction(TransactionStatus::Created, 15000, false);
        assert_eq!(
            classify(Some(&tx), &event(Some("user-1"), 10000)),
            Disposition::Discrepant {
                expected: 15000,
                paid: 10000
            }
        );
        // Overpayment is just as discrepant as underpayment.
        assert_eq!(
            classify(Some(&tx), &event(Some("user-1"), 20000)),
            Disposition::Discrepant {
                expected: 15000,
                paid: 20000
            }
        );
    }

    #[test]
    fn exact_amount_is_clean() {
        let tx = transaction(TransactionStatus::Created, 15000, false);
        assert_eq!(
            classify(Some(&tx), &event(Some("user-1"), 15000)),
            Disposition::CleanCapture
        );
    }

    #[test]
    fn authorized_transaction_captures_cleanly() {
        let tx = transaction(TransactionStatus::Authorized, 15000, false);
        assert_eq!(
            classify(Some(&tx), &event(Some("user-1"), 15000)),
            Disposition::CleanCapture
        );
    }
}
