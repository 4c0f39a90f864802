//! Checkout initiation: one gateway order paired with one pending
//! transaction row.

use anyhow::anyhow;
use chrono::Utc;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{Plan, Transaction, TransactionStatus};
use crate::services::gateway::{GatewayClient, GatewayOrder, OrderNotes};
use crate::services::repository::BillingRepository;

#[derive(Clone)]
pub struct TransactionLedger {
    repo: BillingRepository,
    gateway: GatewayClient,
}

impl TransactionLedger {
    pub fn new(repo: BillingRepository, gateway: GatewayClient) -> Self {
        Self { repo, gateway }
    }

    /// Create a gateway order and the pending transaction that tracks it.
    ///
    /// The remote order is created first; if the local write then fails, the
    /// order id is logged loudly so the eventual webhook lands on the orphan
    /// path instead of disappearing.
    pub async fn create_pending_transaction(
        &self,
        user_id: &str,
        plan: &Plan,
    ) -> Result<(Transaction, GatewayOrder), AppError> {
        if !plan.is_active {
            return Err(AppError::BadRequest(anyhow!(
                "Plan '{}' is not available for purchase",
                plan.slug
            )));
        }
        if plan.is_free() || plan.final_price_amount == 0 {
            return Err(AppError::BadRequest(anyhow!(
                "The free plan cannot be purchased"
            )));
        }

        let transaction_id = Uuid::new_v4();
        let notes = OrderNotes {
            user_id: Some(user_id.to_string()),
            plan_id: Some(plan.id),
        };

        let order = self
            .gateway
            .create_order(
                plan.final_price_amount,
                &plan.currency,
                Some(transaction_id.to_string()),
                notes,
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, plan_id = %plan.id, "Failed to create gateway order");
                AppError::BadGateway(format!("Failed to create payment order: {}", e))
            })?;

        let now = Utc::now();
        let transaction = Transaction {
            id: transaction_id,
            user_id: Some(user_id.to_string()),
            plan_id: Some(plan.id),
            requested_amount: plan.final_price_amount,
            paid_amount: None,
            currency: plan.currency.clone(),
            gateway_order_id: order.id.clone(),
            gateway_payment_id: None,
            status: TransactionStatus::Created,
            is_discrepant: false,
            is_orphan: false,
            raw_webhook: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.repo.create_transaction(&transaction).await {
            // The remote order exists but the ledger row does not: any webhook
            // for it will be held as an orphan rather than lost.
            tracing::error!(
                order_id = %order.id,
                transaction_id = %transaction_id,
                error = %e,
                "Transaction write failed after gateway order creation; order left for orphan reconciliation"
            );
            return Err(e);
        }

        tracing::info!(
            transaction_id = %transaction.id,
            order_id = %order.id,
            user_id = %user_id,
            amount = transaction.requested_amount,
            "Pending transaction created"
        );

        Ok((transaction, order))
    }

    pub async fn list_transactions(
        &self,
        filter: &crate::models::ListTransactionsFilter,
    ) -> Result<(Vec<Transaction>, i64), AppError> {
        self.repo.list_transactions(filter).await
    }
}
