//! Payment transaction ledger model.

use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Created,
    Authorized,
    Captured,
    Failed,
}

/// One row per payment attempt, keyed by the gateway's order id.
///
/// Rows are created at checkout and mutated only by the reconciliation path.
/// They are never deleted; the raw webhook body is retained verbatim for
/// forensic replay.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Transaction {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub user_id: Option<String>,
    /// Nullable: a payment may arrive referencing an unknown or stale plan.
    pub plan_id: Option<Uuid>,
    pub requested_amount: i64,
    pub paid_amount: Option<i64>,
    pub currency: String,
    /// The gateway order id, the idempotency key. One transaction per order.
    pub gateway_order_id: String,
    pub gateway_payment_id: Option<String>,
    pub status: TransactionStatus,
    /// Paid amount differed from the requested amount. Blocks automatic
    /// subscription creation until an admin intervenes.
    pub is_discrepant: bool,
    /// Created from a webhook with no matching pending transaction. Held for
    /// manual review, never auto-escalated to a subscription.
    pub is_orphan: bool,
    pub raw_webhook: Option<String>,
    /// Absent rather than null when empty so dotted `$set` paths can create it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// A transaction the automatic path refused to resolve.
    pub fn needs_review(&self) -> bool {
        self.is_discrepant || self.is_orphan
    }
}

/// Filter parameters for the admin transaction listing.
#[derive(Debug, Clone, Default)]
pub struct ListTransactionsFilter {
    pub is_discrepant: Option<bool>,
    pub user_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: u64,
}
