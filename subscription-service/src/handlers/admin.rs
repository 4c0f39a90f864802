//! Admin reconciliation console: manual grants, extension, revocation,
//! transaction inspection and the on-demand sweep.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    ListTransactionsFilter, Subscription, SubscriptionStatus, Transaction, TransactionStatus,
};
use crate::services::sweep::SweepReport;
use crate::startup::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct AssignSubscriptionRequest {
    #[validate(length(min = 1, message = "User id is required"))]
    pub user_id: String,
    pub plan_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub start_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ExtendSubscriptionRequest {
    #[validate(range(min = 1, max = 3650, message = "Days must be between 1 and 3650"))]
    pub days: i64,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub id: Uuid,
    pub user_id: String,
    pub plan_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub status: SubscriptionStatus,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(s: Subscription) -> Self {
        Self {
            id: s.id,
            user_id: s.user_id,
            plan_id: s.plan_id,
            transaction_id: s.transaction_id,
            start_date: s.start_date,
            end_date: s.end_date,
            status: s.status,
        }
    }
}

pub async fn assign_subscription(
    State(state): State<AppState>,
    Json(payload): Json<AssignSubscriptionRequest>,
) -> Result<(StatusCode, Json<SubscriptionResponse>), AppError> {
    payload.validate()?;

    let subscription = state
        .subscriptions
        .assign(
            &payload.user_id,
            payload.plan_id,
            payload.transaction_id,
            payload.start_date,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(subscription.into())))
}

pub async fn extend_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(payload): Json<ExtendSubscriptionRequest>,
) -> Result<Json<SubscriptionResponse>, AppError> {
    payload.validate()?;

    let subscription = state.subscriptions.extend(&user_id, payload.days).await?;
    Ok(Json(subscription.into()))
}

#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub user_id: String,
    pub revoked_count: u64,
}

pub async fn revoke_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<RevokeResponse>, AppError> {
    let revoked_count = state.subscriptions.revoke(&user_id).await?;
    Ok(Json(RevokeResponse {
        user_id,
        revoked_count,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    pub is_discrepant: Option<bool>,
    pub user_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub plan_id: Option<Uuid>,
    pub requested_amount: i64,
    pub paid_amount: Option<i64>,
    pub currency: String,
    pub gateway_order_id: String,
    pub gateway_payment_id: Option<String>,
    pub status: TransactionStatus,
    pub is_discrepant: bool,
    pub is_orphan: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Transaction> for TransactionResponse {
    fn from(t: Transaction) -> Self {
        Self {
            id: t.id,
            user_id: t.user_id,
            plan_id: t.plan_id,
            requested_amount: t.requested_amount,
            paid_amount: t.paid_amount,
            currency: t.currency,
            gateway_order_id: t.gateway_order_id,
            gateway_payment_id: t.gateway_payment_id,
            status: t.status,
            is_discrepant: t.is_discrepant,
            is_orphan: t.is_orphan,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TransactionListResponse {
    pub transactions: Vec<TransactionResponse>,
    pub total_count: i64,
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<TransactionListResponse>, AppError> {
    let filter = ListTransactionsFilter {
        is_discrepant: query.is_discrepant,
        user_id: query.user_id,
        from: query.from,
        to: query.to,
        limit: query.limit.unwrap_or(50).clamp(1, 200),
        offset: query.offset.unwrap_or(0),
    };

    let (transactions, total_count) = state.ledger.list_transactions(&filter).await?;

    Ok(Json(TransactionListResponse {
        transactions: transactions
            .into_iter()
            .map(TransactionResponse::from)
            .collect(),
        total_count,
    }))
}

pub async fn run_sweep(State(state): State<AppState>) -> Result<Json<SweepReport>, AppError> {
    let report = state.sweeper.run(Utc::now()).await?;
    Ok(Json(report))
}
