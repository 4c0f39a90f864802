//! Checkout initiation handler.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::startup::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CheckoutRequest {
    #[validate(length(min = 1, message = "User id is required"))]
    pub user_id: String,
    pub plan_id: Uuid,
}

/// Everything the client needs to open the gateway's checkout flow.
#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub transaction_id: Uuid,
    pub gateway_order_id: String,
    pub amount: i64,
    pub currency: String,
    pub gateway_key_id: String,
}

pub async fn create_checkout(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutResponse>), AppError> {
    payload.validate()?;

    let plan = state.catalog.get_plan(payload.plan_id).await?;
    let (transaction, order) = state
        .ledger
        .create_pending_transaction(&payload.user_id, &plan)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CheckoutResponse {
            transaction_id: transaction.id,
            gateway_order_id: order.id,
            amount: transaction.requested_amount,
            currency: transaction.currency,
            gateway_key_id: state.gateway.key_id().to_string(),
        }),
    ))
}
