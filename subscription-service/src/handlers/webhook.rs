//! Gateway webhook ingress.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
};
use service_core::error::AppError;

use crate::startup::AppState;

pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Receive a gateway webhook delivery.
///
/// The raw body is handed to the reconciliation engine untouched; signature
/// verification must happen over the exact bytes that were signed.
pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, AppError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    state.engine.handle_event(&body, signature).await?;

    // Acknowledge receipt; anomalies were recorded, not bounced.
    Ok(StatusCode::OK)
}
