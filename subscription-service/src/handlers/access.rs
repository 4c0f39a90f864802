//! Archive access checks for the content-delivery side.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

use crate::models::ArchiveAccess;
use crate::services::access::AccessReason;
use crate::startup::AppState;

#[derive(Debug, Deserialize)]
pub struct ArchiveAccessQuery {
    pub resource_date: NaiveDate,
    #[serde(default)]
    pub attempted: bool,
}

#[derive(Debug, Serialize)]
pub struct ArchiveAccessResponse {
    pub allowed: bool,
    pub reason: AccessReason,
    pub rule: ArchiveAccess,
}

pub async fn archive_access(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<ArchiveAccessQuery>,
) -> Result<Json<ArchiveAccessResponse>, AppError> {
    let (resolved, decision) = state
        .resolver
        .can_access(&user_id, query.resource_date, query.attempted)
        .await?;

    Ok(Json(ArchiveAccessResponse {
        allowed: decision.allowed,
        reason: decision.reason,
        rule: resolved.rule,
    }))
}
