//! Plan catalog handlers: public listing and admin CRUD.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::models::{BillingType, CreatePlanInput, Plan, PlanFeatures, UpdatePlanInput};
use crate::services::catalog::discount_percent;
use crate::startup::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePlanRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: String,
    #[validate(length(min = 2, max = 50, message = "Slug must be 2-50 characters"))]
    pub slug: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub final_price_amount: i64,
    pub markup_amount: Option<i64>,
    pub billing: BillingType,
    pub features: Option<PlanFeatures>,
}

fn default_currency() -> String {
    "INR".to_string()
}

#[derive(Debug, Deserialize, Validate, Default)]
pub struct UpdatePlanRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: Option<String>,
    pub slug: Option<String>,
    pub currency: Option<String>,
    pub final_price_amount: Option<i64>,
    pub markup_amount: Option<i64>,
    pub billing: Option<BillingType>,
    pub features: Option<PlanFeatures>,
}

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub currency: String,
    pub final_price_amount: i64,
    pub markup_amount: Option<i64>,
    pub discount_percent: Option<i64>,
    pub billing: BillingType,
    pub features: PlanFeatures,
    pub is_active: bool,
    pub version: i64,
}

impl From<Plan> for PlanResponse {
    fn from(plan: Plan) -> Self {
        Self {
            id: plan.id,
            name: plan.name,
            slug: plan.slug,
            currency: plan.currency,
            final_price_amount: plan.final_price_amount,
            markup_amount: plan.markup_amount,
            discount_percent: discount_percent(plan.final_price_amount, plan.markup_amount),
            billing: plan.billing,
            features: plan.features,
            is_active: plan.is_active,
            version: plan.version,
        }
    }
}

/// Public listing: active plans sorted by price, with computed discounts.
pub async fn list_plans(State(state): State<AppState>) -> Result<Json<Vec<PlanResponse>>, AppError> {
    let plans = state.catalog.list_active_plans().await?;
    Ok(Json(plans.into_iter().map(PlanResponse::from).collect()))
}

pub async fn create_plan(
    State(state): State<AppState>,
    Json(payload): Json<CreatePlanRequest>,
) -> Result<(StatusCode, Json<PlanResponse>), AppError> {
    payload.validate()?;

    let input = CreatePlanInput {
        name: payload.name,
        slug: payload.slug,
        currency: payload.currency,
        final_price_amount: payload.final_price_amount,
        markup_amount: payload.markup_amount,
        billing: payload.billing,
        features: payload.features.unwrap_or_default(),
    };
    let plan = state.catalog.create_plan(input).await?;

    Ok((StatusCode::CREATED, Json(plan.into())))
}

pub async fn update_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdatePlanRequest>,
) -> Result<Json<PlanResponse>, AppError> {
    payload.validate()?;

    let patch = UpdatePlanInput {
        name: payload.name,
        slug: payload.slug,
        currency: payload.currency,
        final_price_amount: payload.final_price_amount,
        markup_amount: payload.markup_amount,
        billing: payload.billing,
        features: payload.features,
    };
    let plan = state.catalog.update_plan(id, patch).await?;

    Ok(Json(plan.into()))
}

pub async fn deactivate_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PlanResponse>, AppError> {
    let plan = state.catalog.deactivate_plan(id).await?;
    Ok(Json(plan.into()))
}

pub async fn delete_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.catalog.delete_plan(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
