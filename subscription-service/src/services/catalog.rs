//! Plan catalog: listing, creation and versioned updates.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use mongodb::bson::{self, Document};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{
    BillingType, CreatePlanInput, Plan, PlanFeatures, UpdatePlanInput, FREE_PLAN_SLUG,
};
use crate::services::repository::BillingRepository;

const SLUG_MIN_LEN: usize = 2;
const SLUG_MAX_LEN: usize = 50;

/// Validate a human-chosen plan slug: lowercase alphanumeric plus hyphen,
/// 2-50 chars, with the reserved `"free"` slug rejected.
pub fn validate_slug(slug: &str) -> Result<(), AppError> {
    if slug.len() < SLUG_MIN_LEN || slug.len() > SLUG_MAX_LEN {
        return Err(AppError::BadRequest(anyhow!(
            "Slug must be between {} and {} characters",
            SLUG_MIN_LEN,
            SLUG_MAX_LEN
        )));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(AppError::BadRequest(anyhow!(
            "Slug may only contain lowercase letters, digits and hyphens"
        )));
    }
    if slug == FREE_PLAN_SLUG {
        return Err(AppError::BadRequest(anyhow!(
            "The slug '{}' is reserved",
            FREE_PLAN_SLUG
        )));
    }
    Ok(())
}

fn validate_pricing(final_price_amount: i64, markup_amount: Option<i64>) -> Result<(), AppError> {
    if final_price_amount < 0 {
        return Err(AppError::BadRequest(anyhow!(
            "Price must not be negative"
        )));
    }
    if let Some(markup) = markup_amount {
        if markup < final_price_amount {
            return Err(AppError::BadRequest(anyhow!(
                "Markup amount must cover the final price"
            )));
        }
    }
    Ok(())
}

fn validate_billing(billing: &BillingType) -> Result<(), AppError> {
    match billing {
        BillingType::DurationDays { days } if *days < 1 => Err(AppError::BadRequest(anyhow!(
            "Duration must be at least one day"
        ))),
        _ => Ok(()),
    }
}

/// Display discount derived from the strikethrough markup price, rounded to
/// the nearest whole percent. None when there is no markup to discount from.
pub fn discount_percent(final_price_amount: i64, markup_amount: Option<i64>) -> Option<i64> {
    let markup = markup_amount?;
    if markup <= 0 || markup < final_price_amount {
        return None;
    }
    let fraction = (markup - final_price_amount) as f64 / markup as f64;
    Some((fraction * 100.0).round() as i64)
}

/// The seeded free tier: zero price, attempted-only archive. Billing fields
/// are immutable from the moment this row lands.
pub fn free_plan_seed(now: DateTime<Utc>) -> Plan {
    Plan {
        id: Uuid::new_v4(),
        name: "Free".to_string(),
        slug: FREE_PLAN_SLUG.to_string(),
        currency: "INR".to_string(),
        final_price_amount: 0,
        markup_amount: None,
        billing: BillingType::DurationDays { days: 0 },
        features: PlanFeatures::default(),
        is_active: true,
        version: 1,
        created_at: now,
        updated_at: now,
    }
}

#[derive(Clone)]
pub struct PlanCatalog {
    repo: BillingRepository,
}

impl PlanCatalog {
    pub fn new(repo: BillingRepository) -> Self {
        Self { repo }
    }

    pub async fn list_active_plans(&self) -> Result<Vec<Plan>, AppError> {
        self.repo.list_active_plans().await
    }

    pub async fn get_plan(&self, id: Uuid) -> Result<Plan, AppError> {
        self.repo
            .get_plan(id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Plan not found")))
    }

    pub async fn create_plan(&self, input: CreatePlanInput) -> Result<Plan, AppError> {
        validate_slug(&input.slug)?;
        validate_pricing(input.final_price_amount, input.markup_amount)?;
        validate_billing(&input.billing)?;

        let now = Utc::now();
        let plan = Plan {
            id: Uuid::new_v4(),
            name: input.name,
            slug: input.slug,
            currency: input.currency,
            final_price_amount: input.final_price_amount,
            markup_amount: input.markup_amount,
            billing: input.billing,
            features: input.features,
            is_active: true,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.repo.create_plan(&plan).await?;

        tracing::info!(plan_id = %plan.id, slug = %plan.slug, "Plan created");
        Ok(plan)
    }

    /// Re-validate the merged plan and apply the patch with a version bump.
    /// No partial writes: every rule is checked before anything is persisted.
    pub async fn update_plan(&self, id: Uuid, patch: UpdatePlanInput) -> Result<Plan, AppError> {
        let current = self.get_plan(id).await?;

        if let Some(ref slug) = patch.slug {
            if current.is_free() {
                return Err(AppError::PolicyViolation(
                    "The free plan's slug is immutable".to_string(),
                ));
            }
            validate_slug(slug)?;
        }
        if current.is_free() && patch.touches_billing_fields() {
            return Err(AppError::PolicyViolation(
                "The free plan's billing fields are immutable".to_string(),
            ));
        }

        let effective_final = patch
            .final_price_amount
            .unwrap_or(current.final_price_amount);
        let effective_markup = patch.markup_amount.or(current.markup_amount);
        validate_pricing(effective_final, effective_markup)?;
        if let Some(ref billing) = patch.billing {
            validate_billing(billing)?;
        }

        let set = build_patch_document(&patch)?;
        if set.is_empty() {
            return Ok(current);
        }

        let updated = self
            .repo
            .update_plan(id, set)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Plan not found")))?;

        tracing::info!(plan_id = %updated.id, version = updated.version, "Plan updated");
        Ok(updated)
    }

    pub async fn deactivate_plan(&self, id: Uuid) -> Result<Plan, AppError> {
        let current = self.get_plan(id).await?;
        if current.is_free() {
            return Err(AppError::PolicyViolation(
                "The free plan cannot be deactivated".to_string(),
            ));
        }
        self.repo
            .set_plan_active(id, false)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Plan not found")))
    }

    pub async fn delete_plan(&self, id: Uuid) -> Result<(), AppError> {
        let current = self.get_plan(id).await?;
        if current.is_free() {
            return Err(AppError::PolicyViolation(
                "The free plan cannot be deleted".to_string(),
            ));
        }
        if !self.repo.delete_plan(id).await? {
            return Err(AppError::NotFound(anyhow!("Plan not found")));
        }
        tracing::info!(plan_id = %id, slug = %current.slug, "Plan deleted");
        Ok(())
    }
}

fn build_patch_document(patch: &UpdatePlanInput) -> Result<Document, AppError> {
    let mut set = Document::new();
    if let Some(ref name) = patch.name {
        set.insert("name", name.as_str());
    }
    if let Some(ref slug) = patch.slug {
        set.insert("slug", slug.as_str());
    }
    if let Some(ref currency) = patch.currency {
        set.insert("currency", currency.as_str());
    }
    if let Some(final_price) = patch.final_price_amount {
        set.insert("final_price_amount", final_price);
    }
    if let Some(markup) = patch.markup_amount {
        set.insert("markup_amount", markup);
    }
    if let Some(ref billing) = patch.billing {
        set.insert(
            "billing",
            bson::to_bson(billing).map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?,
        );
    }
    if let Some(ref features) = patch.features {
        set.insert(
            "features",
            bson::to_bson(features).map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?,
        );
    }
    Ok(set)
}
