//! Purchasable plan model.

use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Slug reserved for the built-in free tier. The free plan's billing fields
/// are immutable and the plan itself can never be deleted.
pub const FREE_PLAN_SLUG: &str = "free";

/// How a subscription's end date is derived from its start date.
///
/// `access_until` round-trips as an RFC 3339 string; end dates are computed
/// in Rust, never range-queried in the store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingType {
    /// Fixed number of days of access from the start date.
    DurationDays { days: i64 },
    /// Access until a fixed calendar date, clamped to be >= the start date.
    TillDate { access_until: DateTime<Utc> },
}

/// Which archive resources a plan unlocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArchiveAccess {
    /// Only resources the user has already attempted.
    AttemptedOnly,
    /// Attempted resources, plus anything dated within `days` of the
    /// subscription start (inclusive).
    Window { days: i64 },
    /// The full archive.
    All,
}

/// Where detailed feedback is withheld for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackScope {
    Archive,
    Everywhere,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackLock {
    pub enabled: bool,
    pub scope: FeedbackScope,
}

/// Optional per-day usage caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyLimits {
    pub max_tests: Option<u32>,
    pub max_archive_views: Option<u32>,
}

/// Feature flags resolved from the user's plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanFeatures {
    pub archive: ArchiveAccess,
    pub feedback_lock: FeedbackLock,
    pub daily_limits: Option<DailyLimits>,
}

impl Default for PlanFeatures {
    fn default() -> Self {
        Self {
            archive: ArchiveAccess::AttemptedOnly,
            feedback_lock: FeedbackLock {
                enabled: false,
                scope: FeedbackScope::Archive,
            },
            daily_limits: None,
        }
    }
}

/// Purchasable plan.
///
/// `final_price_amount` is the authoritative charge amount in the smallest
/// currency unit. `markup_amount` is display-only strikethrough pricing and
/// must always cover the final price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub currency: String,
    pub final_price_amount: i64,
    pub markup_amount: Option<i64>,
    pub billing: BillingType,
    pub features: PlanFeatures,
    pub is_active: bool,
    /// Monotonic version counter, incremented on every update.
    pub version: i64,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.slug == FREE_PLAN_SLUG
    }
}

/// Input for creating a plan.
#[derive(Debug, Clone)]
pub struct CreatePlanInput {
    pub name: String,
    pub slug: String,
    pub currency: String,
    pub final_price_amount: i64,
    pub markup_amount: Option<i64>,
    pub billing: BillingType,
    pub features: PlanFeatures,
}

/// Input for updating a plan. Absent fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdatePlanInput {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub currency: Option<String>,
    pub final_price_amount: Option<i64>,
    pub markup_amount: Option<i64>,
    pub billing: Option<BillingType>,
    pub features: Option<PlanFeatures>,
}

impl UpdatePlanInput {
    /// True when the patch touches pricing or billing semantics, which are
    /// immutable on the free plan.
    pub fn touches_billing_fields(&self) -> bool {
        self.currency.is_some()
            || self.final_price_amount.is_some()
            || self.markup_amount.is_some()
            || self.billing.is_some()
    }
}
