//! Denormalized per-user access cache.

use super::bson_datetime_opt;
use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Read-through cache of the user's current plan and expiry, plus the
/// pending-review list fed by the orphan/discrepancy paths.
///
/// Invariant: re-derivable from the latest non-revoked subscription. Refreshed
/// synchronously on every subscription mutation and asynchronously by the
/// expiry sweep. Never the source of truth for access decisions.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserAccess {
    #[serde(rename = "_id")]
    pub user_id: String,
    pub plan_id: Option<Uuid>,
    pub plan_slug: Option<String>,
    #[serde(with = "bson_datetime_opt")]
    pub access_started_at: Option<DateTime<Utc>>,
    #[serde(with = "bson_datetime_opt")]
    pub access_expires_at: Option<DateTime<Utc>>,
    pub is_expired: bool,
    /// Gateway payment ids held for manual review.
    #[serde(default)]
    pub pending_payment_ids: Vec<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl UserAccess {
    /// Whether the cached access window still extends past `now`. Used to
    /// decide if a renewal appends to the current period instead of starting
    /// a fresh one.
    pub fn has_future_access(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired && self.access_expires_at.map_or(false, |e| e > now)
    }
}
