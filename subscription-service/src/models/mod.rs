//! Domain models for subscription-service.

mod plan;
mod subscription;
mod transaction;
mod user_access;

pub use plan::{
    ArchiveAccess, BillingType, CreatePlanInput, DailyLimits, FeedbackLock, FeedbackScope, Plan,
    PlanFeatures, UpdatePlanInput, FREE_PLAN_SLUG,
};
pub use subscription::{Subscription, SubscriptionStatus};
pub use transaction::{ListTransactionsFilter, Transaction, TransactionStatus};
pub use user_access::UserAccess;

/// BSON round-tripping for optional `chrono` datetimes. The driver's
/// `chrono_datetime_as_bson_datetime` helper only covers the non-optional case.
pub(crate) mod bson_datetime_opt {
    use chrono::{DateTime, Utc};
    use mongodb::bson;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.map(bson::DateTime::from_chrono).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<bson::DateTime>::deserialize(deserializer)?.map(|dt| dt.to_chrono()))
    }
}
