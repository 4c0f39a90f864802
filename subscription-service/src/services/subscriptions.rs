//! Subscription lifecycle: activation from captured transactions, manual
//! grants, extension and revocation.

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{
    BillingType, Plan, Subscription, SubscriptionStatus, Transaction, UserAccess, FREE_PLAN_SLUG,
};
use crate::services::metrics::record_activation;
use crate::services::repository::BillingRepository;

/// End date for an access window starting at `start`. A `TillDate` plan whose
/// calendar date already passed clamps to the start date rather than going
/// backwards.
pub fn compute_end(start: DateTime<Utc>, billing: &BillingType) -> DateTime<Utc> {
    match billing {
        BillingType::DurationDays { days } => start + Duration::days(*days),
        BillingType::TillDate { access_until } => (*access_until).max(start),
    }
}

/// Start and end of a new access window.
///
/// A renewal while the cached window still extends into the future appends to
/// it instead of overlapping; anything else starts now.
pub fn compute_period(
    now: DateTime<Utc>,
    cache: Option<&UserAccess>,
    billing: &BillingType,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = cache
        .filter(|c| c.has_future_access(now))
        .and_then(|c| c.access_expires_at)
        .unwrap_or(now);
    (start, compute_end(start, billing))
}

#[derive(Clone)]
pub struct SubscriptionManager {
    repo: BillingRepository,
}

impl SubscriptionManager {
    pub fn new(repo: BillingRepository) -> Self {
        Self { repo }
    }

    /// Turn a cleanly captured transaction into an active subscription.
    ///
    /// Idempotent: a subscription already referencing the transaction is
    /// returned as-is, and the unique index on `transaction_id` collapses
    /// concurrent duplicate webhooks down to one row.
    pub async fn activate_from_transaction(
        &self,
        transaction: &Transaction,
        plan: &Plan,
    ) -> Result<Subscription, AppError> {
        if let Some(existing) = self
            .repo
            .get_subscription_by_transaction(transaction.id)
            .await?
        {
            tracing::debug!(
                transaction_id = %transaction.id,
                subscription_id = %existing.id,
                "Subscription already exists for transaction"
            );
            return Ok(existing);
        }

        let user_id = transaction
            .user_id
            .clone()
            .ok_or_else(|| AppError::BadRequest(anyhow!("Transaction has no user")))?;

        let now = Utc::now();
        let cache = self.repo.get_user_access(&user_id).await?;
        let (start_date, end_date) = compute_period(now, cache.as_ref(), &plan.billing);

        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id: user_id.clone(),
            plan_id: plan.id,
            transaction_id: Some(transaction.id),
            start_date,
            end_date,
            status: SubscriptionStatus::Active,
            created_at: now,
            updated_at: now,
        };
        let created = self.repo.insert_subscription(subscription).await?;

        self.repo
            .apply_access_grant(
                &user_id,
                plan.id,
                &plan.slug,
                created.start_date,
                created.end_date,
            )
            .await?;
        self.repo
            .link_subscription(transaction.id, created.id)
            .await?;

        record_activation(&plan.slug);
        tracing::info!(
            subscription_id = %created.id,
            transaction_id = %transaction.id,
            user_id = %user_id,
            plan_slug = %plan.slug,
            end_date = %created.end_date,
            "Subscription activated"
        );

        Ok(created)
    }

    /// Manually grant a plan to a user (admin reconciliation console).
    ///
    /// When a held transaction id is supplied, the grant resolves it: the
    /// subscription is linked, the hold flags clear, and the payment id comes
    /// off the user's pending-review list.
    pub async fn assign(
        &self,
        user_id: &str,
        plan_id: Uuid,
        transaction_id: Option<Uuid>,
        start_date: Option<DateTime<Utc>>,
    ) -> Result<Subscription, AppError> {
        let plan = self
            .repo
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Plan not found")))?;

        let transaction = match transaction_id {
            Some(id) => {
                let tx = self
                    .repo
                    .get_transaction(id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(anyhow!("Transaction not found")))?;
                if self.repo.get_subscription_by_transaction(id).await?.is_some() {
                    return Err(AppError::Conflict(anyhow!(
                        "Transaction already has a subscription"
                    )));
                }
                Some(tx)
            }
            None => None,
        };

        let now = Utc::now();
        let cache = self.repo.get_user_access(user_id).await?;
        let (start_date, end_date) = match start_date {
            Some(start) => (start, compute_end(start, &plan.billing)),
            None => compute_period(now, cache.as_ref(), &plan.billing),
        };

        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            plan_id: plan.id,
            transaction_id,
            start_date,
            end_date,
            status: SubscriptionStatus::Active,
            created_at: now,
            updated_at: now,
        };
        let created = self.repo.insert_subscription(subscription).await?;

        self.repo
            .apply_access_grant(user_id, plan.id, &plan.slug, start_date, end_date)
            .await?;

        if let Some(tx) = transaction {
            self.repo.link_subscription(tx.id, created.id).await?;
            self.repo.clear_hold_flags(tx.id).await?;
            if let Some(ref payment_id) = tx.gateway_payment_id {
                self.repo.remove_pending_payment(user_id, payment_id).await?;
            }
        }

        tracing::info!(
            subscription_id = %created.id,
            user_id = %user_id,
            plan_slug = %plan.slug,
            manual = true,
            "Subscription assigned"
        );

        Ok(created)
    }

    /// Extend the user's active subscription by a number of days.
    ///
    /// Extension never fabricates a grant: no active subscription, or a free
    /// plan, is a policy violation.
    pub async fn extend(&self, user_id: &str, days: i64) -> Result<Subscription, AppError> {
        if days < 1 {
            return Err(AppError::BadRequest(anyhow!(
                "Extension must be at least one day"
            )));
        }

        let subscription = self
            .repo
            .latest_active_subscription(user_id)
            .await?
            .ok_or_else(|| {
                AppError::PolicyViolation(
                    "Cannot extend: user has no active subscription".to_string(),
                )
            })?;

        let plan = self
            .repo
            .get_plan(subscription.plan_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Plan not found")))?;
        if plan.is_free() {
            return Err(AppError::PolicyViolation(
                "The free plan cannot be extended".to_string(),
            ));
        }

        let new_end = subscription.end_date + Duration::days(days);
        let updated = self
            .repo
            .update_subscription_end(subscription.id, new_end)
            .await?
            .ok_or_else(|| {
                AppError::PolicyViolation(
                    "Subscription is no longer active".to_string(),
                )
            })?;

        self.repo
            .apply_access_grant(
                user_id,
                plan.id,
                &plan.slug,
                updated.start_date,
                updated.end_date,
            )
            .await?;

        tracing::info!(
            subscription_id = %updated.id,
            user_id = %user_id,
            days = days,
            end_date = %updated.end_date,
            "Subscription extended"
        );

        Ok(updated)
    }

    /// Revoke all of the user's active subscriptions and clear the cache.
    ///
    /// A user with nothing to revoke is a no-op success; the cache is still
    /// cleared. Free-tier access is never revocable.
    pub async fn revoke(&self, user_id: &str) -> Result<u64, AppError> {
        let cache = self.repo.get_user_access(user_id).await?;
        if cache
            .as_ref()
            .and_then(|c| c.plan_slug.as_deref())
            .map_or(false, |slug| slug == FREE_PLAN_SLUG)
        {
            return Err(AppError::PolicyViolation(
                "Free plan access cannot be revoked".to_string(),
            ));
        }
        if let Some(subscription) = self.repo.latest_active_subscription(user_id).await? {
            if let Some(plan) = self.repo.get_plan(subscription.plan_id).await? {
                if plan.is_free() {
                    return Err(AppError::PolicyViolation(
                        "Free plan access cannot be revoked".to_string(),
                    ));
                }
            }
        }

        let now = Utc::now();
        let revoked = self.repo.revoke_active_subscriptions(user_id, now).await?;
        self.repo.clear_access(user_id, now).await?;

        tracing::info!(user_id = %user_id, revoked = revoked, "Subscriptions revoked");
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cache(expires: Option<DateTime<Utc>>, is_expired: bool) -> UserAccess {
        UserAccess {
            user_id: "user-1".to_string(),
            plan_id: None,
            plan_slug: None,
            access_started_at: None,
            access_expires_at: expires,
            is_expired,
            pending_payment_ids: vec![],
            updated_at: Utc::now(),
        }
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn fresh_purchase_starts_now() {
        let now = at(2026, 3, 1);
        let (start, end) = compute_period(now, None, &BillingType::DurationDays { days: 7 });
        assert_eq!(start, now);
        assert_eq!(end, now + Duration::days(7));
    }

    #[test]
    fn renewal_appends_to_remaining_access() {
        let now = at(2026, 3, 1);
        let current_end = at(2026, 3, 5);
        let c = cache(Some(current_end), false);
        let (start, end) = compute_period(now, Some(&c), &BillingType::DurationDays { days: 30 });
        assert_eq!(start, current_end);
        assert_eq!(end, current_end + Duration::days(30));
    }

    #[test]
    fn expired_cache_does_not_append() {
        let now = at(2026, 3, 1);
        // Window still in the future on paper, but flagged expired.
        let c = cache(Some(at(2026, 3, 5)), true);
        let (start, _) = compute_period(now, Some(&c), &BillingType::DurationDays { days: 7 });
        assert_eq!(start, now);
    }

    #[test]
    fn lapsed_cache_does_not_append() {
        let now = at(2026, 3, 10);
        let c = cache(Some(at(2026, 3, 5)), false);
        let (start, _) = compute_period(now, Some(&c), &BillingType::DurationDays { days: 7 });
        assert_eq!(start, now);
    }

    #[test]
    fn till_date_clamps_to_start() {
        let start = at(2026, 6, 1);
        let stale = BillingType::TillDate {
            access_until: at(2026, 5, 1),
        };
        assert_eq!(compute_end(start, &stale), start);

        let future = BillingType::TillDate {
            access_until: at(2026, 7, 1),
        };
        assert_eq!(compute_end(start, &future), at(2026, 7, 1));
    }
}
