//! Plan-based access resolution for archived resources.
//!
//! Decisions are derived from Plan + Subscription state, never from the user
//! access cache.

use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use service_core::error::AppError;

use crate::models::ArchiveAccess;
use crate::services::repository::BillingRepository;

/// Machine-readable grounds for an allow/deny decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    ScheduledToday,
    Attempted,
    WithinWindow,
    FullArchive,
    NotAttempted,
    OutsideWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: AccessReason,
}

impl AccessDecision {
    fn allow(reason: AccessReason) -> Self {
        Self {
            allowed: true,
            reason,
        }
    }

    fn deny(reason: AccessReason) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

/// The archive rule in force for a user, plus the subscription start date a
/// window is anchored to.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResolvedArchiveRule {
    pub rule: ArchiveAccess,
    pub subscription_start: Option<NaiveDate>,
}

/// Evaluate an archive access request.
///
/// Resources scheduled for today are always allowed, regardless of plan.
/// A window is inclusive on both ends: a resource dated exactly
/// `start + days` is still in.
pub fn evaluate(
    resolved: &ResolvedArchiveRule,
    resource_date: NaiveDate,
    today: NaiveDate,
    attempted: bool,
) -> AccessDecision {
    if resource_date == today {
        return AccessDecision::allow(AccessReason::ScheduledToday);
    }

    match resolved.rule {
        ArchiveAccess::All => AccessDecision::allow(AccessReason::FullArchive),
        ArchiveAccess::AttemptedOnly => {
            if attempted {
                AccessDecision::allow(AccessReason::Attempted)
            } else {
                AccessDecision::deny(AccessReason::NotAttempted)
            }
        }
        ArchiveAccess::Window { days } => {
            if attempted {
                return AccessDecision::allow(AccessReason::Attempted);
            }
            let in_window = resolved.subscription_start.map_or(false, |start| {
                resource_date >= start && resource_date <= start + Duration::days(days)
            });
            if in_window {
                AccessDecision::allow(AccessReason::WithinWindow)
            } else {
                AccessDecision::deny(AccessReason::OutsideWindow)
            }
        }
    }
}

#[derive(Clone)]
pub struct AccessResolver {
    repo: BillingRepository,
}

impl AccessResolver {
    pub fn new(repo: BillingRepository) -> Self {
        Self { repo }
    }

    /// Resolve the archive rule for a user from their latest active
    /// subscription's plan. No plan means attempted-only; there is no other
    /// implicit default.
    pub async fn archive_rule_for(&self, user_id: &str) -> Result<ResolvedArchiveRule, AppError> {
        let Some(subscription) = self.repo.latest_active_subscription(user_id).await? else {
            return Ok(ResolvedArchiveRule {
                rule: ArchiveAccess::AttemptedOnly,
                subscription_start: None,
            });
        };
        let Some(plan) = self.repo.get_plan(subscription.plan_id).await? else {
            tracing::warn!(
                user_id = %user_id,
                plan_id = %subscription.plan_id,
                "Active subscription references a missing plan; treating as attempted-only"
            );
            return Ok(ResolvedArchiveRule {
                rule: ArchiveAccess::AttemptedOnly,
                subscription_start: None,
            });
        };
        Ok(ResolvedArchiveRule {
            rule: plan.features.archive,
            subscription_start: Some(subscription.start_date.date_naive()),
        })
    }

    pub async fn can_access(
        &self,
        user_id: &str,
        resource_date: NaiveDate,
        attempted: bool,
    ) -> Result<(ResolvedArchiveRule, AccessDecision), AppError> {
        let resolved = self.archive_rule_for(user_id).await?;
        let decision = evaluate(&resolved, resource_date, Utc::now().date_naive(), attempted);
        Ok((resolved, decision))
    }
}
