//! Expiry sweep: lapse overdue subscriptions and repair cache drift.

use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::error::AppError;

use crate::services::metrics::record_sweep_transition;
use crate::services::repository::BillingRepository;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SweepReport {
    pub expired_subscriptions: u64,
    pub caches_flagged: u64,
    pub drift_repaired: u64,
}

#[derive(Clone)]
pub struct ExpirySweeper {
    repo: BillingRepository,
}

impl ExpirySweeper {
    pub fn new(repo: BillingRepository) -> Self {
        Self { repo }
    }

    /// One sweep pass. Idempotent and safe to run concurrently with webhook
    /// processing: subscription status only ever moves forward, and every
    /// update here is conditional.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<SweepReport, AppError> {
        let mut report = SweepReport::default();

        for subscription in self.repo.find_due_subscriptions(now).await? {
            if self.repo.expire_subscription(subscription.id).await? {
                report.expired_subscriptions += 1;
                record_sweep_transition("subscription_expired");
                if self
                    .repo
                    .mark_access_expired_if_due(&subscription.user_id, subscription.end_date)
                    .await?
                {
                    report.caches_flagged += 1;
                }
            }
        }

        // Caches that say expired-by-date but were never flagged, e.g. when a
        // previous sweep died between the ledger write and the cache write.
        for cache in self.repo.find_drifted_caches(now).await? {
            if let Some(expires_at) = cache.access_expires_at {
                if self
                    .repo
                    .mark_access_expired_if_due(&cache.user_id, expires_at)
                    .await?
                {
                    report.drift_repaired += 1;
                    record_sweep_transition("cache_drift_repaired");
                }
            }
        }

        tracing::info!(
            expired = report.expired_subscriptions,
            caches_flagged = report.caches_flagged,
            drift_repaired = report.drift_repaired,
            "Expiry sweep completed"
        );

        Ok(report)
    }
}
