//! MongoDB persistence layer.
//!
//! Unique indexes are the concurrency backstop for the webhook path: one
//! transaction per gateway order id, and at most one subscription per
//! transaction. Everything that must be race-safe goes through conditional
//! updates or duplicate-key-tolerant inserts here.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    FindOneAndUpdateOptions, FindOneOptions, FindOptions, IndexOptions, ReturnDocument,
    UpdateOptions,
};
use mongodb::{Collection, Database, IndexModel};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{
    ListTransactionsFilter, Plan, Subscription, SubscriptionStatus, Transaction, UserAccess,
};

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == 11000,
        ErrorKind::Command(e) => e.code == 11000,
        _ => false,
    }
}

fn bson_now() -> bson::DateTime {
    bson::DateTime::now()
}

#[derive(Clone)]
pub struct BillingRepository {
    plans: Collection<Plan>,
    transactions: Collection<Transaction>,
    subscriptions: Collection<Subscription>,
    user_access: Collection<UserAccess>,
}

impl BillingRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            plans: db.collection("plans"),
            transactions: db.collection("transactions"),
            subscriptions: db.collection("subscriptions"),
            user_access: db.collection("user_access"),
        }
    }

    /// Initialize database indexes.
    ///
    /// The unique index on `transactions.gateway_order_id` enforces the
    /// one-transaction-per-order invariant; the partial unique index on
    /// `subscriptions.transaction_id` is the check-then-act backstop for
    /// concurrent duplicate webhooks.
    pub async fn init_indexes(&self) -> Result<(), AppError> {
        let slug_index = IndexModel::builder()
            .keys(doc! { "slug": 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .name("plan_slug_idx".to_string())
                    .build(),
            )
            .build();
        self.plans.create_indexes([slug_index], None).await?;

        let order_index = IndexModel::builder()
            .keys(doc! { "gateway_order_id": 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .name("gateway_order_idx".to_string())
                    .build(),
            )
            .build();
        let user_tx_index = IndexModel::builder()
            .keys(doc! { "user_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("user_transaction_idx".to_string())
                    .build(),
            )
            .build();
        let discrepant_index = IndexModel::builder()
            .keys(doc! { "is_discrepant": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("discrepant_transaction_idx".to_string())
                    .build(),
            )
            .build();
        self.transactions
            .create_indexes([order_index, user_tx_index, discrepant_index], None)
            .await?;

        let tx_sub_index = IndexModel::builder()
            .keys(doc! { "transaction_id": 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .partial_filter_expression(doc! { "transaction_id": { "$type": "string" } })
                    .name("subscription_transaction_idx".to_string())
                    .build(),
            )
            .build();
        let user_sub_index = IndexModel::builder()
            .keys(doc! { "user_id": 1, "status": 1, "end_date": -1 })
            .options(
                IndexOptions::builder()
                    .name("user_subscription_idx".to_string())
                    .build(),
            )
            .build();
        let due_sub_index = IndexModel::builder()
            .keys(doc! { "status": 1, "end_date": 1 })
            .options(
                IndexOptions::builder()
                    .name("due_subscription_idx".to_string())
                    .build(),
            )
            .build();
        self.subscriptions
            .create_indexes([tx_sub_index, user_sub_index, due_sub_index], None)
            .await?;

        tracing::info!("Subscription service indexes initialized");
        Ok(())
    }

    // =========================================================================
    // Plans
    // =========================================================================

    /// Seed the reserved free plan if it does not exist yet.
    pub async fn ensure_free_plan(&self, plan: &Plan) -> Result<(), AppError> {
        let seed = bson::to_document(plan)
            .map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?;
        self.plans
            .update_one(
                doc! { "slug": &plan.slug },
                doc! { "$setOnInsert": seed },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    pub async fn create_plan(&self, plan: &Plan) -> Result<(), AppError> {
        self.plans.insert_one(plan, None).await.map_err(|e| {
            if is_duplicate_key(&e) {
                AppError::Conflict(anyhow!("A plan with slug '{}' already exists", plan.slug))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    pub async fn get_plan(&self, id: Uuid) -> Result<Option<Plan>, AppError> {
        Ok(self
            .plans
            .find_one(doc! { "_id": id.to_string() }, None)
            .await?)
    }

    pub async fn get_plan_by_slug(&self, slug: &str) -> Result<Option<Plan>, AppError> {
        Ok(self.plans.find_one(doc! { "slug": slug }, None).await?)
    }

    pub async fn list_active_plans(&self) -> Result<Vec<Plan>, AppError> {
        let options = FindOptions::builder()
            .sort(doc! { "final_price_amount": 1 })
            .build();
        let cursor = self.plans.find(doc! { "is_active": true }, options).await?;
        Ok(cursor.try_collect().await?)
    }

    /// Apply a `$set` patch and bump the version counter atomically.
    pub async fn update_plan(&self, id: Uuid, set: Document) -> Result<Option<Plan>, AppError> {
        let mut set = set;
        set.insert("updated_at", bson_now());
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        self.plans
            .find_one_and_update(
                doc! { "_id": id.to_string() },
                doc! { "$set": set, "$inc": { "version": 1 } },
                options,
            )
            .await
            .map_err(|e| {
                if is_duplicate_key(&e) {
                    AppError::Conflict(anyhow!("A plan with that slug already exists"))
                } else {
                    e.into()
                }
            })
    }

    pub async fn set_plan_active(&self, id: Uuid, active: bool) -> Result<Option<Plan>, AppError> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        Ok(self
            .plans
            .find_one_and_update(
                doc! { "_id": id.to_string() },
                doc! { "$set": { "is_active": active, "updated_at": bson_now() } },
                options,
            )
            .await?)
    }

    pub async fn delete_plan(&self, id: Uuid) -> Result<bool, AppError> {
        let result = self
            .plans
            .delete_one(doc! { "_id": id.to_string() }, None)
            .await?;
        Ok(result.deleted_count > 0)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub async fn create_transaction(&self, transaction: &Transaction) -> Result<(), AppError> {
        self.transactions
            .insert_one(transaction, None)
            .await
            .map_err(|e| {
                if is_duplicate_key(&e) {
                    AppError::Conflict(anyhow!(
                        "A transaction for order '{}' already exists",
                        transaction.gateway_order_id
                    ))
                } else {
                    e.into()
                }
            })?;
        Ok(())
    }

    /// Insert, tolerating a concurrent insert of the same gateway order.
    /// Returns the row that won.
    pub async fn insert_transaction_if_absent(
        &self,
        transaction: Transaction,
    ) -> Result<Transaction, AppError> {
        match self.transactions.insert_one(&transaction, None).await {
            Ok(_) => Ok(transaction),
            Err(e) if is_duplicate_key(&e) => self
                .get_transaction_by_order_id(&transaction.gateway_order_id)
                .await?
                .ok_or_else(|| {
                    AppError::DatabaseError(anyhow!(
                        "Transaction for order '{}' vanished after duplicate-key insert",
                        transaction.gateway_order_id
                    ))
                }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>, AppError> {
        Ok(self
            .transactions
            .find_one(doc! { "_id": id.to_string() }, None)
            .await?)
    }

    pub async fn get_transaction_by_order_id(
        &self,
        order_id: &str,
    ) -> Result<Option<Transaction>, AppError> {
        Ok(self
            .transactions
            .find_one(doc! { "gateway_order_id": order_id }, None)
            .await?)
    }

    /// Transition a transaction to Captured, recording what was actually paid.
    ///
    /// Conditional on not being captured yet, so concurrent duplicate
    /// deliveries collapse: exactly one caller gets the updated row back.
    pub async fn capture_transaction(
        &self,
        order_id: &str,
        paid_amount: i64,
        payment_id: &str,
        is_discrepant: bool,
        raw_webhook: &str,
    ) -> Result<Option<Transaction>, AppError> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        Ok(self
            .transactions
            .find_one_and_update(
                doc! { "gateway_order_id": order_id, "status": { "$ne": "CAPTURED" } },
                doc! { "$set": {
                    "status": "CAPTURED",
                    "paid_amount": paid_amount,
                    "gateway_payment_id": payment_id,
                    "is_discrepant": is_discrepant,
                    "raw_webhook": raw_webhook,
                    "updated_at": bson_now(),
                } },
                options,
            )
            .await?)
    }

    pub async fn mark_authorized(
        &self,
        order_id: &str,
        payment_id: &str,
        raw_webhook: &str,
    ) -> Result<(), AppError> {
        self.transactions
            .update_one(
                doc! { "gateway_order_id": order_id, "status": "CREATED" },
                doc! { "$set": {
                    "status": "AUTHORIZED",
                    "gateway_payment_id": payment_id,
                    "raw_webhook": raw_webhook,
                    "updated_at": bson_now(),
                } },
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, order_id: &str, raw_webhook: &str) -> Result<(), AppError> {
        self.transactions
            .update_one(
                doc! { "gateway_order_id": order_id, "status": { "$ne": "CAPTURED" } },
                doc! { "$set": {
                    "status": "FAILED",
                    "raw_webhook": raw_webhook,
                    "updated_at": bson_now(),
                } },
                None,
            )
            .await?;
        Ok(())
    }

    /// Record the subscription a captured transaction produced.
    pub async fn link_subscription(
        &self,
        transaction_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<(), AppError> {
        self.transactions
            .update_one(
                doc! { "_id": transaction_id.to_string() },
                doc! { "$set": {
                    "metadata.subscription_id": subscription_id.to_string(),
                    "updated_at": bson_now(),
                } },
                None,
            )
            .await?;
        Ok(())
    }

    /// Hold a transaction for manual review when its plan cannot be resolved.
    pub async fn hold_transaction_as_orphan(&self, transaction_id: Uuid) -> Result<(), AppError> {
        self.transactions
            .update_one(
                doc! { "_id": transaction_id.to_string() },
                doc! { "$set": { "is_orphan": true, "updated_at": bson_now() } },
                None,
            )
            .await?;
        Ok(())
    }

    /// Clear the manual-review hold after an admin resolves a transaction.
    pub async fn clear_hold_flags(&self, transaction_id: Uuid) -> Result<(), AppError> {
        self.transactions
            .update_one(
                doc! { "_id": transaction_id.to_string() },
                doc! { "$set": {
                    "is_discrepant": false,
                    "is_orphan": false,
                    "updated_at": bson_now(),
                } },
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn list_transactions(
        &self,
        filter: &ListTransactionsFilter,
    ) -> Result<(Vec<Transaction>, i64), AppError> {
        let mut query = Document::new();
        if let Some(is_discrepant) = filter.is_discrepant {
            query.insert("is_discrepant", is_discrepant);
        }
        if let Some(ref user_id) = filter.user_id {
            query.insert("user_id", user_id.as_str());
        }
        let mut created_range = Document::new();
        if let Some(from) = filter.from {
            created_range.insert("$gte", bson::DateTime::from_chrono(from));
        }
        if let Some(to) = filter.to {
            created_range.insert("$lt", bson::DateTime::from_chrono(to));
        }
        if !created_range.is_empty() {
            query.insert("created_at", created_range);
        }

        let total_count = self
            .transactions
            .count_documents(query.clone(), None)
            .await? as i64;

        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1 })
            .skip(filter.offset)
            .limit(filter.limit)
            .build();
        let cursor = self.transactions.find(query, options).await?;
        let transactions: Vec<Transaction> = cursor.try_collect().await?;

        Ok((transactions, total_count))
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Insert a subscription, tolerating a concurrent insert for the same
    /// transaction. The partial unique index makes the lookup-then-create
    /// pattern safe; the row that won is returned either way.
    pub async fn insert_subscription(
        &self,
        subscription: Subscription,
    ) -> Result<Subscription, AppError> {
        match self.subscriptions.insert_one(&subscription, None).await {
            Ok(_) => Ok(subscription),
            Err(e) if is_duplicate_key(&e) => {
                let transaction_id = subscription.transaction_id.ok_or_else(|| {
                    AppError::DatabaseError(anyhow!(
                        "Duplicate-key insert for a subscription with no transaction"
                    ))
                })?;
                self.get_subscription_by_transaction(transaction_id)
                    .await?
                    .ok_or_else(|| {
                        AppError::DatabaseError(anyhow!(
                            "Subscription for transaction '{}' vanished after duplicate-key insert",
                            transaction_id
                        ))
                    })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_subscription_by_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self
            .subscriptions
            .find_one(doc! { "transaction_id": transaction_id.to_string() }, None)
            .await?)
    }

    pub async fn latest_active_subscription(
        &self,
        user_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let options = FindOneOptions::builder()
            .sort(doc! { "end_date": -1 })
            .build();
        Ok(self
            .subscriptions
            .find_one(
                doc! { "user_id": user_id, "status": SubscriptionStatus::Active.as_str() },
                options,
            )
            .await?)
    }

    pub async fn update_subscription_end(
        &self,
        id: Uuid,
        end_date: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        Ok(self
            .subscriptions
            .find_one_and_update(
                doc! { "_id": id.to_string(), "status": SubscriptionStatus::Active.as_str() },
                doc! { "$set": {
                    "end_date": bson::DateTime::from_chrono(end_date),
                    "updated_at": bson_now(),
                } },
                options,
            )
            .await?)
    }

    pub async fn revoke_active_subscriptions(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = self
            .subscriptions
            .update_many(
                doc! { "user_id": user_id, "status": SubscriptionStatus::Active.as_str() },
                doc! { "$set": {
                    "status": SubscriptionStatus::Revoked.as_str(),
                    "end_date": bson::DateTime::from_chrono(now),
                    "updated_at": bson_now(),
                } },
                None,
            )
            .await?;
        Ok(result.modified_count)
    }

    pub async fn find_due_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError> {
        let cursor = self
            .subscriptions
            .find(
                doc! {
                    "status": SubscriptionStatus::Active.as_str(),
                    "end_date": { "$lt": bson::DateTime::from_chrono(now) },
                },
                None,
            )
            .await?;
        Ok(cursor.try_collect().await?)
    }

    /// Forward-only Active -> Expired transition. Returns false when another
    /// sweep or a revoke already moved the row on.
    pub async fn expire_subscription(&self, id: Uuid) -> Result<bool, AppError> {
        let result = self
            .subscriptions
            .update_one(
                doc! { "_id": id.to_string(), "status": SubscriptionStatus::Active.as_str() },
                doc! { "$set": {
                    "status": SubscriptionStatus::Expired.as_str(),
                    "updated_at": bson_now(),
                } },
                None,
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    // =========================================================================
    // User access cache
    // =========================================================================

    pub async fn get_user_access(&self, user_id: &str) -> Result<Option<UserAccess>, AppError> {
        Ok(self
            .user_access
            .find_one(doc! { "_id": user_id }, None)
            .await?)
    }

    /// Point the cache at a freshly granted or extended access window.
    pub async fn apply_access_grant(
        &self,
        user_id: &str,
        plan_id: Uuid,
        plan_slug: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.user_access
            .update_one(
                doc! { "_id": user_id },
                doc! {
                    "$set": {
                        "plan_id": plan_id.to_string(),
                        "plan_slug": plan_slug,
                        "access_started_at": bson::DateTime::from_chrono(start),
                        "access_expires_at": bson::DateTime::from_chrono(end),
                        "is_expired": false,
                        "updated_at": bson_now(),
                    },
                    "$setOnInsert": { "pending_payment_ids": [] },
                },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    /// Clear the plan pointer and flag the cache expired (revocation path).
    pub async fn clear_access(&self, user_id: &str, now: DateTime<Utc>) -> Result<(), AppError> {
        self.user_access
            .update_one(
                doc! { "_id": user_id },
                doc! {
                    "$set": {
                        "plan_id": null,
                        "plan_slug": null,
                        "access_expires_at": bson::DateTime::from_chrono(now),
                        "is_expired": true,
                        "updated_at": bson_now(),
                    },
                    "$setOnInsert": {
                        "access_started_at": null,
                        "pending_payment_ids": [],
                    },
                },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    /// Park a gateway payment id on the user's manual-review list.
    pub async fn append_pending_payment(
        &self,
        user_id: &str,
        payment_id: &str,
    ) -> Result<(), AppError> {
        self.user_access
            .update_one(
                doc! { "_id": user_id },
                doc! {
                    "$addToSet": { "pending_payment_ids": payment_id },
                    "$set": { "updated_at": bson_now() },
                    "$setOnInsert": {
                        "plan_id": null,
                        "plan_slug": null,
                        "access_started_at": null,
                        "access_expires_at": null,
                        "is_expired": false,
                    },
                },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    pub async fn remove_pending_payment(
        &self,
        user_id: &str,
        payment_id: &str,
    ) -> Result<(), AppError> {
        self.user_access
            .update_one(
                doc! { "_id": user_id },
                doc! {
                    "$pull": { "pending_payment_ids": payment_id },
                    "$set": { "updated_at": bson_now() },
                },
                None,
            )
            .await?;
        Ok(())
    }

    /// Flag the cache expired, but only if it still points at an access
    /// window ending at or before the given subscription end date.
    pub async fn mark_access_expired_if_due(
        &self,
        user_id: &str,
        end_date: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = self
            .user_access
            .update_one(
                doc! {
                    "_id": user_id,
                    "is_expired": false,
                    "access_expires_at": { "$lte": bson::DateTime::from_chrono(end_date) },
                },
                doc! { "$set": { "is_expired": true, "updated_at": bson_now() } },
                None,
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    /// Caches whose expiry has passed but whose flag was never set
    /// (cache/ledger drift).
    pub async fn find_drifted_caches(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserAccess>, AppError> {
        let cursor = self
            .user_access
            .find(
                doc! {
                    "is_expired": false,
                    "access_expires_at": { "$lt": bson::DateTime::from_chrono(now) },
                },
                None,
            )
            .await?;
        Ok(cursor.try_collect().await?)
    }
}
