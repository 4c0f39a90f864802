mod common;

use chrono::Duration;
use common::TestApp;
use mongodb::bson::doc;
use subscription_service::models::{Subscription, Transaction, TransactionStatus, UserAccess};
use uuid::Uuid;

#[tokio::test]
async fn captured_webhook_activates_subscription() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let plan_id = app.create_plan("weekly", 7, 15000).await;
    let (_, order_id) = app.checkout("user-1", plan_id).await;

    let body = TestApp::captured_event(&order_id, "pay_1", 15000, Some("user-1"), Some(plan_id));
    let signature = app.sign(&body);
    let response = app.post_webhook(&body, Some(&signature)).await;
    assert_eq!(response.status(), 200);

    let subscription = app
        .db
        .collection::<Subscription>("subscriptions")
        .find_one(doc! { "user_id": "user-1" }, None)
        .await
        .unwrap()
        .expect("Subscription was not created");
    assert_eq!(
        subscription.end_date,
        subscription.start_date + Duration::days(7)
    );
    assert_eq!(subscription.plan_id, plan_id);

    let cache = app
        .db
        .collection::<UserAccess>("user_access")
        .find_one(doc! { "_id": "user-1" }, None)
        .await
        .unwrap()
        .expect("User access cache was not refreshed");
    assert_eq!(cache.plan_slug.as_deref(), Some("weekly"));
    assert!(!cache.is_expired);

    let transaction = app
        .db
        .collection::<Transaction>("transactions")
        .find_one(doc! { "gateway_order_id": &order_id }, None)
        .await
        .unwrap()
        .expect("Transaction vanished");
    assert_eq!(transaction.status, TransactionStatus::Captured);
    assert_eq!(transaction.paid_amount, Some(15000));
    assert!(!transaction.is_discrepant);
    assert!(transaction.raw_webhook.is_some());

    app.cleanup().await;
}

#[tokio::test]
async fn replayed_webhook_is_idempotent() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let plan_id = app.create_plan("weekly", 7, 15000).await;
    let (_, order_id) = app.checkout("user-2", plan_id).await;

    let body = TestApp::captured_event(&order_id, "pay_2", 15000, Some("user-2"), Some(plan_id));
    let signature = app.sign(&body);
    for _ in 0..4 {
        let response = app.post_webhook(&body, Some(&signature)).await;
        assert_eq!(response.status(), 200);
    }

    let subscription_count = app
        .db
        .collection::<Subscription>("subscriptions")
        .count_documents(doc! { "user_id": "user-2" }, None)
        .await
        .unwrap();
    assert_eq!(subscription_count, 1);

    let transaction_count = app
        .db
        .collection::<Transaction>("transactions")
        .count_documents(doc! { "gateway_order_id": &order_id }, None)
        .await
        .unwrap();
    assert_eq!(transaction_count, 1);

    app.cleanup().await;
}

#[tokio::test]
async fn discrepant_amount_blocks_activation() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let plan_id = app.create_plan("weekly", 7, 15000).await;
    let (_, order_id) = app.checkout("user-3", plan_id).await;

    // Paid 10000 against a requested 15000.
    let body = TestApp::captured_event(&order_id, "pay_3", 10000, Some("user-3"), Some(plan_id));
    let signature = app.sign(&body);
    let response = app.post_webhook(&body, Some(&signature)).await;
    assert_eq!(response.status(), 200);

    let subscription_count = app
        .db
        .collection::<Subscription>("subscriptions")
        .count_documents(doc! { "user_id": "user-3" }, None)
        .await
        .unwrap();
    assert_eq!(subscription_count, 0);

    let transaction = app
        .db
        .collection::<Transaction>("transactions")
        .find_one(doc! { "gateway_order_id": &order_id }, None)
        .await
        .unwrap()
        .unwrap();
    assert!(transaction.is_discrepant);
    assert_eq!(transaction.status, TransactionStatus::Captured);
    assert_eq!(transaction.paid_amount, Some(10000));

    // The discrepancy shows up in the admin listing.
    let listing: serde_json::Value = app
        .api_client
        .get(format!("{}/transactions?is_discrepant=true", app.address))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["total_count"], 1);
    assert_eq!(
        listing["transactions"][0]["gateway_order_id"],
        serde_json::json!(order_id)
    );

    app.cleanup().await;
}

#[tokio::test]
async fn orphan_webhook_is_held_for_review() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let order_id = format!("order_unknown_{}", Uuid::new_v4().simple());
    let body = TestApp::captured_event(&order_id, "pay_4", 9900, Some("user-4"), None);
    let signature = app.sign(&body);
    let response = app.post_webhook(&body, Some(&signature)).await;
    assert_eq!(response.status(), 200);

    let transaction = app
        .db
        .collection::<Transaction>("transactions")
        .find_one(doc! { "gateway_order_id": &order_id }, None)
        .await
        .unwrap()
        .expect("Orphan transaction was not recorded");
    assert!(transaction.is_orphan);
    assert_eq!(transaction.requested_amount, 0);
    assert_eq!(transaction.paid_amount, Some(9900));

    let subscription_count = app
        .db
        .collection::<Subscription>("subscriptions")
        .count_documents(doc! { "user_id": "user-4" }, None)
        .await
        .unwrap();
    assert_eq!(subscription_count, 0);

    let cache = app
        .db
        .collection::<UserAccess>("user_access")
        .find_one(doc! { "_id": "user-4" }, None)
        .await
        .unwrap()
        .expect("Pending-review entry was not recorded");
    assert!(cache.pending_payment_ids.contains(&"pay_4".to_string()));

    app.cleanup().await;
}

#[tokio::test]
async fn missing_user_is_acknowledged_without_effect() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let plan_id = app.create_plan("weekly", 7, 15000).await;
    let (_, order_id) = app.checkout("user-5", plan_id).await;

    let body = TestApp::captured_event(&order_id, "pay_5", 15000, None, Some(plan_id));
    let signature = app.sign(&body);
    let response = app.post_webhook(&body, Some(&signature)).await;
    assert_eq!(response.status(), 200);

    let transaction = app
        .db
        .collection::<Transaction>("transactions")
        .find_one(doc! { "gateway_order_id": &order_id }, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transaction.status, TransactionStatus::Created);
    assert!(transaction.paid_amount.is_none());

    app.cleanup().await;
}

#[tokio::test]
async fn invalid_signature_is_rejected() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let plan_id = app.create_plan("weekly", 7, 15000).await;
    let (_, order_id) = app.checkout("user-6", plan_id).await;

    let body = TestApp::captured_event(&order_id, "pay_6", 15000, Some("user-6"), Some(plan_id));

    let response = app.post_webhook(&body, Some("not-a-signature")).await;
    assert_eq!(response.status(), 401);

    let response = app.post_webhook(&body, None).await;
    assert_eq!(response.status(), 401);

    // Nothing moved.
    let transaction = app
        .db
        .collection::<Transaction>("transactions")
        .find_one(doc! { "gateway_order_id": &order_id }, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transaction.status, TransactionStatus::Created);

    app.cleanup().await;
}

#[tokio::test]
async fn renewal_appends_to_current_period() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let plan_id = app.create_plan("monthly", 30, 49900).await;

    let (_, first_order) = app.checkout("user-7", plan_id).await;
    let body = TestApp::captured_event(&first_order, "pay_7a", 49900, Some("user-7"), Some(plan_id));
    let signature = app.sign(&body);
    app.post_webhook(&body, Some(&signature)).await;

    let (_, second_order) = app.checkout("user-7", plan_id).await;
    let body =
        TestApp::captured_event(&second_order, "pay_7b", 49900, Some("user-7"), Some(plan_id));
    let signature = app.sign(&body);
    app.post_webhook(&body, Some(&signature)).await;

    let mut subscriptions: Vec<Subscription> = Vec::new();
    let mut cursor = app
        .db
        .collection::<Subscription>("subscriptions")
        .find(doc! { "user_id": "user-7" }, None)
        .await
        .unwrap();
    while cursor.advance().await.unwrap() {
        subscriptions.push(cursor.deserialize_current().unwrap());
    }
    assert_eq!(subscriptions.len(), 2);
    subscriptions.sort_by_key(|s| s.start_date);

    // The renewal starts where the current access ends, not at "now".
    assert_eq!(subscriptions[1].start_date, subscriptions[0].end_date);
    assert_eq!(
        subscriptions[1].end_date,
        subscriptions[0].end_date + Duration::days(30)
    );

    app.cleanup().await;
}

#[tokio::test]
async fn checkout_rejects_free_and_inactive_plans() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    // The seeded free plan is not purchasable.
    let plans: serde_json::Value = app
        .api_client
        .get(format!("{}/plans", app.address))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let free_id = plans
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["slug"] == "free")
        .and_then(|p| p["id"].as_str())
        .map(|s| Uuid::parse_str(s).unwrap())
        .expect("Free plan was not seeded");

    let response = app
        .api_client
        .post(format!("{}/checkout", app.address))
        .json(&serde_json::json!({ "user_id": "user-8", "plan_id": free_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Neither is a deactivated plan.
    let plan_id = app.create_plan("retired", 7, 5000).await;
    app.api_client
        .post(format!("{}/plans/{}/deactivate", app.address, plan_id))
        .send()
        .await
        .unwrap();
    let response = app
        .api_client
        .post(format!("{}/checkout", app.address))
        .json(&serde_json::json!({ "user_id": "user-8", "plan_id": plan_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    app.cleanup().await;
}
