// Not every test binary uses every helper.
#![allow(dead_code)]

use secrecy::Secret;
use serde_json::{json, Value};
use subscription_service::config::{
    Config, DatabaseConfig, GatewayConfig, ServerConfig, SweepConfig,
};
use subscription_service::startup::Application;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const WEBHOOK_SECRET: &str = "test_webhook_secret";

/// Fake gateway Orders API: echoes the requested amount back under a fresh
/// order id, the way the real gateway does.
struct CreateOrderResponder;

impl Respond for CreateOrderResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
        let amount = body.get("amount").and_then(Value::as_i64).unwrap_or(0);
        let currency = body
            .get("currency")
            .and_then(Value::as_str)
            .unwrap_or("INR");
        ResponseTemplate::new(200).set_body_json(json!({
            "id": format!("order_{}", Uuid::new_v4().simple()),
            "amount": amount,
            "currency": currency,
            "status": "created",
            "notes": body.get("notes").cloned().unwrap_or(Value::Null),
        }))
    }
}

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub db: mongodb::Database,
    pub db_name: String,
    pub api_client: reqwest::Client,
    pub gateway_server: MockServer,
}

impl TestApp {
    /// Spawn the application against a scratch database and a mocked gateway.
    /// Returns None (and the test should bail out) when no test database is
    /// configured.
    pub async fn spawn() -> Option<Self> {
        let Ok(mongo_uri) = std::env::var("TEST_MONGODB_URI") else {
            eprintln!("TEST_MONGODB_URI not set; skipping integration test");
            return None;
        };

        let gateway_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(CreateOrderResponder)
            .mount(&gateway_server)
            .await;

        let db_name = format!("subscription_test_{}", Uuid::new_v4().simple());

        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Random port
            },
            database: DatabaseConfig {
                url: Secret::new(mongo_uri),
                db_name: db_name.clone(),
            },
            gateway: GatewayConfig {
                key_id: "gw_test_key".to_string(),
                key_secret: Secret::new("gw_test_secret".to_string()),
                webhook_secret: Secret::new(WEBHOOK_SECRET.to_string()),
                api_base_url: gateway_server.uri(),
            },
            sweep: SweepConfig {
                interval_seconds: 0, // Sweeps run on demand in tests
            },
            service_name: "subscription-service-test".to_string(),
        };

        let app = Application::build(config)
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);
        let db = app.db().clone();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the server to be ready by polling the health endpoint
        let api_client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if api_client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        Some(TestApp {
            address,
            port,
            db,
            db_name,
            api_client,
            gateway_server,
        })
    }

    /// Create a duration-days plan through the admin API, returning its id.
    pub async fn create_plan(&self, slug: &str, days: i64, final_price_amount: i64) -> Uuid {
        let response = self
            .api_client
            .post(format!("{}/plans", self.address))
            .json(&json!({
                "name": format!("Plan {}", slug),
                "slug": slug,
                "final_price_amount": final_price_amount,
                "billing": { "type": "duration_days", "days": days },
            }))
            .send()
            .await
            .expect("Failed to create plan");
        assert_eq!(response.status(), 201, "plan creation failed");
        let body: Value = response.json().await.expect("Invalid plan response");
        body["id"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .expect("Plan response missing id")
    }

    /// Initiate a checkout, returning `(transaction_id, gateway_order_id)`.
    pub async fn checkout(&self, user_id: &str, plan_id: Uuid) -> (Uuid, String) {
        let response = self
            .api_client
            .post(format!("{}/checkout", self.address))
            .json(&json!({ "user_id": user_id, "plan_id": plan_id }))
            .send()
            .await
            .expect("Failed to initiate checkout");
        assert_eq!(response.status(), 201, "checkout failed");
        let body: Value = response.json().await.expect("Invalid checkout response");
        let transaction_id = body["transaction_id"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .expect("Checkout response missing transaction_id");
        let order_id = body["gateway_order_id"]
            .as_str()
            .expect("Checkout response missing gateway_order_id")
            .to_string();
        (transaction_id, order_id)
    }

    /// A `payment.captured` webhook body in the gateway's envelope format.
    pub fn captured_event(
        order_id: &str,
        payment_id: &str,
        amount: i64,
        user_id: Option<&str>,
        plan_id: Option<Uuid>,
    ) -> String {
        let mut notes = serde_json::Map::new();
        if let Some(user_id) = user_id {
            notes.insert("userId".to_string(), json!(user_id));
        }
        if let Some(plan_id) = plan_id {
            notes.insert("planId".to_string(), json!(plan_id));
        }
        json!({
            "event": "payment.captured",
            "payload": {
                "payment": {
                    "entity": {
                        "id": payment_id,
                        "amount": amount,
                        "currency": "INR",
                        "status": "captured",
                        "order_id": order_id,
                        "notes": notes,
                    }
                }
            }
        })
        .to_string()
    }

    /// Post a webhook body, signed with the test secret unless overridden.
    pub async fn post_webhook(&self, body: &str, signature: Option<&str>) -> reqwest::Response {
        let mut request = self
            .api_client
            .post(format!("{}/webhooks/gateway", self.address))
            .header("content-type", "application/json")
            .body(body.to_string());
        if let Some(signature) = signature {
            request = request.header("X-Signature", signature);
        }
        request.send().await.expect("Failed to post webhook")
    }

    pub fn sign(&self, body: &str) -> String {
        service_core::utils::signature::sign_payload(WEBHOOK_SECRET, body)
            .expect("Failed to sign webhook body")
    }

    /// Cleanup test database after test completes.
    pub async fn cleanup(&self) {
        self.db
            .drop(None)
            .await
            .expect("Failed to drop test database");
    }
}
