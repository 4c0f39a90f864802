//! Application startup and lifecycle management.

use axum::middleware::from_fn;
use axum::{
    routing::{get, patch, post},
    Router,
};
use chrono::Utc;
use mongodb::{options::ClientOptions, Client};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{metrics::metrics_middleware, tracing::request_id_middleware};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::handlers;
use crate::services::{
    catalog::free_plan_seed, init_metrics, AccessResolver, BillingRepository, ExpirySweeper,
    GatewayClient, PlanCatalog, ReconciliationEngine, SubscriptionManager, TransactionLedger,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: mongodb::Database,
    pub config: Config,
    pub repository: BillingRepository,
    pub gateway: GatewayClient,
    pub catalog: PlanCatalog,
    pub ledger: TransactionLedger,
    pub engine: ReconciliationEngine,
    pub subscriptions: SubscriptionManager,
    pub resolver: AccessResolver,
    pub sweeper: ExpirySweeper,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        let mut client_options = ClientOptions::parse(config.database.url.expose_secret())
            .await
            .map_err(|e| {
                tracing::error!("Failed to parse MongoDB connection string: {}", e);
                AppError::DatabaseError(e.into())
            })?;
        client_options.app_name = Some("subscription-service".to_string());
        client_options.server_selection_timeout = Some(Duration::from_secs(10));

        let client = Client::with_options(client_options).map_err(|e| {
            tracing::error!("Failed to create MongoDB client: {}", e);
            AppError::DatabaseError(e.into())
        })?;
        let db = client.database(&config.database.db_name);

        let repository = BillingRepository::new(&db);
        repository.init_indexes().await.map_err(|e| {
            tracing::error!("Failed to initialize database indexes: {}", e);
            e
        })?;
        repository.ensure_free_plan(&free_plan_seed(Utc::now())).await?;

        let gateway = GatewayClient::new(config.gateway.clone());
        if gateway.is_configured() {
            tracing::info!("Payment gateway client initialized");
        } else {
            tracing::warn!("Gateway credentials not configured - checkout will be unavailable");
        }

        init_metrics();

        let catalog = PlanCatalog::new(repository.clone());
        let ledger = TransactionLedger::new(repository.clone(), gateway.clone());
        let subscriptions = SubscriptionManager::new(repository.clone());
        let engine = ReconciliationEngine::new(
            repository.clone(),
            gateway.clone(),
            subscriptions.clone(),
        );
        let resolver = AccessResolver::new(repository.clone());
        let sweeper = ExpirySweeper::new(repository.clone());

        let state = AppState {
            db,
            config: config.clone(),
            repository,
            gateway,
            catalog,
            ledger,
            engine,
            subscriptions,
            resolver,
            sweeper,
        };

        let router = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/metrics", get(handlers::metrics_endpoint))
            // Public catalog
            .route(
                "/plans",
                get(handlers::plans::list_plans).post(handlers::plans::create_plan),
            )
            .route(
                "/plans/:id",
                patch(handlers::plans::update_plan).delete(handlers::plans::delete_plan),
            )
            .route("/plans/:id/deactivate", post(handlers::plans::deactivate_plan))
            // Checkout + webhook ingress
            .route("/checkout", post(handlers::checkout::create_checkout))
            .route("/webhooks/gateway", post(handlers::webhook::gateway_webhook))
            // Admin reconciliation console
            .route(
                "/subscriptions/assign",
                post(handlers::admin::assign_subscription),
            )
            .route(
                "/subscriptions/:user_id/extend",
                patch(handlers::admin::extend_subscription),
            )
            .route(
                "/subscriptions/:user_id/revoke",
                patch(handlers::admin::revoke_subscription),
            )
            .route("/transactions", get(handlers::admin::list_transactions))
            .route("/admin/sweep", post(handlers::admin::run_sweep))
            // Access resolution for the content side
            .route("/access/:user_id/archive", get(handlers::access::archive_access))
            .layer(from_fn(metrics_middleware))
            .layer(from_fn(request_id_middleware))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("-");

                    tracing::info_span!(
                        "http_request",
                        request_id = %request_id,
                        method = %request.method(),
                        uri = %request.uri(),
                        version = ?request.version(),
                    )
                }),
            )
            .with_state(state.clone());

        // Bind listener (port 0 = random port for testing)
        let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            port,
            listener,
            router,
            state,
        })
    }

    /// Serve until shutdown, with the background expiry sweep running on its
    /// configured interval.
    pub async fn run_until_stopped(self) -> Result<(), AppError> {
        let interval_seconds = self.state.config.sweep.interval_seconds;
        if interval_seconds > 0 {
            let sweeper = self.state.sweeper.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds));
                // The first tick fires immediately; skip it so startup stays quiet.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = sweeper.run(Utc::now()).await {
                        tracing::error!(error = %e, "Background expiry sweep failed");
                    }
                }
            });
        }

        tracing::info!("Listening on port {}", self.port);
        axum::serve(self.listener, self.router)
            .await
            .map_err(AppError::from)?;

        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn db(&self) -> &mongodb::Database {
        &self.state.db
    }
}
