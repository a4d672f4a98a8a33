//! Application startup and lifecycle management.
//!
//! Builds the injected client handles (document store, payment gateway,
//! mailer, signed-URL client) once at process start and threads them through
//! `AppState` so tests can substitute fakes at the same seams.

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use mongodb::{options::ClientOptions, Client};
use secrecy::ExposeSecret;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::Config;
use crate::error::AppError;
use crate::handlers;
use crate::services::cart::{CartPersistence, MongoCartPersistence};
use crate::services::checkout::CheckoutFlow;
use crate::services::get_metrics;
use crate::services::invoice::DownloadIssuer;
use crate::services::notify::{RefundNotifier, SmtpNotifier};
use crate::services::razorpay::{PaymentGateway, RazorpayClient};
use crate::services::refund::RefundService;
use crate::services::repository::{MongoOrderRepository, OrderStore};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn OrderStore>,
    pub cart_persistence: Arc<dyn CartPersistence>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub refunds: Arc<RefundService>,
    pub downloads: DownloadIssuer,
    /// Checkouts parked between the create-order and verify-payment hops,
    /// keyed by gateway order id.
    pub flows: Arc<DashMap<String, CheckoutFlow>>,
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "storefront-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

async fn readiness_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ready" })))
}

async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_endpoint))
        .route("/checkout/create-order", post(handlers::checkout::create_order))
        .route(
            "/checkout/verify-payment",
            post(handlers::checkout::verify_payment),
        )
        .route("/checkout/capture", post(handlers::checkout::capture_payment))
        .route("/checkout/abandon", post(handlers::checkout::abandon_checkout))
        .route(
            "/checkout/:payment_id/invoice",
            get(handlers::checkout::get_invoice),
        )
        .route(
            "/checkout/:payment_id/download",
            get(handlers::checkout::get_download),
        )
        .route("/orders", get(handlers::orders::list_orders))
        .route("/orders/:id/refund", post(handlers::orders::request_refund))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        let mut client_options = ClientOptions::parse(config.database.url.expose_secret())
            .await
            .map_err(|e| {
                tracing::error!("failed to parse MongoDB connection string: {}", e);
                AppError::DatabaseError(e.into())
            })?;
        client_options.app_name = Some(config.service_name.clone());

        let client = Client::with_options(client_options).map_err(|e| {
            tracing::error!("failed to create MongoDB client: {}", e);
            AppError::DatabaseError(e.into())
        })?;
        let db = client.database(&config.database.db_name);

        let repository = MongoOrderRepository::new(&db);
        repository.init_indexes().await.map_err(|e| {
            tracing::error!("failed to initialize database indexes: {}", e);
            AppError::from(e)
        })?;
        let store: Arc<dyn OrderStore> = Arc::new(repository);

        let cart_persistence: Arc<dyn CartPersistence> =
            Arc::new(MongoCartPersistence::new(&db));

        let razorpay = RazorpayClient::new(config.razorpay.clone());
        if razorpay.is_configured() {
            tracing::info!("Razorpay client initialized");
        } else {
            tracing::warn!("Razorpay credentials not configured - checkout will be unavailable");
        }
        let gateway: Arc<dyn PaymentGateway> = Arc::new(razorpay);

        let notifier: Arc<dyn RefundNotifier> = Arc::new(
            SmtpNotifier::new(config.smtp.clone())
                .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?,
        );
        let refunds = Arc::new(RefundService::new(store.clone(), notifier));

        let downloads = DownloadIssuer::new(config.download.clone());

        let state = AppState {
            config: config.clone(),
            store,
            cart_persistence,
            gateway,
            refunds,
            downloads,
            flows: Arc::new(DashMap::new()),
        };

        // Port 0 binds a random port for tests.
        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!("failed to bind listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> Result<(), AppError> {
        tracing::info!(port = self.port, "storefront service listening");
        axum::serve(self.listener, router(self.state))
            .await
            .map_err(AppError::from)?;
        Ok(())
    }
}
