pub mod orders;
pub mod refill;
pub mod routing;
pub mod subscriptions;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::store::Store;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/refill-queue", get(refill::list_refills))
        .route("/refill-queue/:id/approve", post(refill::approve_refill))
        .route("/refill-queue/:id/cancel", post(refill::cancel_refill))
        .route(
            "/provider/routing/available",
            get(routing::available_prescriptions),
        )
        .route("/provider/routing/claim", post(routing::claim_prescription))
        .route("/orders/:id/decline", post(orders::decline_order))
        .route("/orders/:id/complete", post(orders::complete_order))
        .route("/webhooks/billing", post(subscriptions::billing_webhook))
        .route(
            "/subscriptions/:id/pause",
            post(subscriptions::pause_subscription),
        )
        .route(
            "/subscriptions/:id/resume",
            post(subscriptions::resume_subscription),
        )
        .route(
            "/subscriptions/:id/cancel",
            post(subscriptions::cancel_subscription),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) fn idempotency_key(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers.get("idempotency-key").and_then(|v| v.to_str().ok())
}
