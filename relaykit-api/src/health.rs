//! Health check endpoint
//!
//! Reports the pub/sub connection state for monitoring probes: 200 while the
//! broker session is live, 503 otherwise. The body is the same either way.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use relaykit_pubsub::{ConnectionState, PubSubServer};
use serde::{Deserialize, Serialize};

/// Shared state of the health router
#[derive(Clone)]
pub struct HealthState {
    pub pubsub: Arc<dyn PubSubServer>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub pubsub: String,
    pub default_topic: String,
}

/// Health check router, mounted at `endpoint`
pub fn create_health_router(endpoint: &str, pubsub: Arc<dyn PubSubServer>) -> Router {
    Router::new()
        .route(endpoint, get(health_check))
        .with_state(HealthState { pubsub })
}

pub async fn health_check(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let pubsub = state.pubsub.state();
    let (status, label) = if pubsub == ConnectionState::Connected {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            pubsub: pubsub.to_string(),
            default_topic: state.pubsub.default_topic().to_string(),
        }),
    )
}
