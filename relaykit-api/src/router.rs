use std::sync::Arc;

use axum::{
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use relaykit_core::ServerConfig;
use relaykit_pubsub::PubSubServer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::health::create_health_router;

/// Main application router.
///
/// The health endpoint is mounted here unless a separate health listener is
/// configured. `routes` carries the owning process's own endpoints.
pub fn create_router(
    config: &ServerConfig,
    pubsub: Arc<dyn PubSubServer>,
    routes: Option<Router>,
) -> Router {
    let mut router = Router::new().route("/", get(root).options(root));

    if config.health_listen_address.is_none() {
        router = router.merge(create_health_router(&config.health_endpoint, pubsub));
    }

    if let Some(routes) = routes {
        router = router.merge(routes);
    }

    router
        .fallback(fallback)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

async fn root() -> StatusCode {
    StatusCode::OK
}

async fn fallback(method: Method, uri: Uri) -> Response {
    if method == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    AppError::not_found(format!("no route for {uri}")).into_response()
}
