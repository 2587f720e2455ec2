pub mod v1;

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    routing::get,
};
use cms_agent_config::CorsConfig;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    AppState,
    handlers::{health, metrics, status},
};

/// Full application router: unversioned probes and scrape endpoints plus
/// the versioned API.
pub fn create_app(state: AppState) -> Router {
    let cors = cors_layer(&state.cors);

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/health/live", get(health::live_handler))
        .route("/health/ready", get(health::ready_handler))
        .route("/status", get(status::status_handler))
        .route("/metrics", get(metrics::prometheus_handler))
        .merge(create_api_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Create the main API router with all versions
pub fn create_api_router() -> Router<AppState> {
    Router::new().nest("/api/v1", v1::create_v1_router())
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin.trim()).ok())
        .collect();
    let allow_origin = if config.is_wildcard_included() || origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::list([
            Method::GET,
            Method::POST,
            Method::PATCH,
        ]))
        .allow_headers(AllowHeaders::list([header::CONTENT_TYPE]))
}
