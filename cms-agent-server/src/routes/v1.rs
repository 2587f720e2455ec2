use axum::{
    Router,
    routing::{get, post},
};

use crate::{
    AppState,
    handlers::{control, metrics, status},
};

/// Create all v1 API routes
pub fn create_v1_router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status::status_handler))
        .route("/metrics", get(metrics::json_handler))
        .merge(create_control_routes())
}

fn create_control_routes() -> Router<AppState> {
    Router::new()
        .route("/control/update", post(control::update_handler))
        .route("/control/check", post(control::check_handler))
        .route("/control/validate", post(control::validate_handler))
        .route(
            "/control/settings",
            get(control::get_settings_handler)
                .patch(control::patch_settings_handler),
        )
}
