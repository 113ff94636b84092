use crate::services::metrics::get_metrics;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "chart-analysis-service" })),
    )
}

/// Ready when the key store answers. A failing model API is reported but does
/// not take the service out of rotation, since status and registration still work.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.keys.health_check().await;
    let provider = state.analyzer.provider().health_check().await;

    if let Err(e) = &provider {
        tracing::warn!(error = %e, "Vision provider health check failed");
    }

    let body = json!({
        "status": if store.is_ok() { "ready" } else { "not_ready" },
        "key_store": {
            "backend": state.keys.backend(),
            "ok": store.is_ok(),
        },
        "provider": {
            "name": state.analyzer.provider().name(),
            "model": state.analyzer.provider().model(),
            "ok": provider.is_ok(),
        },
        "sessions": state.analyzer.sessions().len(),
    });

    let status = if store.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

pub async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        get_metrics(),
    )
}
