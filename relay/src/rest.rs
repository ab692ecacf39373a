//! Observer HTTP surface.
//!
//! Loopback-only read endpoints for whatever watches the relay (an operator
//! shell, a UI layer). Never touches the pipeline; everything here is a
//! snapshot read.

use crate::metrics;
use crate::model::{DiagnosticsEvent, StatusEvent};
use crate::observer::Observer;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use std::sync::Arc;

#[derive(Clone)]
struct AppState {
    observer: Arc<Observer>,
}

pub fn create_router(observer: Arc<Observer>) -> Router {
    let state = AppState { observer };

    Router::new()
        .route("/status", get(get_status))
        .route("/diagnostics", get(get_diagnostics))
        .route("/healthz", get(healthz))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

async fn get_status(State(state): State<AppState>) -> Json<StatusEvent> {
    Json(state.observer.status().await)
}

async fn get_diagnostics(
    State(state): State<AppState>,
) -> Result<Json<DiagnosticsEvent>, (StatusCode, &'static str)> {
    match state.observer.diagnostics().await {
        Some(diagnostics) => Ok(Json(diagnostics)),
        None => Err((StatusCode::NOT_FOUND, "no diagnostics received yet")),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_metrics() -> String {
    metrics::gather_metrics()
}
