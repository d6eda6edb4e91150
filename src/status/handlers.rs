use axum::{extract::State, Json};

use crate::observability::VarzSnapshot;
use super::StatusState;

/// Liveness check for load balancers.
pub async fn get_healthz() -> &'static str {
    "ok"
}

/// Current traffic statistics.
pub async fn get_varz(State(state): State<StatusState>) -> Json<VarzSnapshot> {
    Json(state.varz.snapshot())
}

/// The route table as `{uri: [addr, ...]}`.
pub async fn get_routes(State(state): State<StatusState>) -> Json<serde_json::Value> {
    match serde_json::to_value(&*state.registry) {
        Ok(routes) => Json(routes),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize route table");
            Json(serde_json::Value::Object(Default::default()))
        }
    }
}
