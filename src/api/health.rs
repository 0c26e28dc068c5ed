use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use tracing::error;

use crate::app::AppState;

#[derive(Debug, Serialize)]
pub(crate) struct HealthReport {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    running_runs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl HealthReport {
    fn status(status: &'static str) -> Self {
        Self {
            status,
            running_runs: None,
            detail: None,
        }
    }
}

/// Ready once the feature registry matches the pipeline's schemas.
pub(crate) async fn ready(
    State(state): State<AppState>,
) -> Result<Json<HealthReport>, (StatusCode, Json<HealthReport>)> {
    state.telemetry().record_ready_probe();
    let running_runs = Some(state.ledger().running().await);

    if let Err(err) = state.orchestrator().preflight().await {
        let detail = format!("{err:#}");
        error!(error = %detail, "feature registry readiness check failed");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthReport {
                running_runs,
                detail: Some(detail),
                ..HealthReport::status("degraded")
            }),
        ));
    }

    Ok(Json(HealthReport {
        running_runs,
        ..HealthReport::status("ready")
    }))
}

pub(crate) async fn live(State(state): State<AppState>) -> Json<HealthReport> {
    state.telemetry().record_live_probe();
    Json(HealthReport::status("live"))
}
