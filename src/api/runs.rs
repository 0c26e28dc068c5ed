use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::{app::AppState, pipeline::RunContext};

#[derive(Debug, Serialize)]
struct TriggerRunResponse {
    run_id: Uuid,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Starts a full pipeline run in the background; refused while another
/// run is in progress.
pub(crate) async fn trigger(State(state): State<AppState>) -> impl IntoResponse {
    let run = RunContext::new();
    let run_id = run.run_id;
    let orchestrator = state.orchestrator();
    let ledger = state.ledger();
    if let Err(active) = ledger.try_start(&run).await {
        let body = Json(ErrorResponse {
            error: format!("run {active} is still running"),
        });
        return (StatusCode::CONFLICT, body).into_response();
    }

    tokio::spawn(async move {
        match orchestrator.execute(&run).await {
            Ok(report) => {
                info!(%run_id, recommendations = report.summary.recommendations, "triggered run finished");
                ledger.succeed(run_id, report.summary).await;
            }
            Err(err) => {
                error!(%run_id, error = %format!("{err:#}"), "triggered run failed");
                ledger.fail(run_id, &err).await;
            }
        }
    });

    let body = Json(TriggerRunResponse {
        run_id,
        status: "accepted",
    });
    (StatusCode::ACCEPTED, body).into_response()
}

pub(crate) async fn status(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.ledger().get(run_id).await {
        Some(record) => (StatusCode::OK, Json(record)).into_response(),
        None => {
            let body = Json(ErrorResponse {
                error: format!("run {run_id} not found"),
            });
            (StatusCode::NOT_FOUND, body).into_response()
        }
    }
}
