use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use fogagent_core::api::{ErrorBody, ReportIndex, SubmitResponse, WireEvent};
use fogagent_core::model::{Snapshot, StageReport, TargetKind};
use fogagent_core::validation::parse_batch;
use thiserror::Error;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::controller::{bounded, ResourceController, ShapingController};
use crate::reports::StageReportStore;
use crate::scheduler::Scheduler;
use crate::status::StatusTracker;

/// Everything a request handler needs. Built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub tracker: Arc<StatusTracker>,
    pub reports: Arc<StageReportStore>,
    pub scheduler: Scheduler,
    shaping: Arc<dyn ShapingController>,
}

impl AppState {
    pub fn new(
        config: AgentConfig,
        resources: Arc<dyn ResourceController>,
        shaping: Arc<dyn ShapingController>,
    ) -> Self {
        let tracker = Arc::new(StatusTracker::new(
            Arc::clone(&shaping),
            config.controller_timeout,
        ));
        for target in &config.tracked {
            tracker.get_or_create(target);
        }
        let reports = Arc::new(StageReportStore::new());
        let scheduler = Scheduler::new(
            resources,
            Arc::clone(&shaping),
            Arc::clone(&tracker),
            Arc::clone(&reports),
            config.settle,
            config.controller_timeout,
        );
        Self {
            config: Arc::new(config),
            tracker,
            reports,
            scheduler,
            shaping,
        }
    }

    /// Drops existing shaping rules on every tracked target (best-effort).
    pub async fn reset_tracked(&self) {
        for target in &self.config.tracked {
            match bounded(self.config.controller_timeout, self.shaping.reset(target)).await {
                Ok(()) => info!(target_id = %target, "shaping rules reset"),
                Err(e) => warn!(target_id = %target, error = %e, "shaping reset failed"),
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/application", post(submit_application))
        .route("/interface", post(submit_interface))
        .route("/reports", get(report_index))
        .route("/reports/{stage}", get(get_report))
        .route("/status", get(live_status))
        .fallback(legacy_report)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl ApiError {
    pub fn bad_request<E: std::fmt::Display>(e: E) -> Self {
        Self::BadRequest(e.to_string())
    }
    pub fn not_found(msg: &str) -> Self {
        Self::NotFound(msg.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let code = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (code, Json(body)).into_response()
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn submit_application(
    State(state): State<AppState>,
    payload: Result<Json<Vec<WireEvent>>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    submit(&state, TargetKind::Workload, payload)
}

async fn submit_interface(
    State(state): State<AppState>,
    payload: Result<Json<Vec<WireEvent>>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    submit(&state, TargetKind::Interface, payload)
}

/// Validates and schedules; nothing is scheduled unless the whole batch parses.
fn submit(
    state: &AppState,
    kind: TargetKind,
    payload: Result<Json<Vec<WireEvent>>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(events) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let batch = parse_batch(kind, &events).map_err(|e| {
        warn!(%kind, error = %e, "batch rejected");
        ApiError::bad_request(e)
    })?;

    // Dropping the handle detaches the batch task.
    let handle = state.scheduler.submit(batch);
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            batch_id: handle.batch_id,
            kind: handle.kind,
            actions: handle.actions,
            horizon_ms: handle.horizon_ms,
        }),
    ))
}

async fn report_index(State(state): State<AppState>) -> Json<ReportIndex> {
    Json(ReportIndex {
        stages: state.reports.len(),
    })
}

async fn get_report(
    State(state): State<AppState>,
    Path(stage): Path<u64>,
) -> Result<Json<StageReport>, ApiError> {
    lookup(&state, stage)
}

fn lookup(state: &AppState, stage: u64) -> Result<Json<StageReport>, ApiError> {
    state
        .reports
        .get(stage)
        .map(|r| Json(r.as_ref().clone()))
        .ok_or_else(|| ApiError::NotFound(format!("stage {stage}")))
}

/// Older clients ask for `/reports<stage>` without a separator.
async fn legacy_report(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
) -> Result<Json<StageReport>, ApiError> {
    let stage = (method == Method::GET)
        .then(|| uri.path().strip_prefix("/reports"))
        .flatten()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| ApiError::not_found(uri.path()))?;
    lookup(&state, stage)
}

async fn live_status(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.tracker.snapshot().await)
}
