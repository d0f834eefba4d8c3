// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/lab/`. Job submission returns a job id as
// soon as the run is registered; worker failures land in the run record, not
// in the submission response. Artifact access is restricted to the closed
// artifact set and the allow-listed output roots.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::error::ApiError;
use crate::api::stream::{artifact_etag_files, weak_etag};
use crate::app_state::AppState;
use crate::dataset::{self, DatasetRequest};
use crate::guardrails::{CanaryConfig, LiveGuardrails};
use crate::launcher::{self, CancelError};
use crate::paths::artifact_map;
use crate::registry::RunRecord;
use crate::requests::{BacktestRequest, TrainRequest};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Health ──────────────────────────────────────────────────
        .route("/api/lab/health", get(health))
        // ── Job submission ──────────────────────────────────────────
        .route("/api/lab/train", post(post_train))
        .route("/api/lab/backtest", post(post_backtest))
        // ── Runs ────────────────────────────────────────────────────
        .route("/api/lab/runs", get(get_runs))
        .route("/api/lab/runs/:id", get(get_run).delete(delete_run))
        .route("/api/lab/runs/:id/artifacts", get(get_artifacts))
        .route("/api/lab/runs/:id/files/:name", get(get_artifact_file))
        .route("/api/lab/runs/:id/bundle", get(get_bundle))
        .route("/api/lab/runs/:id/cancel", post(post_cancel))
        // ── Streaming ───────────────────────────────────────────────
        .route("/api/lab/runs/:id/stream", get(crate::api::stream::stream_run_status))
        .route("/api/lab/runs/:id/telemetry", get(crate::api::stream::stream_run_telemetry))
        .route("/api/lab/runs/:id/events", get(crate::api::stream::stream_run_events))
        .route("/api/lab/runs/:id/ws", get(crate::api::ws::ws_run_status))
        // ── Datasets ────────────────────────────────────────────────
        .route("/api/lab/datasets/prepare", post(post_prepare_dataset))
        .route("/api/lab/datasets/:hash", get(get_dataset))
        // ── Live trading ────────────────────────────────────────────
        .route("/api/lab/trade/start", post(post_trade_start))
        .route("/api/lab/trade/status", post(post_trade_status).get(get_trade_status))
        .route("/api/lab/trade/stop", post(post_trade_stop))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_s: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_s: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Job submission
// =============================================================================

async fn post_train(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TrainRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rec = launcher::start_train(&state, req)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    info!(job_id = %rec.id, "train job accepted");
    Ok(Json(json!({ "job_id": rec.id })))
}

async fn post_backtest(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BacktestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rec = launcher::start_backtest(&state, req)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    info!(job_id = %rec.id, "backtest job accepted");
    Ok(Json(json!({ "job_id": rec.id })))
}

// =============================================================================
// Run listing and detail
// =============================================================================

fn run_summary(rec: &RunRecord) -> serde_json::Value {
    json!({
        "id": rec.id,
        "type": rec.run_type,
        "status": rec.status,
        "out_dir": rec.out_dir,
        "created_at": rec.created_at,
        "started_at": rec.started_at,
        "finished_at": rec.finished_at,
    })
}

async fn get_runs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rows: Vec<serde_json::Value> = state.registry.list().iter().map(run_summary).collect();
    Json(rows)
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rec = state
        .registry
        .get(&run_id)
        .ok_or_else(|| ApiError::not_found("Run not found"))?;
    let mut detail = run_summary(&rec);
    if let Some(obj) = detail.as_object_mut() {
        obj.insert("error".to_string(), json!(rec.error));
    }
    Ok(Json(detail))
}

async fn delete_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .registry
        .delete(&run_id)
        .ok_or_else(|| ApiError::not_found("Run not found"))?;
    info!(run_id = %run_id, "run deleted");
    Ok(Json(json!({ "status": "deleted" })))
}

async fn post_cancel(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match launcher::cancel(&state, &run_id) {
        Ok(rec) => Ok(Json(json!({ "id": rec.id, "status": rec.status }))),
        Err(CancelError::NotFound) => Err(ApiError::not_found("Run not found")),
        Err(CancelError::AlreadyFinished(status)) => Err(ApiError::bad_request(format!(
            "run already finished with status {status}"
        ))),
    }
}

// =============================================================================
// Artifacts
// =============================================================================

async fn get_artifacts(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let rec = state
        .registry
        .get(&run_id)
        .ok_or_else(|| ApiError::not_found("Run not found"))?;
    let out_dir = PathBuf::from(&rec.out_dir);

    let etag = weak_etag(&artifact_etag_files(&out_dir), "artifacts");
    if let Some(if_none_match) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        if if_none_match == etag {
            return Ok(StatusCode::NOT_MODIFIED.into_response());
        }
    }

    // Absent files are omitted from the listing.
    let listing: BTreeMap<&str, String> = artifact_map(&out_dir)
        .into_iter()
        .filter(|(_, path)| path.exists())
        .map(|(name, _)| (name, format!("/api/lab/runs/{run_id}/files/{name}")))
        .collect();

    let mut response = Json(listing).into_response();
    if let Ok(value) = etag.parse() {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

fn content_type_for(path: &FsPath) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("yaml") | Some("yml") => "application/yaml",
        Some("zip") => "application/zip",
        Some("log") => "text/plain",
        _ => "application/octet-stream",
    }
}

async fn get_artifact_file(
    State(state): State<Arc<AppState>>,
    Path((run_id, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let rec = state
        .registry
        .get(&run_id)
        .ok_or_else(|| ApiError::not_found("Run not found"))?;
    let out_dir = PathBuf::from(&rec.out_dir);

    let map = artifact_map(&out_dir);
    let path = map
        .get(name.as_str())
        .ok_or_else(|| ApiError::not_found("Unknown artifact"))?;
    if !path.exists() {
        return Err(ApiError::not_found("File not found"));
    }

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ApiError::internal(format!("failed to read artifact: {e}")))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.clone());

    Ok((
        [
            (header::CONTENT_TYPE, content_type_for(path).to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct BundleQuery {
    #[serde(default = "default_include_model")]
    include_model: bool,
}

fn default_include_model() -> bool {
    true
}

async fn get_bundle(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(query): Query<BundleQuery>,
) -> Result<Response, ApiError> {
    let rec = state
        .registry
        .get(&run_id)
        .ok_or_else(|| ApiError::not_found("Run not found"))?;
    let out_dir = PathBuf::from(&rec.out_dir);
    let include_model = query.include_model;

    let bytes = tokio::task::spawn_blocking(move || build_bundle(&out_dir, include_model))
        .await
        .map_err(|e| ApiError::internal(format!("bundle task failed: {e}")))?
        .map_err(|e| ApiError::internal(format!("failed to build bundle: {e}")))?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{run_id}.zip\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// Pack the existing artifacts into a zip archive, report files under
/// `report/`.
fn build_bundle(out_dir: &FsPath, include_model: bool) -> anyhow::Result<Vec<u8>> {
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let options: zip::write::SimpleFileOptions = Default::default();
        for (name, path) in artifact_map(out_dir) {
            if !path.exists() {
                continue;
            }
            if !include_model && name == "model" {
                continue;
            }
            let arcname = match name {
                "metrics" | "equity" | "orders" | "trades" | "summary" => format!(
                    "report/{}",
                    path.file_name().unwrap_or_default().to_string_lossy()
                ),
                _ => path.file_name().unwrap_or_default().to_string_lossy().into_owned(),
            };
            zip.start_file(arcname, options)?;
            zip.write_all(&std::fs::read(&path)?)?;
        }
        zip.finish()?;
    }
    Ok(buf.into_inner())
}

// =============================================================================
// Datasets
// =============================================================================

async fn post_prepare_dataset(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DatasetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate().map_err(ApiError::bad_request)?;
    let paths = state.paths.clone();
    let prepared = tokio::task::spawn_blocking(move || dataset::prepare(&paths, &req))
        .await
        .map_err(|e| ApiError::internal(format!("dataset task failed: {e}")))?
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(prepared))
}

/// Look up a prepared dataset by content hash (full or 12-char prefix) and
/// re-verify it against the on-disk cache. Drifted inputs are an error, not
/// a stale success.
async fn get_dataset(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if hash.len() < 12 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ApiError::bad_request("hash must be a hex content hash"));
    }
    let prefix: String = hash.chars().take(12).collect();
    let dataset_dir = state.paths.project_root.join("datasets").join(prefix);
    if !dataset_dir.is_dir() {
        return Err(ApiError::not_found("Dataset not found"));
    }

    let dir = dataset_dir.clone();
    let manifest = tokio::task::spawn_blocking(move || dataset::verify_manifest(&dir))
        .await
        .map_err(|e| ApiError::internal(format!("dataset task failed: {e}")))?
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    Ok(Json(json!({
        "manifest": manifest,
        "dataset_dir": dataset_dir.to_string_lossy(),
    })))
}

// =============================================================================
// Live trading (canary sessions)
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TradeStartRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub policy_path: Option<String>,
    #[serde(default)]
    pub broker: Option<String>,
    // Canary configuration overrides, all optional.
    #[serde(default)]
    pub stages: Option<Vec<f64>>,
    #[serde(default)]
    pub window_trades: Option<usize>,
    #[serde(default)]
    pub min_sharpe: Option<f64>,
    #[serde(default)]
    pub min_hitrate: Option<f64>,
    #[serde(default)]
    pub max_slippage_bps: Option<f64>,
    #[serde(default)]
    pub daily_loss_limit_pct: Option<f64>,
    #[serde(default)]
    pub vol_target_annual: Option<f64>,
    #[serde(default)]
    pub vol_band_frac: Option<f64>,
    #[serde(default)]
    pub out_dir: Option<String>,
}

impl TradeStartRequest {
    fn canary_config(&self) -> Result<CanaryConfig, String> {
        let mut cfg = CanaryConfig::default();
        if let Some(stages) = &self.stages {
            if stages.is_empty() {
                return Err("stages must not be empty".to_string());
            }
            if stages.windows(2).any(|w| w[1] <= w[0]) {
                return Err("stages must be strictly increasing".to_string());
            }
            cfg.stages = stages.clone();
        }
        if let Some(v) = self.window_trades {
            if v == 0 {
                return Err("window_trades must be at least 1".to_string());
            }
            cfg.window_trades = v;
        }
        if let Some(v) = self.min_sharpe {
            cfg.min_sharpe = v;
        }
        if let Some(v) = self.min_hitrate {
            cfg.min_hitrate = v;
        }
        if let Some(v) = self.max_slippage_bps {
            cfg.max_slippage_bps = v;
        }
        if let Some(v) = self.daily_loss_limit_pct {
            cfg.max_daily_dd_pct = v;
        }
        if let Some(v) = self.vol_target_annual {
            cfg.vol_target_annual = Some(v);
        }
        if let Some(v) = self.vol_band_frac {
            cfg.vol_band_frac = v;
        }
        Ok(cfg)
    }
}

async fn post_trade_start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TradeStartRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cfg = req.canary_config().map_err(ApiError::bad_request)?;

    let session_id = req.run_id.as_ref().map(|id| format!("canary_{id}"));
    let out_dir = match &req.out_dir {
        Some(dir) => {
            let path = PathBuf::from(dir);
            state
                .paths
                .validate_out_base(&path)
                .map_err(|e| ApiError::bad_request(e.to_string()))?;
            path
        }
        None => state
            .paths
            .runs_dir
            .join("live")
            .join(session_id.as_deref().unwrap_or("canary_session")),
    };

    let meta = json!({
        "run_id": req.run_id,
        "policy_path": req.policy_path,
        "broker": req.broker,
    });
    let (max_delay_sec, summary_every) = {
        let config = state.runtime_config.read();
        (config.heartbeat_max_delay_sec, config.live_summary_every)
    };

    let guardrails =
        LiveGuardrails::start_session(&out_dir, cfg, max_delay_sec, summary_every, session_id, meta)
            .map_err(|e| ApiError::internal(e.to_string()))?;

    let snapshot = guardrails.snapshot();
    let session = snapshot["session_id"].clone();
    *state.live.lock() = Some(guardrails);

    Ok(Json(json!({
        "status": "started",
        "session_id": session,
        "details": snapshot,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TradeStatusRequest {
    pub metrics: std::collections::HashMap<String, f64>,
    pub last_bar_ts: i64,
    pub now_ts: i64,
    pub broker_ok: bool,
    pub target_capital: f64,
}

async fn post_trade_status(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TradeStatusRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut live = state.live.lock();
    let guardrails = live
        .as_mut()
        .ok_or_else(|| ApiError::bad_request("live trading not started"))?;

    let stage = guardrails.record(
        req.metrics,
        req.last_bar_ts,
        req.now_ts,
        req.broker_ok,
        req.target_capital,
    );

    Ok(Json(json!({
        "status": "running",
        "stage": stage,
        "deploy_capital": req.target_capital * stage,
        "halted": guardrails.state.halted,
        "details": guardrails.snapshot(),
    })))
}

async fn get_trade_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let live = state.live.lock();
    match live.as_ref() {
        Some(guardrails) => Json(json!({
            "status": "running",
            "details": guardrails.snapshot(),
        })),
        None => Json(json!({ "status": "stopped" })),
    }
}

async fn post_trade_stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut live = state.live.lock();
    if let Some(mut guardrails) = live.take() {
        guardrails.stop();
    } else {
        warn!("trade/stop with no active session");
    }
    Json(json!({ "status": "stopped" }))
}
