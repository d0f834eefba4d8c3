// =============================================================================
// Streaming endpoints — SSE for run status, per-bar telemetry and events
// =============================================================================
//
// Each subscription spawns its own tailer/poller task feeding a bounded
// channel; the response is the channel wrapped as an SSE stream. When the
// client disconnects the channel closes and the task dies on its next send,
// without touching any other subscriber.
// =============================================================================

use std::convert::Infallible;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::app_state::AppState;
use crate::paths::telemetry_paths;
use crate::registry::RunRecord;
use crate::telemetry::{tail_jsonl, TailFrame, TailOptions};

/// Cadence of the run-status differential poll.
const STATUS_POLL: Duration = Duration::from_secs(1);

// =============================================================================
// Shared plumbing
// =============================================================================

type SseStream = Sse<Box<dyn Stream<Item = Result<Event, Infallible>> + Send + Unpin>>;

fn sse_response(rx: mpsc::Receiver<TailFrame>) -> SseStream {
    let stream = ReceiverStream::new(rx).map(|frame| {
        let mut event = Event::default().data(frame.data);
        if frame.event != "message" {
            event = event.event(frame.event);
        }
        Ok(event)
    });
    let boxed: Box<dyn Stream<Item = Result<Event, Infallible>> + Send + Unpin> = Box::new(stream);
    Sse::new(boxed).keep_alive(KeepAlive::default())
}

/// The differential status frame payload.
pub fn status_payload(rec: &RunRecord) -> serde_json::Value {
    json!({
        "id": rec.id,
        "type": rec.run_type,
        "status": rec.status,
        "out_dir": rec.out_dir,
        "created_at": rec.created_at,
        "started_at": rec.started_at,
        "finished_at": rec.finished_at,
        "error": rec.error,
    })
}

/// SHA-256 over the canonical JSON of the originating request payload,
/// used by clients as a cache key.
pub fn payload_hash(meta: Option<&serde_json::Value>) -> String {
    let payload = meta
        .and_then(|m| m.get("payload"))
        .cloned()
        .unwrap_or_else(|| json!({}));
    let canonical = serde_json::to_string(&payload).unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Resolved snapshot config as JSON, best-effort.
fn resolved_config(meta: Option<&serde_json::Value>) -> serde_json::Value {
    let Some(path) = meta
        .and_then(|m| m.get("config_snapshot"))
        .and_then(|p| p.as_str())
    else {
        return json!({});
    };
    let Ok(content) = std::fs::read_to_string(path) else {
        return json!({});
    };
    serde_yaml::from_str::<serde_json::Value>(&content).unwrap_or_else(|_| json!({}))
}

fn out_dir_for_run(state: &AppState, run_id: &str) -> Option<PathBuf> {
    if let Some(rec) = state.registry.get(run_id) {
        return Some(PathBuf::from(rec.out_dir));
    }
    // Fall back to the conventional layout for runs the registry no longer
    // knows about.
    let candidate = state.paths.runs_dir.join(run_id);
    candidate.exists().then_some(candidate)
}

// =============================================================================
// Run status stream
// =============================================================================

/// `GET /runs/{id}/stream` — `init` frame, then one differential frame per
/// observed change at a 1 s cadence, closing at a terminal status.
pub async fn stream_run_status(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> SseStream {
    let (tx, rx) = mpsc::channel::<TailFrame>(32);

    tokio::spawn(async move {
        let Some(rec) = state.registry.get(&run_id) else {
            let _ = tx
                .send(TailFrame::new("error", r#"{"error": "run_not_found"}"#))
                .await;
            return;
        };

        let init = json!({
            "payload_hash": payload_hash(rec.meta.as_ref()),
            "config": resolved_config(rec.meta.as_ref()),
        });
        if tx.send(TailFrame::new("init", init.to_string())).await.is_err() {
            return;
        }

        let mut last: Option<serde_json::Value> = None;
        loop {
            let Some(rec) = state.registry.get(&run_id) else {
                return;
            };
            let payload = status_payload(&rec);
            if last.as_ref() != Some(&payload) {
                if tx
                    .send(TailFrame::new("message", payload.to_string()))
                    .await
                    .is_err()
                {
                    return;
                }
                last = Some(payload);
            }
            if rec.status.is_terminal() {
                return;
            }
            tokio::time::sleep(STATUS_POLL).await;
        }
    });

    sse_response(rx)
}

// =============================================================================
// Telemetry streams
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct TelemetryQuery {
    #[serde(default)]
    pub from_start: bool,
}

fn default_from_start_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_from_start_true")]
    pub from_start: bool,
}

/// `GET /runs/{id}/telemetry?from_start=` — `init` frame then `bar` frames
/// tailed from the per-bar JSONL file.
pub async fn stream_run_telemetry(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(query): Query<TelemetryQuery>,
) -> SseStream {
    stream_jsonl(state, run_id, query.from_start, "bar").await
}

/// `GET /runs/{id}/events?from_start=` — `init` frame then `event` frames.
/// Events default to replay-from-start.
pub async fn stream_run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> SseStream {
    stream_jsonl(state, run_id, query.from_start, "event").await
}

async fn stream_jsonl(
    state: Arc<AppState>,
    run_id: String,
    from_start: bool,
    event_name: &'static str,
) -> SseStream {
    let (tx, rx) = mpsc::channel::<TailFrame>(64);

    tokio::spawn(async move {
        let Some(out_dir) = out_dir_for_run(&state, &run_id) else {
            let _ = tx
                .send(TailFrame::new("error", r#"{"error": "run_not_found"}"#))
                .await;
            return;
        };

        let init = match state.registry.get(&run_id) {
            Some(rec) => json!({
                "run_id": rec.id,
                "type": rec.run_type,
                "created_at": rec.created_at,
                "config": rec
                    .meta
                    .as_ref()
                    .and_then(|m| m.get("config_snapshot"))
                    .cloned(),
            }),
            None => json!({ "run_id": run_id }),
        };
        if tx.send(TailFrame::new("init", init.to_string())).await.is_err() {
            return;
        }

        let (bar_path, event_path, _rollup_path) = telemetry_paths(&out_dir);
        let path = if event_name == "event" { event_path } else { bar_path };
        tail_jsonl(path, TailOptions::new(event_name, from_start), tx).await;
    });

    sse_response(rx)
}

// =============================================================================
// Weak ETags for point-in-time endpoints
// =============================================================================

/// Weak validator over `(file_name, mtime_nanos, size)` of the candidate
/// files plus an endpoint-specific salt. No clock values are embedded.
pub fn weak_etag(files: &[PathBuf], salt: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for path in files {
        let Ok(meta) = std::fs::metadata(path) else {
            continue;
        };
        let mtime_nanos = meta
            .modified()
            .ok()
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        parts.push(format!("{name}:{mtime_nanos}:{}", meta.len()));
    }
    parts.sort();
    let digest = Sha256::digest(format!("{}|{salt}", parts.join("|")).as_bytes());
    format!("W/\"{}\"", hex::encode(digest))
}

/// ETag input set for a run's artifact listing.
pub fn artifact_etag_files(out_dir: &FsPath) -> Vec<PathBuf> {
    crate::paths::artifact_map(out_dir).into_values().collect()
}
