// =============================================================================
// Telemetry Writer — non-blocking, crash-safe per-bar emission
// =============================================================================
//
// Destination files are named by environment variables so worker subprocesses
// can append without any in-process pub/sub:
//
//   STOCKBOT_TELEMETRY_PATH  per-bar records
//   STOCKBOT_EVENT_PATH      event records (gate triggers, halts, ...)
//   STOCKBOT_ROLLUP_PATH     periodic rollups
//   STOCKBOT_RUN_ID          run id stamped into every record
//
// The emit path never errors and never panics: any filesystem problem is
// swallowed so the worker's primary work is not perturbed. Oversize lines are
// compacted and flagged with `_truncated` rather than dropped.
// =============================================================================

use std::io::Write;
use std::path::PathBuf;

use serde_json::{json, Value};

/// Hard per-line ceiling in bytes. Lines above this are compacted.
const MAX_LINE_BYTES: usize = 10_000;

/// Scalar keys preserved when a record is compacted.
const COMPACT_KEYS: [&str; 6] = ["t", "bar_idx", "schema", "run_id", "kind", "emitted_at"];

/// Append-only JSONL writer for per-bar, event and rollup records.
pub struct TelemetryWriter {
    run_id: Option<String>,
    telemetry_path: Option<PathBuf>,
    event_path: Option<PathBuf>,
    rollup_path: Option<PathBuf>,
}

impl TelemetryWriter {
    /// Build from the `STOCKBOT_*` environment variables. Destination files
    /// are touched eagerly so tailers can attach before the first record.
    pub fn from_env() -> Self {
        let writer = Self {
            run_id: std::env::var("STOCKBOT_RUN_ID").ok().filter(|s| !s.is_empty()),
            telemetry_path: path_from_env("STOCKBOT_TELEMETRY_PATH"),
            event_path: path_from_env("STOCKBOT_EVENT_PATH"),
            rollup_path: path_from_env("STOCKBOT_ROLLUP_PATH"),
        };
        for path in [&writer.telemetry_path, &writer.event_path, &writer.rollup_path]
            .into_iter()
            .flatten()
        {
            if !path.exists() {
                let _ = std::fs::OpenOptions::new().create(true).append(true).open(path);
            }
        }
        writer
    }

    /// Per-bar record.
    pub fn emit_bar(&self, payload: Value) {
        self.append(self.telemetry_path.as_ref(), payload, "bar");
    }

    /// Event record (gate triggers, halts, lifecycle markers).
    pub fn emit_event(&self, payload: Value) {
        self.append(self.event_path.as_ref(), payload, "event");
    }

    /// Periodic rollup record. Falls back to the per-bar file when no rollup
    /// destination is configured.
    pub fn emit_rollup(&self, payload: Value) {
        let path = self.rollup_path.as_ref().or(self.telemetry_path.as_ref());
        self.append(path, payload, "rollup");
    }

    fn append(&self, path: Option<&PathBuf>, payload: Value, kind: &str) {
        let Some(path) = path else { return };

        let mut rec = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        rec.entry("kind").or_insert_with(|| json!(kind));
        rec.entry("emitted_at")
            .or_insert_with(|| json!(chrono::Utc::now().timestamp_millis()));
        if let Some(run_id) = &self.run_id {
            rec.entry("run_id").or_insert_with(|| json!(run_id));
        }

        let mut line = Value::Object(rec.clone()).to_string();
        if line.len() > MAX_LINE_BYTES {
            let mut compact = serde_json::Map::new();
            for key in COMPACT_KEYS {
                if let Some(v) = rec.get(key) {
                    compact.insert(key.to_string(), v.clone());
                }
            }
            compact.insert("_truncated".to_string(), json!(true));
            line = Value::Object(compact).to_string();
        }

        // Best-effort: never raise from the emit path.
        let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) else {
            return;
        };
        let _ = writeln!(file, "{line}");
    }
}

fn path_from_env(var: &str) -> Option<PathBuf> {
    let raw = std::env::var(var).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let path = PathBuf::from(trimmed);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_for(dir: &std::path::Path) -> TelemetryWriter {
        TelemetryWriter {
            run_id: Some("run42".to_string()),
            telemetry_path: Some(dir.join("live_telemetry.jsonl")),
            event_path: Some(dir.join("live_events.jsonl")),
            rollup_path: None,
        }
    }

    fn read_lines(path: &std::path::Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn bar_records_are_stamped() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer_for(dir.path());
        w.emit_bar(json!({"bar_idx": 3, "pnl": {"bar_bps": 1.5}}));

        let lines = read_lines(&dir.path().join("live_telemetry.jsonl"));
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["kind"], "bar");
        assert_eq!(lines[0]["run_id"], "run42");
        assert_eq!(lines[0]["bar_idx"], 3);
        assert!(lines[0]["emitted_at"].is_i64());
    }

    #[test]
    fn records_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer_for(dir.path());
        for i in 0..5 {
            w.emit_bar(json!({"bar_idx": i}));
        }
        let lines = read_lines(&dir.path().join("live_telemetry.jsonl"));
        let idxs: Vec<i64> = lines.iter().map(|l| l["bar_idx"].as_i64().unwrap()).collect();
        assert_eq!(idxs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn oversize_records_are_compacted_and_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer_for(dir.path());
        let big = "x".repeat(MAX_LINE_BYTES + 1);
        w.emit_bar(json!({"bar_idx": 9, "t": "2026-01-01T00:00:00Z", "blob": big}));

        let lines = read_lines(&dir.path().join("live_telemetry.jsonl"));
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["_truncated"], true);
        assert_eq!(lines[0]["bar_idx"], 9);
        assert_eq!(lines[0]["kind"], "bar");
        assert!(lines[0].get("blob").is_none());
        assert!(lines[0].to_string().len() <= MAX_LINE_BYTES);
    }

    #[test]
    fn rollup_falls_back_to_bar_file() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer_for(dir.path());
        w.emit_rollup(json!({"window": 20}));
        let lines = read_lines(&dir.path().join("live_telemetry.jsonl"));
        assert_eq!(lines[0]["kind"], "rollup");
    }

    #[test]
    fn emit_without_destination_is_a_noop() {
        let w = TelemetryWriter {
            run_id: None,
            telemetry_path: None,
            event_path: None,
            rollup_path: None,
        };
        // Must not panic or error.
        w.emit_bar(json!({"bar_idx": 1}));
        w.emit_event(json!({"event": "start"}));
        w.emit_rollup(json!({}));
    }

    #[test]
    fn explicit_kind_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer_for(dir.path());
        w.emit_event(json!({"kind": "event", "event": "halt", "reason": "slippage"}));
        let lines = read_lines(&dir.path().join("live_events.jsonl"));
        assert_eq!(lines[0]["kind"], "event");
        assert_eq!(lines[0]["reason"], "slippage");
    }
}
