// =============================================================================
// Run Registry — durable (run_id -> RunRecord) store
// =============================================================================
//
// Records live in a local SQLite database and are replayed into an in-memory
// index at startup, so listings and lookups never touch disk on the hot path.
// Writes go to both; a database failure is logged and the in-memory index
// stays authoritative for the session.
//
// Invariant: a record in a terminal status is never overwritten with a
// non-terminal status. Late supervisor writes racing an explicit cancel keep
// the terminal outcome that landed first.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{RunStatus, RunType};

/// The unit of orchestration: one training or backtest execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub run_type: RunType,
    pub status: RunStatus,
    pub out_dir: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Opaque request echo, including the `config_snapshot` path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl RunRecord {
    /// Fresh QUEUED record stamped with the current time.
    pub fn new_queued(id: String, run_type: RunType, out_dir: String, meta: serde_json::Value) -> Self {
        Self {
            id,
            run_type,
            status: RunStatus::Queued,
            out_dir,
            created_at: chrono::Utc::now().to_rfc3339(),
            started_at: None,
            finished_at: None,
            error: None,
            pid: None,
            meta: Some(meta),
        }
    }
}

/// Durable registry with an in-memory read index.
pub struct RunRegistry {
    db: Mutex<Connection>,
    runs: RwLock<HashMap<String, RunRecord>>,
    db_path: PathBuf,
}

impl RunRegistry {
    /// Open (or create) the database at `db_path` and replay all rows into
    /// the in-memory index.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open registry db {}", db_path.display()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                out_dir TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                error TEXT,
                pid INTEGER,
                meta TEXT
            )",
            [],
        )
        .context("failed to create runs table")?;

        let registry = Self {
            db: Mutex::new(conn),
            runs: RwLock::new(HashMap::new()),
            db_path,
        };
        let replayed = registry.replay()?;
        info!(count = replayed, db = %registry.db_path.display(), "run registry opened");
        Ok(registry)
    }

    fn replay(&self) -> Result<usize> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT id, type, status, out_dir, created_at, started_at, finished_at, error, pid, meta
             FROM runs",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<u32>>(8)?,
                row.get::<_, Option<String>>(9)?,
            ))
        })?;

        let mut runs = self.runs.write();
        let mut count = 0usize;
        for row in rows {
            let (id, ty, status, out_dir, created_at, started_at, finished_at, error, pid, meta) =
                row?;
            let run_type: RunType = match ty.parse() {
                Ok(t) => t,
                Err(e) => {
                    warn!(id = %id, error = %e, "skipping registry row with bad type");
                    continue;
                }
            };
            let status: RunStatus = match status.parse() {
                Ok(s) => s,
                Err(e) => {
                    warn!(id = %id, error = %e, "skipping registry row with bad status");
                    continue;
                }
            };
            let meta = meta.and_then(|m| serde_json::from_str(&m).ok());
            runs.insert(
                id.clone(),
                RunRecord {
                    id,
                    run_type,
                    status,
                    out_dir,
                    created_at,
                    started_at,
                    finished_at,
                    error,
                    pid,
                    meta,
                },
            );
            count += 1;
        }
        Ok(count)
    }

    /// Upsert a record by id.
    ///
    /// Per-id writes are serialized by the index lock; a terminal status is
    /// never replaced by a non-terminal one.
    pub fn save(&self, rec: RunRecord) -> RunRecord {
        let stored = {
            let mut runs = self.runs.write();
            match runs.get(&rec.id) {
                Some(existing) if existing.status.is_terminal() && !rec.status.is_terminal() => {
                    warn!(
                        id = %rec.id,
                        existing = %existing.status,
                        incoming = %rec.status,
                        "ignoring status regression on terminal run"
                    );
                    existing.clone()
                }
                _ => {
                    runs.insert(rec.id.clone(), rec.clone());
                    rec
                }
            }
        };

        if let Err(e) = self.persist(&stored) {
            warn!(id = %stored.id, error = %e, "failed to persist run record");
        }
        stored
    }

    fn persist(&self, rec: &RunRecord) -> Result<()> {
        let meta = rec
            .meta
            .as_ref()
            .map(|m| serde_json::to_string(m))
            .transpose()
            .context("failed to serialise run meta")?;
        let db = self.db.lock();
        db.execute(
            "INSERT OR REPLACE INTO runs
             (id, type, status, out_dir, created_at, started_at, finished_at, error, pid, meta)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                rec.id,
                rec.run_type.to_string(),
                rec.status.to_string(),
                rec.out_dir,
                rec.created_at,
                rec.started_at,
                rec.finished_at,
                rec.error,
                rec.pid,
                meta,
            ],
        )
        .context("failed to upsert run row")?;
        Ok(())
    }

    /// Snapshot of a record, if present.
    pub fn get(&self, id: &str) -> Option<RunRecord> {
        self.runs.read().get(id).cloned()
    }

    /// All records, newest first.
    pub fn list(&self) -> Vec<RunRecord> {
        let mut rows: Vec<RunRecord> = self.runs.read().values().cloned().collect();
        // RFC 3339 timestamps sort lexicographically.
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }

    /// Remove the record and (best-effort) its on-disk tree.
    pub fn delete(&self, id: &str) -> Option<RunRecord> {
        let removed = self.runs.write().remove(id)?;

        {
            let db = self.db.lock();
            if let Err(e) = db.execute("DELETE FROM runs WHERE id = ?1", params![id]) {
                warn!(id = %id, error = %e, "failed to delete run row");
            }
        }

        if let Err(e) = std::fs::remove_dir_all(&removed.out_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(id = %id, out_dir = %removed.out_dir, error = %e, "failed to remove run tree");
            }
        }
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, created_at: &str) -> RunRecord {
        RunRecord {
            id: id.to_string(),
            run_type: RunType::Train,
            status: RunStatus::Queued,
            out_dir: format!("/tmp/{id}"),
            created_at: created_at.to_string(),
            started_at: None,
            finished_at: None,
            error: None,
            pid: None,
            meta: Some(serde_json::json!({"seed": 42})),
        }
    }

    #[test]
    fn save_get_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let reg = RunRegistry::open(dir.path().join("runs.db")).unwrap();
        let rec = record("a1", "2026-01-01T00:00:00+00:00");
        reg.save(rec.clone());
        assert_eq!(reg.get("a1").unwrap(), rec);
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn list_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let reg = RunRegistry::open(dir.path().join("runs.db")).unwrap();
        reg.save(record("old", "2026-01-01T00:00:00+00:00"));
        reg.save(record("new", "2026-02-01T00:00:00+00:00"));
        reg.save(record("mid", "2026-01-15T00:00:00+00:00"));
        let ids: Vec<String> = reg.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("runs.db");
        {
            let reg = RunRegistry::open(&db).unwrap();
            let mut rec = record("persist", "2026-01-01T00:00:00+00:00");
            rec.status = RunStatus::Succeeded;
            rec.finished_at = Some("2026-01-01T01:00:00+00:00".to_string());
            rec.pid = Some(4242);
            reg.save(rec);
        }
        let reg = RunRegistry::open(&db).unwrap();
        let rec = reg.get("persist").unwrap();
        assert_eq!(rec.status, RunStatus::Succeeded);
        assert_eq!(rec.pid, Some(4242));
        assert_eq!(rec.meta, Some(serde_json::json!({"seed": 42})));
    }

    #[test]
    fn terminal_status_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let reg = RunRegistry::open(dir.path().join("runs.db")).unwrap();
        let mut rec = record("t1", "2026-01-01T00:00:00+00:00");
        rec.status = RunStatus::Cancelled;
        reg.save(rec.clone());

        rec.status = RunStatus::Running;
        let stored = reg.save(rec);
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert_eq!(reg.get("t1").unwrap().status, RunStatus::Cancelled);
    }

    #[test]
    fn terminal_can_replace_terminal() {
        // A FAILED supervisor write after an explicit CANCELLED must not win,
        // but re-saving the same terminal status (idempotent cancel) is fine.
        let dir = tempfile::tempdir().unwrap();
        let reg = RunRegistry::open(dir.path().join("runs.db")).unwrap();
        let mut rec = record("t2", "2026-01-01T00:00:00+00:00");
        rec.status = RunStatus::Cancelled;
        reg.save(rec.clone());
        rec.error = Some("killed by operator".to_string());
        let stored = reg.save(rec);
        assert_eq!(stored.error.as_deref(), Some("killed by operator"));
    }

    #[test]
    fn delete_removes_record_and_tree() {
        let dir = tempfile::tempdir().unwrap();
        let reg = RunRegistry::open(dir.path().join("runs.db")).unwrap();
        let out_dir = dir.path().join("out1");
        std::fs::create_dir_all(out_dir.join("report")).unwrap();
        std::fs::write(out_dir.join("job.log"), "x").unwrap();

        let mut rec = record("d1", "2026-01-01T00:00:00+00:00");
        rec.out_dir = out_dir.to_str().unwrap().to_string();
        reg.save(rec);

        assert!(reg.delete("d1").is_some());
        assert!(reg.get("d1").is_none());
        assert!(!out_dir.exists());
        // idempotent
        assert!(reg.delete("d1").is_none());
    }
}
