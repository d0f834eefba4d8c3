// =============================================================================
// Central Application State — Helios control plane
// =============================================================================
//
// The single source of truth for the service. Handlers receive an
// `Arc<AppState>`; tests construct fresh instances against temp directories.
//
// Thread safety:
//   - parking_lot locks for mutable shared collections.
//   - The run registry serializes its own writes.
//   - The live guardrail session is single-writer behind a Mutex; concurrent
//     `record` calls are serialized there.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use crate::guardrails::LiveGuardrails;
use crate::paths::PathConfig;
use crate::registry::RunRegistry;
use crate::runtime_config::RuntimeConfig;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    // ── Paths (immutable after startup) ─────────────────────────────────
    pub paths: PathConfig,

    // ── Run orchestration ───────────────────────────────────────────────
    pub registry: Arc<RunRegistry>,
    /// Pending cancel handles for supervised children, keyed by run id.
    pub cancels: Mutex<HashMap<String, oneshot::Sender<()>>>,

    // ── Live trading ────────────────────────────────────────────────────
    /// At most one canary session per process.
    pub live: Mutex<Option<LiveGuardrails>>,

    // ── Timing ──────────────────────────────────────────────────────────
    /// Instant when the service was started. Used for uptime reporting.
    pub start_time: Instant,
}

impl AppState {
    /// Construct the state: opens the run registry under the runs dir.
    pub fn new(config: RuntimeConfig, paths: PathConfig) -> Result<Self> {
        let registry = Arc::new(RunRegistry::open(paths.runs_dir.join("runs.db"))?);
        Ok(Self {
            runtime_config: Arc::new(RwLock::new(config)),
            paths,
            registry,
            cancels: Mutex::new(HashMap::new()),
            live: Mutex::new(None),
            start_time: Instant::now(),
        })
    }

    /// Register a cancel handle for a freshly spawned run.
    pub fn register_cancel(&self, run_id: &str, tx: oneshot::Sender<()>) {
        self.cancels.lock().insert(run_id.to_string(), tx);
    }

    /// Take the cancel handle for a run, if one is still pending.
    pub fn take_cancel(&self, run_id: &str) -> Option<oneshot::Sender<()>> {
        self.cancels.lock().remove(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_opens_registry() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathConfig::new(dir.path().to_path_buf(), None).unwrap();
        let state = AppState::new(RuntimeConfig::default(), paths).unwrap();
        assert!(state.registry.list().is_empty());
        assert!(state.live.lock().is_none());
    }

    #[test]
    fn cancel_handles_are_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathConfig::new(dir.path().to_path_buf(), None).unwrap();
        let state = AppState::new(RuntimeConfig::default(), paths).unwrap();

        let (tx, _rx) = oneshot::channel();
        state.register_cancel("r1", tx);
        assert!(state.take_cancel("r1").is_some());
        assert!(state.take_cancel("r1").is_none());
    }
}
