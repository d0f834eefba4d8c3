// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Helios control plane. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash. All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_python_bin() -> String {
    "python3".to_string()
}

fn default_train_module() -> String {
    "stockbot.rl.train_ppo".to_string()
}

fn default_backtest_module() -> String {
    "stockbot.backtest.run".to_string()
}

fn default_config_path() -> String {
    "config/base.yaml".to_string()
}

fn default_max_delay_sec() -> i64 {
    300
}

fn default_summary_every() -> u32 {
    20
}

fn default_smoke_bars() -> u32 {
    32
}

// =============================================================================
// WorkerConfig
// =============================================================================

/// Which worker implementation the launcher spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// The bundled smoke worker (this binary re-invoked with `smoke-worker`).
    Builtin,
    /// An external Python module invoked as `python -m <module> ...`.
    Python,
}

impl Default for WorkerKind {
    fn default() -> Self {
        Self::Builtin
    }
}

/// Settings for the worker subprocesses the launcher supervises.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker implementation to spawn.
    #[serde(default)]
    pub kind: WorkerKind,

    /// Python interpreter used for `WorkerKind::Python`.
    #[serde(default = "default_python_bin")]
    pub python_bin: String,

    /// Module executed for training runs.
    #[serde(default = "default_train_module")]
    pub train_module: String,

    /// Module executed for backtest runs.
    #[serde(default = "default_backtest_module")]
    pub backtest_module: String,

    /// Bar count the builtin smoke worker emits.
    #[serde(default = "default_smoke_bars")]
    pub smoke_bars: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            kind: WorkerKind::Builtin,
            python_bin: default_python_bin(),
            train_module: default_train_module(),
            backtest_module: default_backtest_module(),
            smoke_bars: default_smoke_bars(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Helios control plane.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worker launch settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Base config file used when a request omits `config_path`.
    #[serde(default = "default_config_path")]
    pub default_config_path: String,

    /// Heartbeat staleness threshold for live canary sessions, seconds.
    #[serde(default = "default_max_delay_sec")]
    pub heartbeat_max_delay_sec: i64,

    /// How many guardrail records between rolling summary rewrites.
    #[serde(default = "default_summary_every")]
    pub live_summary_every: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            default_config_path: default_config_path(),
            heartbeat_max_delay_sec: default_max_delay_sec(),
            live_summary_every: default_summary_every(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            worker = ?config.worker.kind,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.worker.kind, WorkerKind::Builtin);
        assert_eq!(cfg.worker.python_bin, "python3");
        assert_eq!(cfg.worker.train_module, "stockbot.rl.train_ppo");
        assert_eq!(cfg.worker.backtest_module, "stockbot.backtest.run");
        assert_eq!(cfg.heartbeat_max_delay_sec, 300);
        assert_eq!(cfg.live_summary_every, 20);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.worker.kind, WorkerKind::Builtin);
        assert_eq!(cfg.default_config_path, "config/base.yaml");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "worker": { "kind": "python", "python_bin": "python" } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.worker.kind, WorkerKind::Python);
        assert_eq!(cfg.worker.python_bin, "python");
        assert_eq!(cfg.worker.train_module, "stockbot.rl.train_ppo");
        assert_eq!(cfg.live_summary_every, 20);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");
        let mut cfg = RuntimeConfig::default();
        cfg.worker.kind = WorkerKind::Python;
        cfg.heartbeat_max_delay_sec = 120;
        cfg.save(&path).unwrap();
        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.worker.kind, WorkerKind::Python);
        assert_eq!(loaded.heartbeat_max_delay_sec, 120);
        // no tmp leftover
        assert!(!path.with_extension("json.tmp").exists());
    }
}
