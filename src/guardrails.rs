// =============================================================================
// Canary Guardrail Engine — staged capital ramp with halt semantics
// =============================================================================
//
// A live session starts at the smallest capital stage and is promoted one
// stage at a time while the rolling trade window stays healthy. Any breach
// halts the session: halted is sticky until the operator starts a new
// session, and a halted session deploys zero capital regardless of stage.
//
// Stage promotion requires a full metrics window; halt triggers are evaluated
// on every record, full window or not.
//
// Every record appends a line to the session audit log and periodically
// rewrites a rolling summary (atomic tmp + rename). Persistence is
// best-effort: a failed write is logged and the state transition stands.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

// =============================================================================
// Configuration
// =============================================================================

fn default_stages() -> Vec<f64> {
    vec![0.01, 0.02, 0.05, 0.10]
}

fn default_window_trades() -> usize {
    100
}

fn default_min_sharpe() -> f64 {
    0.5
}

fn default_min_hitrate() -> f64 {
    0.52
}

fn default_max_slippage_bps() -> f64 {
    15.0
}

fn default_max_daily_dd_pct() -> f64 {
    1.0
}

fn default_vol_band_frac() -> f64 {
    0.25
}

/// Immutable canary parameters for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryConfig {
    /// Monotone-increasing fractions of target capital.
    #[serde(default = "default_stages")]
    pub stages: Vec<f64>,
    /// Rolling window length in trades.
    #[serde(default = "default_window_trades")]
    pub window_trades: usize,
    #[serde(default = "default_min_sharpe")]
    pub min_sharpe: f64,
    #[serde(default = "default_min_hitrate")]
    pub min_hitrate: f64,
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: f64,
    #[serde(default = "default_max_daily_dd_pct")]
    pub max_daily_dd_pct: f64,
    /// Optional realized volatility guard. The comparison is units-neutral:
    /// rolling per-record vol against `vol_target_annual * (1 + band)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vol_target_annual: Option<f64>,
    #[serde(default = "default_vol_band_frac")]
    pub vol_band_frac: f64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            stages: default_stages(),
            window_trades: default_window_trades(),
            min_sharpe: default_min_sharpe(),
            min_hitrate: default_min_hitrate(),
            max_slippage_bps: default_max_slippage_bps(),
            max_daily_dd_pct: default_max_daily_dd_pct(),
            vol_target_annual: None,
            vol_band_frac: default_vol_band_frac(),
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// Mutable per-session state. Owned by exactly one `LiveGuardrails`.
#[derive(Debug, Clone, Default)]
pub struct CanaryState {
    pub stage_idx: usize,
    pub metrics_window: VecDeque<HashMap<String, f64>>,
    /// Sticky once set; cleared only by starting a new session.
    pub halted: bool,
    pub last_event: Option<String>,
    pub last_bar_ts: Option<i64>,
    pub last_heartbeat_ts: Option<i64>,
}

/// Data and broker liveness check.
pub fn heartbeat_ok(last_bar_ts: i64, now_ts: i64, max_delay_sec: i64, broker_ok: bool) -> bool {
    (now_ts - last_bar_ts) <= max_delay_sec && broker_ok
}

// =============================================================================
// LiveGuardrails
// =============================================================================

/// One live canary session: state machine plus audit/summary persistence.
pub struct LiveGuardrails {
    pub cfg: CanaryConfig,
    pub state: CanaryState,
    pub session_id: String,
    audit_path: PathBuf,
    metrics_path: PathBuf,
    max_delay_sec: i64,
    summary_every: u32,
    n_records: u64,
    last_target_capital: f64,
}

impl LiveGuardrails {
    /// Initialize a session under `out_dir`: audit log, summary path and a
    /// session meta file with config, session id and (if discoverable) the
    /// current VCS revision.
    pub fn start_session(
        out_dir: &Path,
        cfg: CanaryConfig,
        max_delay_sec: i64,
        summary_every: u32,
        session_id: Option<String>,
        meta: serde_json::Value,
    ) -> Result<Self> {
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create session dir {}", out_dir.display()))?;

        let session_id = session_id
            .unwrap_or_else(|| format!("live_{}", chrono::Utc::now().format("%Y%m%d_%H%M%S")));

        let guardrails = Self {
            cfg,
            state: CanaryState::default(),
            session_id,
            audit_path: out_dir.join("live_audit.jsonl"),
            metrics_path: out_dir.join("live_metrics.json"),
            max_delay_sec,
            summary_every: summary_every.max(1),
            n_records: 0,
            last_target_capital: 0.0,
        };

        let meta_obj = json!({
            "session_id": guardrails.session_id,
            "created_at": chrono::Utc::now().to_rfc3339(),
            "git_sha": git_revision(out_dir),
            "config": guardrails.cfg,
            "meta": meta,
        });
        if let Err(e) = std::fs::write(
            out_dir.join("live_session.json"),
            serde_json::to_string_pretty(&meta_obj).unwrap_or_default(),
        ) {
            warn!(error = %e, "failed to write session meta");
        }

        // Seed the audit log so tailers have context from the first line.
        guardrails.append_audit(&json!({
            "ts": chrono::Utc::now().timestamp(),
            "stage": guardrails.cfg.stages.first().copied().unwrap_or(0.0),
            "halted": false,
            "event": "start",
        }));

        info!(session_id = %guardrails.session_id, dir = %out_dir.display(), "live session started");
        Ok(guardrails)
    }

    /// Ingest one metrics/heartbeat tick and return the capital stage
    /// fraction to deploy (0.0 when halted).
    pub fn record(
        &mut self,
        metrics: HashMap<String, f64>,
        last_bar_ts: i64,
        now_ts: i64,
        broker_ok: bool,
        target_capital: f64,
    ) -> f64 {
        self.state.last_bar_ts = Some(last_bar_ts);
        self.state.last_heartbeat_ts = Some(now_ts);

        let mut risk_flags: Vec<String> = Vec::new();
        if !heartbeat_ok(last_bar_ts, now_ts, self.max_delay_sec, broker_ok) {
            self.state.halted = true;
            self.state.last_event = Some("halt:heartbeat".to_string());
            risk_flags.push("heartbeat".to_string());
            warn!(session_id = %self.session_id, "heartbeat stale or broker down — session halted");
        }

        self.update_canary(metrics.clone());
        if self.state.halted {
            if let Some(event) = &self.state.last_event {
                if let Some(cause) = event.strip_prefix("halt:") {
                    if !risk_flags.iter().any(|f| f == cause) {
                        risk_flags.push(cause.to_string());
                    }
                }
            }
        }

        let stage = self.current_stage();
        self.last_target_capital = target_capital;
        let deploy_capital = target_capital * stage;

        let mut audit = json!({
            "ts": now_ts,
            "stage": stage,
            "halted": self.state.halted,
            "target_capital": target_capital,
            "deploy_capital": deploy_capital,
            "risk_flags": risk_flags,
        });
        if let Some(obj) = audit.as_object_mut() {
            for (k, v) in &metrics {
                obj.insert(k.clone(), json!(v));
            }
        }
        self.append_audit(&audit);

        self.n_records += 1;
        if self.n_records % self.summary_every as u64 == 0 {
            self.write_summary(None);
        }

        stage
    }

    /// Effective deployed fraction: zero when halted.
    pub fn current_stage(&self) -> f64 {
        if self.state.halted {
            0.0
        } else {
            self.cfg.stages.get(self.state.stage_idx).copied().unwrap_or(0.0)
        }
    }

    /// Serialisable status snapshot.
    pub fn snapshot(&self) -> serde_json::Value {
        let stage = self.current_stage();
        json!({
            "session_id": self.session_id,
            "stage_idx": self.state.stage_idx,
            "stage": stage,
            "halted": self.state.halted,
            "last_event": self.state.last_event,
            "last_heartbeat_ts": self.state.last_heartbeat_ts,
            "last_bar_ts": self.state.last_bar_ts,
            "target_capital": self.last_target_capital,
            "deploy_capital": self.last_target_capital * stage,
            "audit_path": self.audit_path.to_string_lossy(),
            "metrics_path": self.metrics_path.to_string_lossy(),
        })
    }

    /// Close the session: final audit record and a closing summary snapshot.
    pub fn stop(&mut self) {
        self.append_audit(&json!({
            "ts": chrono::Utc::now().timestamp(),
            "stage": self.current_stage(),
            "halted": self.state.halted,
            "event": "stop",
        }));
        self.write_summary(Some(chrono::Utc::now().to_rfc3339()));
        info!(session_id = %self.session_id, "live session stopped");
    }

    // -------------------------------------------------------------------------
    // State machine internals
    // -------------------------------------------------------------------------

    fn update_canary(&mut self, metrics: HashMap<String, f64>) {
        self.state.metrics_window.push_back(metrics);
        while self.state.metrics_window.len() > self.cfg.window_trades {
            self.state.metrics_window.pop_front();
        }

        if self.state.halted {
            return;
        }

        let sharpe = self.window_mean("sharpe");
        let hitrate = self.window_mean("hitrate");
        let slippage = self.window_mean("slippage_bps");
        // Prefer the explicit daily loss metric; fall back to max daily DD.
        let dd = self
            .state
            .metrics_window
            .iter()
            .map(|m| {
                m.get("daily_loss_pct")
                    .or_else(|| m.get("max_daily_dd_pct"))
                    .copied()
                    .unwrap_or(0.0)
            })
            .fold(f64::MIN, f64::max);
        let realized_vol = self.realized_vol();

        let mut promote = sharpe >= self.cfg.min_sharpe
            && hitrate >= self.cfg.min_hitrate
            && slippage <= self.cfg.max_slippage_bps
            && dd <= self.cfg.max_daily_dd_pct;
        if let (Some(vol), Some(target)) = (realized_vol, self.cfg.vol_target_annual) {
            promote = promote && vol <= target * (1.0 + self.cfg.vol_band_frac);
        }
        // A partial warmup window never promotes.
        promote = promote && self.state.metrics_window.len() >= self.cfg.window_trades;

        if promote && self.state.stage_idx < self.cfg.stages.len() - 1 {
            self.state.stage_idx += 1;
            self.state.last_event = Some(format!("promote:stage_{}", self.state.stage_idx));
            info!(
                session_id = %self.session_id,
                stage_idx = self.state.stage_idx,
                "canary promoted"
            );
        } else if slippage > self.cfg.max_slippage_bps {
            self.state.halted = true;
            self.state.last_event = Some("halt:slippage".to_string());
            warn!(session_id = %self.session_id, slippage, "canary halted on slippage");
        } else if dd > self.cfg.max_daily_dd_pct {
            self.state.halted = true;
            self.state.last_event = Some("halt:daily_loss".to_string());
            warn!(session_id = %self.session_id, dd, "canary halted on daily loss");
        }
    }

    fn window_mean(&self, key: &str) -> f64 {
        let n = self.state.metrics_window.len();
        if n == 0 {
            return 0.0;
        }
        self.state
            .metrics_window
            .iter()
            .map(|m| m.get(key).copied().unwrap_or(0.0))
            .sum::<f64>()
            / n as f64
    }

    /// Sample standard deviation of available per-record returns, if any.
    fn realized_vol(&self) -> Option<f64> {
        let rets: Vec<f64> = self
            .state
            .metrics_window
            .iter()
            .filter_map(|m| {
                m.get("ret_bps")
                    .map(|v| v / 10_000.0)
                    .or_else(|| m.get("pnl_bps").map(|v| v / 10_000.0))
                    .or_else(|| m.get("ret").copied())
            })
            .collect();
        if rets.len() < 2 {
            return None;
        }
        let mu = rets.iter().sum::<f64>() / rets.len() as f64;
        let var = rets.iter().map(|r| (r - mu).powi(2)).sum::<f64>() / (rets.len() as f64 - 1.0);
        Some(var.max(0.0).sqrt())
    }

    // -------------------------------------------------------------------------
    // Persistence (best-effort)
    // -------------------------------------------------------------------------

    fn append_audit(&self, rec: &serde_json::Value) {
        let result = (|| -> Result<()> {
            if let Some(parent) = self.audit_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.audit_path)?;
            writeln!(file, "{rec}")?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(error = %e, path = %self.audit_path.display(), "failed to append audit line");
        }
    }

    /// Rewrite the rolling summary atomically (tmp + rename).
    fn write_summary(&self, stopped_at: Option<String>) {
        let win: Vec<&HashMap<String, f64>> = self.state.metrics_window.iter().collect();
        if win.is_empty() && stopped_at.is_none() {
            return;
        }

        let stage = self.current_stage();
        let mut summary = json!({
            "updated_at": chrono::Utc::now().to_rfc3339(),
            "session_id": self.session_id,
            "stage": stage,
            "stage_idx": self.state.stage_idx,
            "halted": self.state.halted,
            "last_event": self.state.last_event,
            "avg_slippage_bps": self.window_mean("slippage_bps"),
            "hit_rate": self.window_mean("hitrate"),
            "rolling_sharpe": self.window_mean("sharpe"),
            "realized_vol": self.realized_vol(),
            "last_heartbeat_ts": self.state.last_heartbeat_ts,
            "last_bar_ts": self.state.last_bar_ts,
            "target_capital": self.last_target_capital,
            "deploy_capital": self.last_target_capital * stage,
        });
        if let (Some(obj), Some(at)) = (summary.as_object_mut(), stopped_at) {
            obj.insert("stopped_at".to_string(), json!(at));
        }

        let result = (|| -> Result<()> {
            let tmp = self.metrics_path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_string_pretty(&summary)?)?;
            std::fs::rename(&tmp, &self.metrics_path)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(error = %e, path = %self.metrics_path.display(), "failed to write rolling summary");
        }
    }
}

/// Current VCS revision of `dir`, when it lives inside a git checkout.
fn git_revision(dir: &Path) -> Option<String> {
    let out = std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let sha = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if sha.is_empty() {
        None
    } else {
        Some(sha)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(sharpe: f64, hitrate: f64, slippage_bps: f64, daily_loss_pct: f64) -> HashMap<String, f64> {
        HashMap::from([
            ("sharpe".to_string(), sharpe),
            ("hitrate".to_string(), hitrate),
            ("slippage_bps".to_string(), slippage_bps),
            ("daily_loss_pct".to_string(), daily_loss_pct),
        ])
    }

    fn session(dir: &Path, cfg: CanaryConfig) -> LiveGuardrails {
        LiveGuardrails::start_session(dir, cfg, 300, 20, Some("test".to_string()), json!({}))
            .unwrap()
    }

    fn three_stage_cfg() -> CanaryConfig {
        CanaryConfig {
            stages: vec![0.01, 0.05, 0.10],
            window_trades: 3,
            min_sharpe: 1.0,
            min_hitrate: 0.5,
            max_slippage_bps: 10.0,
            max_daily_dd_pct: 5.0,
            vol_target_annual: None,
            vol_band_frac: 0.25,
        }
    }

    #[test]
    fn healthy_window_promotes_one_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut gr = session(dir.path(), three_stage_cfg());

        let mut stage = 0.0;
        for i in 0..3 {
            stage = gr.record(metrics(1.5, 0.6, 5.0, 1.0), 1000 + i, 1001 + i, true, 100_000.0);
        }
        assert_eq!(gr.state.stage_idx, 1);
        assert!((stage - 0.05).abs() < f64::EPSILON);
        assert_eq!(gr.state.last_event.as_deref(), Some("promote:stage_1"));
        // deploy_capital = 0.05 * target
        assert!((100_000.0 * stage - 5_000.0).abs() < 1e-9);
    }

    #[test]
    fn partial_window_never_promotes() {
        let dir = tempfile::tempdir().unwrap();
        let mut gr = session(dir.path(), three_stage_cfg());
        gr.record(metrics(5.0, 0.9, 1.0, 0.1), 1000, 1001, true, 1.0);
        gr.record(metrics(5.0, 0.9, 1.0, 0.1), 1000, 1001, true, 1.0);
        assert_eq!(gr.state.stage_idx, 0);
    }

    #[test]
    fn stage_idx_saturates_at_last_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut gr = session(dir.path(), three_stage_cfg());
        for i in 0..20 {
            gr.record(metrics(2.0, 0.8, 2.0, 0.5), 1000 + i, 1001 + i, true, 1.0);
        }
        assert_eq!(gr.state.stage_idx, 2);
        assert!(!gr.state.halted);
    }

    #[test]
    fn slippage_breach_halts_with_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut gr = session(dir.path(), three_stage_cfg());
        gr.record(metrics(1.5, 0.6, 5.0, 1.0), 1000, 1001, true, 100_000.0);
        gr.record(metrics(1.5, 0.6, 5.0, 1.0), 1000, 1001, true, 100_000.0);
        let stage = gr.record(metrics(1.5, 0.6, 99.0, 1.0), 1000, 1001, true, 100_000.0);
        assert!(gr.state.halted);
        assert_eq!(gr.state.last_event.as_deref(), Some("halt:slippage"));
        assert_eq!(stage, 0.0);
    }

    #[test]
    fn daily_loss_breach_halts() {
        let dir = tempfile::tempdir().unwrap();
        let mut gr = session(dir.path(), three_stage_cfg());
        let stage = gr.record(metrics(1.5, 0.6, 5.0, 50.0), 1000, 1001, true, 100_000.0);
        assert!(gr.state.halted);
        assert_eq!(gr.state.last_event.as_deref(), Some("halt:daily_loss"));
        assert_eq!(stage, 0.0);
    }

    #[test]
    fn stale_heartbeat_halts() {
        let dir = tempfile::tempdir().unwrap();
        let mut gr = session(dir.path(), three_stage_cfg());
        // now - last_bar = 301 > 300, broker healthy.
        let stage = gr.record(metrics(1.5, 0.6, 5.0, 1.0), 1000, 1301, true, 100_000.0);
        assert!(gr.state.halted);
        assert_eq!(gr.state.last_event.as_deref(), Some("halt:heartbeat"));
        assert_eq!(stage, 0.0);
    }

    #[test]
    fn broker_down_halts() {
        let dir = tempfile::tempdir().unwrap();
        let mut gr = session(dir.path(), three_stage_cfg());
        gr.record(metrics(1.5, 0.6, 5.0, 1.0), 1000, 1001, false, 100_000.0);
        assert!(gr.state.halted);
        assert_eq!(gr.state.last_event.as_deref(), Some("halt:heartbeat"));
    }

    #[test]
    fn halt_is_sticky_and_stage_is_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let mut gr = session(dir.path(), three_stage_cfg());
        for i in 0..3 {
            gr.record(metrics(1.5, 0.6, 5.0, 1.0), 1000 + i, 1001 + i, true, 1.0);
        }
        let stage_before = gr.state.stage_idx;
        gr.record(metrics(1.5, 0.6, 99.0, 1.0), 1004, 1005, true, 1.0);
        assert!(gr.state.halted);

        // Healthy records afterwards must not clear the halt or move stages.
        for i in 0..10 {
            let stage = gr.record(metrics(3.0, 0.9, 1.0, 0.1), 2000 + i, 2001 + i, true, 1.0);
            assert_eq!(stage, 0.0);
            assert!(gr.state.halted);
            assert!(gr.state.stage_idx >= stage_before);
        }
    }

    #[test]
    fn vol_guard_blocks_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = three_stage_cfg();
        cfg.vol_target_annual = Some(0.0001);
        cfg.vol_band_frac = 0.0;
        let mut gr = session(dir.path(), cfg);
        for i in 0..5 {
            let mut m = metrics(2.0, 0.8, 1.0, 0.1);
            // Alternating returns give the window real variance.
            m.insert("ret_bps".to_string(), if i % 2 == 0 { 50.0 } else { -50.0 });
            gr.record(m, 1000 + i, 1001 + i, true, 1.0);
        }
        assert_eq!(gr.state.stage_idx, 0);
        assert!(!gr.state.halted);
    }

    #[test]
    fn audit_log_grows_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut gr = session(dir.path(), three_stage_cfg());
        gr.record(metrics(1.0, 0.5, 1.0, 0.1), 1000, 1001, true, 50_000.0);
        gr.record(metrics(1.0, 0.5, 1.0, 0.1), 1002, 1003, true, 50_000.0);

        let content = std::fs::read_to_string(dir.path().join("live_audit.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        // start seed + 2 records
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "start");
        assert_eq!(lines[1]["target_capital"], 50_000.0);
        assert_eq!(lines[1]["sharpe"], 1.0);
        assert!(lines[1]["risk_flags"].as_array().unwrap().is_empty());
    }

    #[test]
    fn halt_records_carry_risk_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut gr = session(dir.path(), three_stage_cfg());
        gr.record(metrics(1.5, 0.6, 99.0, 1.0), 1000, 1001, true, 1.0);

        let content = std::fs::read_to_string(dir.path().join("live_audit.jsonl")).unwrap();
        let last: serde_json::Value =
            serde_json::from_str(content.lines().last().unwrap()).unwrap();
        assert_eq!(last["halted"], true);
        assert_eq!(last["risk_flags"], json!(["slippage"]));
    }

    #[test]
    fn summary_written_every_n_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut gr = LiveGuardrails::start_session(
            dir.path(),
            three_stage_cfg(),
            300,
            2,
            Some("test".to_string()),
            json!({}),
        )
        .unwrap();
        let metrics_path = dir.path().join("live_metrics.json");

        gr.record(metrics(1.0, 0.6, 4.0, 0.5), 1000, 1001, true, 1000.0);
        assert!(!metrics_path.exists());
        gr.record(metrics(1.0, 0.6, 4.0, 0.5), 1002, 1003, true, 1000.0);
        assert!(metrics_path.exists());

        let summary: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&metrics_path).unwrap()).unwrap();
        assert_eq!(summary["session_id"], "test");
        assert!((summary["avg_slippage_bps"].as_f64().unwrap() - 4.0).abs() < 1e-9);
        assert!(!metrics_path.with_extension("json.tmp").exists());
    }

    #[test]
    fn stop_appends_final_audit_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut gr = session(dir.path(), three_stage_cfg());
        gr.record(metrics(1.0, 0.6, 4.0, 0.5), 1000, 1001, true, 1000.0);
        gr.stop();

        let content = std::fs::read_to_string(dir.path().join("live_audit.jsonl")).unwrap();
        let last: serde_json::Value =
            serde_json::from_str(content.lines().last().unwrap()).unwrap();
        assert_eq!(last["event"], "stop");

        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("live_metrics.json")).unwrap(),
        )
        .unwrap();
        assert!(summary["stopped_at"].is_string());
    }

    #[test]
    fn session_meta_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let _gr = session(dir.path(), three_stage_cfg());
        let meta: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("live_session.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta["session_id"], "test");
        assert_eq!(meta["config"]["window_trades"], 3);
    }
}
