// =============================================================================
// Job Launcher — typed requests to supervised worker subprocesses
// =============================================================================
//
// Submission path: resolve the output directory, deep-merge request overrides
// into the base config, write the merged snapshot, register a QUEUED record,
// then hand off to a background supervisor task. The supervisor flips the
// record to RUNNING, spawns the child with a sanitized environment, streams
// combined stdout+stderr into job.log, and records the exit outcome.
//
// The argument vector is built from a fixed, declarative flag mapping; there
// is no shell interpolation anywhere on this path. Every argument is a
// non-empty string by construction.
// =============================================================================

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::paths;
use crate::registry::RunRecord;
use crate::requests::{BacktestRequest, TrainRequest};
use crate::runtime_config::{WorkerConfig, WorkerKind};
use crate::types::{RunStatus, RunType};

/// A fully resolved worker invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct JobCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl JobCommand {
    /// All arguments coerce to non-empty strings; an empty entry is an
    /// internal error caught before spawn.
    fn validate(&self) -> Result<()> {
        if self.program.is_empty() {
            bail!("internal error: empty worker program");
        }
        if let Some(pos) = self.args.iter().position(|a| a.is_empty()) {
            bail!("internal error: empty worker argument at position {pos}");
        }
        Ok(())
    }

    fn command_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

// =============================================================================
// Config snapshot
// =============================================================================

/// Deep-merge `src` into `dst`. Null values in `src` are skipped; nested
/// mappings merge recursively; everything else overwrites.
pub fn deep_merge(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(dst_map), serde_yaml::Value::Mapping(src_map)) => {
            for (key, value) in src_map {
                if value.is_null() {
                    continue;
                }
                match dst_map.get_mut(&key) {
                    Some(existing) if existing.is_mapping() && value.is_mapping() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        dst_map.insert(key, value);
                    }
                }
            }
        }
        (dst, src) => {
            if !src.is_null() {
                *dst = src;
            }
        }
    }
}

/// Request overrides that merge into the base config under the `env` key.
fn build_env_overrides(req: &TrainRequest) -> Result<serde_yaml::Value> {
    let mut map = serde_yaml::Mapping::new();
    let mut put = |key: &str, value: serde_yaml::Value| {
        if !value.is_null() {
            map.insert(serde_yaml::Value::String(key.to_string()), value);
        }
    };
    put("symbols", serde_yaml::to_value(&req.symbols)?);
    put("start", serde_yaml::to_value(&req.start)?);
    put("end", serde_yaml::to_value(&req.end)?);
    put("interval", serde_yaml::to_value(&req.interval)?);
    put("adjusted", serde_yaml::to_value(req.adjusted)?);
    put("fees", serde_yaml::to_value(&req.fees)?);
    put("margin", serde_yaml::to_value(&req.margin)?);
    put("execution", serde_yaml::to_value(&req.execution)?);
    put("episode", serde_yaml::to_value(&req.episode)?);
    put("features", serde_yaml::to_value(&req.features)?);
    put("reward", serde_yaml::to_value(&req.reward)?);
    Ok(serde_yaml::Value::Mapping(map))
}

fn load_base_config(project_root: &Path, config_path: &str) -> Result<serde_yaml::Value> {
    let path = if Path::new(config_path).is_absolute() {
        PathBuf::from(config_path)
    } else {
        project_root.join(config_path)
    };
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("config_path not found: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse YAML config {}", path.display()))
}

/// Merge request overrides into the base config and write the snapshot.
pub fn write_snapshot(
    project_root: &Path,
    config_path: &str,
    overrides: Option<serde_yaml::Value>,
    out_dir: &Path,
) -> Result<PathBuf> {
    let mut merged = load_base_config(project_root, config_path)?;
    if let Some(overrides) = overrides {
        let mut wrapper = serde_yaml::Mapping::new();
        wrapper.insert(serde_yaml::Value::String("env".to_string()), overrides);
        deep_merge(&mut merged, serde_yaml::Value::Mapping(wrapper));
    }

    let snap_path = out_dir.join("config.snapshot.yaml");
    let content = serde_yaml::to_string(&merged).context("failed to serialise config snapshot")?;
    std::fs::write(&snap_path, content)
        .with_context(|| format!("failed to write snapshot {}", snap_path.display()))?;
    Ok(snap_path)
}

// =============================================================================
// Argument vectors (declarative flag mapping; no free-form interpolation)
// =============================================================================

/// PPO hyperparameter -> CLI flag table for the training worker.
const HYPERPARAM_FLAGS: [(&str, &str); 10] = [
    ("n_steps", "--n-steps"),
    ("batch_size", "--batch-size"),
    ("learning_rate", "--learning-rate"),
    ("gamma", "--gamma"),
    ("gae_lambda", "--gae-lambda"),
    ("clip_range", "--clip-range"),
    ("entropy_coef", "--entropy-coef"),
    ("vf_coef", "--vf-coef"),
    ("max_grad_norm", "--max-grad-norm"),
    ("dropout", "--dropout"),
];

fn hyperparam_value(req: &TrainRequest, name: &str) -> Option<String> {
    match name {
        "n_steps" => req.n_steps.map(|v| v.to_string()),
        "batch_size" => req.batch_size.map(|v| v.to_string()),
        "learning_rate" => req.learning_rate.map(|v| v.to_string()),
        "gamma" => req.gamma.map(|v| v.to_string()),
        "gae_lambda" => req.gae_lambda.map(|v| v.to_string()),
        "clip_range" => req.clip_range.map(|v| v.to_string()),
        "entropy_coef" => req.entropy_coef.map(|v| v.to_string()),
        "vf_coef" => req.vf_coef.map(|v| v.to_string()),
        "max_grad_norm" => req.max_grad_norm.map(|v| v.to_string()),
        "dropout" => req.dropout.map(|v| v.to_string()),
        _ => None,
    }
}

/// Build the training worker invocation.
pub fn build_train_command(
    worker: &WorkerConfig,
    req: &TrainRequest,
    snapshot: &Path,
    out_dir: &Path,
) -> Result<JobCommand> {
    let cmd = match worker.kind {
        WorkerKind::Builtin => JobCommand {
            program: current_exe()?,
            args: vec![
                "smoke-worker".to_string(),
                "--kind".to_string(),
                "train".to_string(),
                "--config".to_string(),
                snapshot.to_string_lossy().into_owned(),
                "--out".to_string(),
                out_dir.to_string_lossy().into_owned(),
                "--bars".to_string(),
                worker.smoke_bars.to_string(),
                "--seed".to_string(),
                req.seed.to_string(),
            ],
        },
        WorkerKind::Python => {
            let mut args = vec![
                "-m".to_string(),
                worker.train_module.clone(),
                "--config".to_string(),
                snapshot.to_string_lossy().into_owned(),
                "--timesteps".to_string(),
                req.timesteps.to_string(),
                "--out".to_string(),
                out_dir.to_string_lossy().into_owned(),
                "--seed".to_string(),
                req.seed.to_string(),
                "--policy".to_string(),
                req.policy.to_string(),
            ];
            if req.normalize {
                args.push("--normalize".to_string());
            }
            for (flag, value) in [
                ("--train-start", &req.train_start),
                ("--train-end", &req.train_end),
                ("--eval-start", &req.eval_start),
                ("--eval-end", &req.eval_end),
            ] {
                if let Some(v) = value {
                    args.push(flag.to_string());
                    args.push(v.clone());
                }
            }
            for (name, flag) in HYPERPARAM_FLAGS {
                if let Some(v) = hyperparam_value(req, name) {
                    args.push(flag.to_string());
                    args.push(v);
                }
            }
            JobCommand {
                program: worker.python_bin.clone(),
                args,
            }
        }
    };
    cmd.validate()?;
    Ok(cmd)
}

/// Build the backtest worker invocation.
pub fn build_backtest_command(
    worker: &WorkerConfig,
    req: &BacktestRequest,
    snapshot: &Path,
    out_dir: &Path,
) -> Result<JobCommand> {
    let cmd = match worker.kind {
        WorkerKind::Builtin => JobCommand {
            program: current_exe()?,
            args: vec![
                "smoke-worker".to_string(),
                "--kind".to_string(),
                "backtest".to_string(),
                "--config".to_string(),
                snapshot.to_string_lossy().into_owned(),
                "--out".to_string(),
                out_dir.to_string_lossy().into_owned(),
                "--bars".to_string(),
                worker.smoke_bars.to_string(),
                "--seed".to_string(),
                "42".to_string(),
            ],
        },
        WorkerKind::Python => {
            let symbols: Vec<String> = req
                .symbols
                .as_deref()
                .unwrap_or(&[])
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            let mut args = vec![
                "-m".to_string(),
                worker.backtest_module.clone(),
                "--config".to_string(),
                snapshot.to_string_lossy().into_owned(),
                "--policy".to_string(),
                req.policy.clone(),
                "--start".to_string(),
                req.start.clone().unwrap_or_default(),
                "--end".to_string(),
                req.end.clone().unwrap_or_default(),
                "--out".to_string(),
                out_dir.to_string_lossy().into_owned(),
            ];
            if !symbols.is_empty() {
                args.push("--symbols".to_string());
                args.extend(symbols);
            }
            if req.normalize {
                args.push("--normalize".to_string());
            }
            JobCommand {
                program: worker.python_bin.clone(),
                args,
            }
        }
    };
    cmd.validate()?;
    Ok(cmd)
}

fn current_exe() -> Result<String> {
    Ok(std::env::current_exe()
        .context("failed to resolve current executable")?
        .to_string_lossy()
        .into_owned())
}

// =============================================================================
// Submission
// =============================================================================

fn fresh_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..10].to_string()
}

/// Accept a training request: snapshot, register, schedule. Returns the
/// QUEUED record.
pub fn start_train(state: &Arc<AppState>, req: TrainRequest) -> Result<RunRecord> {
    req.validate().map_err(anyhow::Error::msg)?;

    let out_dir = state
        .paths
        .resolve_out_dir(req.out_dir.as_deref(), req.out_tag.as_deref())?;

    let config_path = req
        .config_path
        .clone()
        .unwrap_or_else(|| state.runtime_config.read().default_config_path.clone());
    let overrides = build_env_overrides(&req)?;
    let snapshot = write_snapshot(
        &state.paths.project_root,
        &config_path,
        Some(overrides),
        &out_dir,
    )?;

    let run_id = fresh_run_id();
    let meta = serde_json::json!({
        "payload": serde_json::to_value(&req)?,
        "config_snapshot": snapshot.to_string_lossy(),
    });
    let rec = RunRecord::new_queued(
        run_id.clone(),
        RunType::Train,
        out_dir.to_string_lossy().into_owned(),
        meta,
    );
    let rec = state.registry.save(rec);

    let worker = state.runtime_config.read().worker.clone();
    let command = build_train_command(&worker, &req, &snapshot, &out_dir)?;
    schedule(state.clone(), run_id, command);
    Ok(rec)
}

/// Accept a backtest request.
pub fn start_backtest(state: &Arc<AppState>, req: BacktestRequest) -> Result<RunRecord> {
    req.validate().map_err(anyhow::Error::msg)?;

    let out_dir = state
        .paths
        .resolve_out_dir(req.out_dir.as_deref(), req.out_tag.as_deref())?;

    let config_path = req
        .config_path
        .clone()
        .unwrap_or_else(|| state.runtime_config.read().default_config_path.clone());
    let snapshot = write_snapshot(&state.paths.project_root, &config_path, None, &out_dir)?;

    let run_id = fresh_run_id();
    let meta = serde_json::json!({
        "payload": serde_json::to_value(&req)?,
        "config_snapshot": snapshot.to_string_lossy(),
    });
    let rec = RunRecord::new_queued(
        run_id.clone(),
        RunType::Backtest,
        out_dir.to_string_lossy().into_owned(),
        meta,
    );
    let rec = state.registry.save(rec);

    let worker = state.runtime_config.read().worker.clone();
    let command = build_backtest_command(&worker, &req, &snapshot, &out_dir)?;
    schedule(state.clone(), run_id, command);
    Ok(rec)
}

fn schedule(state: Arc<AppState>, run_id: String, command: JobCommand) {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    state.register_cancel(&run_id, cancel_tx);
    tokio::spawn(async move {
        supervise(state, run_id, command, cancel_rx).await;
    });
}

// =============================================================================
// Supervision
// =============================================================================

async fn supervise(
    state: Arc<AppState>,
    run_id: String,
    command: JobCommand,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let Some(mut rec) = state.registry.get(&run_id) else {
        warn!(run_id = %run_id, "record vanished before spawn");
        return;
    };

    rec.status = RunStatus::Running;
    rec.started_at = Some(chrono::Utc::now().to_rfc3339());
    rec = state.registry.save(rec);

    let out_dir = PathBuf::from(&rec.out_dir);
    let outcome = spawn_and_wait(&state, &mut rec, &command, &out_dir, &mut cancel_rx).await;

    rec.finished_at = Some(chrono::Utc::now().to_rfc3339());
    match outcome {
        Outcome::Exited(0) => {
            rec.status = RunStatus::Succeeded;
            rec.error = None;
            info!(run_id = %rec.id, "run succeeded");
        }
        Outcome::Exited(code) => {
            rec.status = RunStatus::Failed;
            rec.error = Some(format!("exit_code={code}"));
            warn!(run_id = %rec.id, code, "run failed");
        }
        Outcome::Cancelled => {
            rec.status = RunStatus::Cancelled;
            rec.error = None;
            info!(run_id = %rec.id, "run cancelled");
        }
        Outcome::SpawnFailed(msg) => {
            rec.status = RunStatus::Failed;
            rec.error = Some(msg.clone());
            error!(run_id = %rec.id, error = %msg, "run spawn failed");
        }
    }
    state.registry.save(rec);
    state.take_cancel(&run_id);
}

enum Outcome {
    Exited(i32),
    Cancelled,
    SpawnFailed(String),
}

async fn spawn_and_wait(
    state: &Arc<AppState>,
    rec: &mut RunRecord,
    command: &JobCommand,
    out_dir: &Path,
    cancel_rx: &mut oneshot::Receiver<()>,
) -> Outcome {
    if let Err(e) = std::fs::create_dir_all(out_dir) {
        return Outcome::SpawnFailed(format!("failed to create out dir: {e}"));
    }
    let log_path = out_dir.join("job.log");
    let mut log = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
    {
        Ok(f) => f,
        Err(e) => return Outcome::SpawnFailed(format!("failed to open job.log: {e}")),
    };
    let _ = log
        .write_all(
            format!("[{}] CMD: {}\n", chrono::Utc::now().to_rfc3339(), command.command_line())
                .as_bytes(),
        )
        .await;
    let _ = log.flush().await;

    let log_std = match log.into_std().await.try_clone() {
        Ok(f) => f,
        Err(e) => return Outcome::SpawnFailed(format!("failed to clone job.log handle: {e}")),
    };
    let log_err = match log_std.try_clone() {
        Ok(f) => f,
        Err(e) => return Outcome::SpawnFailed(format!("failed to clone job.log handle: {e}")),
    };

    let (telemetry_path, event_path, rollup_path) = paths::telemetry_paths(out_dir);
    let mut cmd = tokio::process::Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(&state.paths.project_root)
        .stdout(Stdio::from(log_std))
        .stderr(Stdio::from(log_err))
        .env("PYTHONIOENCODING", "utf-8")
        .env("PYTHONUTF8", "1")
        .env("STOCKBOT_RUN_ID", &rec.id)
        .env("STOCKBOT_TELEMETRY_PATH", &telemetry_path)
        .env("STOCKBOT_EVENT_PATH", &event_path)
        .env("STOCKBOT_ROLLUP_PATH", &rollup_path);

    // Force the project root onto the worker module path.
    let root = state.paths.project_root.to_string_lossy().into_owned();
    let pythonpath = match std::env::var("PYTHONPATH") {
        Ok(existing) if !existing.split(':').any(|p| p == root) => {
            format!("{root}:{existing}")
        }
        Ok(existing) => existing,
        Err(_) => root,
    };
    cmd.env("PYTHONPATH", pythonpath);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return Outcome::SpawnFailed(format!("spawn failed: {e}")),
    };

    if let Some(pid) = child.id() {
        rec.pid = Some(pid);
        *rec = state.registry.save(rec.clone());
    }

    tokio::select! {
        status = child.wait() => {
            let code = match status {
                Ok(s) => s.code().unwrap_or(-1),
                Err(e) => {
                    return Outcome::SpawnFailed(format!("wait failed: {e}"));
                }
            };
            let _ = append_log_line(&log_path, &format!("EXIT: {code}")).await;
            Outcome::Exited(code)
        }
        _ = cancel_rx => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = append_log_line(&log_path, "CANCELLED").await;
            Outcome::Cancelled
        }
    }
}

async fn append_log_line(log_path: &Path, line: &str) -> std::io::Result<()> {
    let mut log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await?;
    log.write_all(format!("[{}] {line}\n", chrono::Utc::now().to_rfc3339()).as_bytes())
        .await?;
    log.flush().await
}

// =============================================================================
// Cancellation
// =============================================================================

/// Why a cancel request was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelError {
    NotFound,
    /// The run already finished (SUCCEEDED or FAILED); cancelling a
    /// CANCELLED run stays a no-op.
    AlreadyFinished(RunStatus),
}

/// Request cancellation of a run. Idempotent: cancelling an already
/// cancelled run returns its record unchanged.
pub fn cancel(state: &Arc<AppState>, run_id: &str) -> Result<RunRecord, CancelError> {
    let rec = state.registry.get(run_id).ok_or(CancelError::NotFound)?;

    match rec.status {
        RunStatus::Cancelled => Ok(rec),
        status if status.is_terminal() => Err(CancelError::AlreadyFinished(status)),
        _ => {
            if let Some(tx) = state.take_cancel(run_id) {
                // Supervisor marks the record CANCELLED once the child is
                // down; a lost receiver means the run just finished.
                let _ = tx.send(());
                Ok(rec)
            } else {
                // No live process handle (e.g. record replayed after a
                // restart): mark the intent directly.
                let mut rec = rec;
                rec.status = RunStatus::Cancelled;
                rec.finished_at = Some(chrono::Utc::now().to_rfc3339());
                rec.error = Some("cancelled without live process handle".to_string());
                Ok(state.registry.save(rec))
            }
        }
    }
}
