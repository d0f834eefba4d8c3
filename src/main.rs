// =============================================================================
// Helios Lab — Main Entry Point
// =============================================================================
//
// Control plane for machine-learning trading experiments: run orchestration,
// telemetry fan-out and live canary guardrails. Heavy work (training,
// backtesting) always runs in supervised worker subprocesses, never
// in-process.
//
// Invoked as `helios-lab smoke-worker ...` the binary acts as the bundled
// worker instead of starting the server.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod dataset;
mod guardrails;
mod launcher;
mod paths;
mod registry;
mod requests;
mod runtime_config;
mod telemetry;
mod types;
mod worker;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::paths::PathConfig;
use crate::runtime_config::RuntimeConfig;

const CONFIG_FILE: &str = "helios_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Worker dispatch ──────────────────────────────────────────────────
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("smoke-worker") {
        std::process::exit(worker::run_smoke(&args[2..]));
    }

    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Helios Lab control plane starting up");

    let config = RuntimeConfig::load(CONFIG_FILE).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    let paths = PathConfig::from_env()?;
    info!(
        project_root = %paths.project_root.display(),
        runs_dir = %paths.runs_dir.display(),
        "paths resolved"
    );

    seed_base_config(&paths, &config);

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config, paths)?);
    info!(runs = state.registry.list().len(), "run registry replayed");

    // ── 3. Start the API server ──────────────────────────────────────────
    let bind_addr = std::env::var("HELIOS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── 4. Graceful shutdown ─────────────────────────────────────────────
    warn!("Shutdown signal received — stopping gracefully");

    if let Some(mut guardrails) = state.live.lock().take() {
        guardrails.stop();
    }
    if let Err(e) = state.runtime_config.read().save(CONFIG_FILE) {
        warn!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Helios Lab shut down complete.");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Make a fresh checkout runnable: write the default base config if the
/// configured path does not exist yet.
fn seed_base_config(paths: &PathConfig, config: &RuntimeConfig) {
    let base = paths.project_root.join(&config.default_config_path);
    if base.exists() {
        return;
    }
    let Some(parent) = base.parent() else { return };
    if let Err(e) = std::fs::create_dir_all(parent) {
        warn!(error = %e, "failed to create config dir");
        return;
    }
    let default_yaml = "\
env:
  symbols: [AAPL, MSFT]
  interval: 1d
  adjusted: true
episode:
  lookback: 64
  start_cash: 100000.0
";
    match std::fs::write(&base, default_yaml) {
        Ok(()) => info!(path = %base.display(), "seeded default base config"),
        Err(e) => warn!(error = %e, path = %base.display(), "failed to seed base config"),
    }
}
