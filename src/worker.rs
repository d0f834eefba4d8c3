// =============================================================================
// Smoke worker — bundled worker process for end-to-end exercising
// =============================================================================
//
// Launched as `helios-lab smoke-worker --kind train --config <snapshot>
// --out <dir> --bars N --seed S`. Reads the config snapshot, emits per-bar
// telemetry plus start/stop events through the telemetry writer, writes the
// report artifacts, and (for training runs) a policy archive. Exit code 0 on
// success; the launcher records any other code verbatim.
//
// Real training and backtest workers live outside this crate; this one keeps
// a fresh checkout runnable without a Python environment.
// =============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use crate::telemetry::TelemetryWriter;

#[derive(Debug)]
struct SmokeArgs {
    kind: String,
    config: PathBuf,
    out: PathBuf,
    bars: u32,
    seed: u64,
}

fn parse_args(args: &[String]) -> Result<SmokeArgs> {
    let mut kind = "train".to_string();
    let mut config = None;
    let mut out = None;
    let mut bars = 32u32;
    let mut seed = 42u64;

    let mut it = args.iter();
    while let Some(arg) = it.next() {
        let mut value = |name: &str| -> Result<String> {
            it.next()
                .cloned()
                .with_context(|| format!("missing value for {name}"))
        };
        match arg.as_str() {
            "--kind" => kind = value("--kind")?,
            "--config" => config = Some(PathBuf::from(value("--config")?)),
            "--out" => out = Some(PathBuf::from(value("--out")?)),
            "--bars" => bars = value("--bars")?.parse().context("bad --bars")?,
            "--seed" => seed = value("--seed")?.parse().context("bad --seed")?,
            other => bail!("unknown smoke-worker argument: {other}"),
        }
    }

    Ok(SmokeArgs {
        kind,
        config: config.context("--config is required")?,
        out: out.context("--out is required")?,
        bars,
        seed,
    })
}

/// Entry point for the `smoke-worker` subcommand. Returns the process exit
/// code.
pub fn run_smoke(args: &[String]) -> i32 {
    match run_inner(args) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("smoke-worker failed: {e:#}");
            1
        }
    }
}

fn run_inner(args: &[String]) -> Result<()> {
    let args = parse_args(args)?;

    let config: serde_yaml::Value = serde_yaml::from_str(
        &std::fs::read_to_string(&args.config)
            .with_context(|| format!("failed to read config {}", args.config.display()))?,
    )
    .context("failed to parse config snapshot")?;

    let symbols: Vec<String> = config
        .get("env")
        .and_then(|e| e.get("symbols"))
        .and_then(|s| serde_yaml::from_value(s.clone()).ok())
        .unwrap_or_else(|| vec!["AAPL".to_string(), "MSFT".to_string()]);

    let report_dir = args.out.join("report");
    std::fs::create_dir_all(&report_dir)
        .with_context(|| format!("failed to create {}", report_dir.display()))?;

    let telemetry = TelemetryWriter::from_env();
    telemetry.emit_event(json!({
        "event": "start",
        "worker": "smoke",
        "job_kind": args.kind,
        "bars": args.bars,
    }));

    let mut rng = StdRng::seed_from_u64(args.seed);
    let start_cash = 100_000.0;
    let mut nav = start_cash;
    let mut peak = nav;
    let mut equity = Vec::with_capacity(args.bars as usize);

    for bar_idx in 0..args.bars {
        let bar_bps = (rng.gen::<f64>() - 0.48) * 60.0;
        nav *= 1.0 + bar_bps / 10_000.0;
        peak = peak.max(nav);
        let dd_pct = (peak - nav) / peak * 100.0;
        let cum_pct = (nav / start_cash - 1.0) * 100.0;
        let t = chrono::Utc::now().to_rfc3339();

        telemetry.emit_bar(json!({
            "t": t,
            "bar_idx": bar_idx,
            "symbols": symbols,
            "positions": { "cash": nav, "nav": nav },
            "pnl": { "bar_bps": bar_bps, "cum_pct": cum_pct, "dd_pct": dd_pct },
            "health": { "heartbeat_ms": 0, "status": "ok" },
            "schema": "v1",
        }));
        if bar_idx > 0 && bar_idx % 8 == 0 {
            telemetry.emit_rollup(json!({
                "bar_idx": bar_idx,
                "window": 8,
                "nav": nav,
                "cum_pct": cum_pct,
            }));
        }
        equity.push((t, nav));

        // Pace the run so supervision (pid capture, cancel) is observable.
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    write_reports(&report_dir, &args, &symbols, start_cash, nav, &equity)?;
    if args.kind == "train" {
        write_policy_archive(&args.out)?;
    }

    telemetry.emit_event(json!({
        "event": "stop",
        "worker": "smoke",
        "final_nav": nav,
    }));
    Ok(())
}

fn write_reports(
    report_dir: &Path,
    args: &SmokeArgs,
    symbols: &[String],
    start_cash: f64,
    nav: f64,
    equity: &[(String, f64)],
) -> Result<()> {
    let metrics = json!({
        "bars": args.bars,
        "final_nav": nav,
        "total_return_pct": (nav / start_cash - 1.0) * 100.0,
        "seed": args.seed,
    });
    std::fs::write(
        report_dir.join("metrics.json"),
        serde_json::to_string_pretty(&metrics)?,
    )?;

    let summary = json!({
        "kind": args.kind,
        "symbols": symbols,
        "config": args.config.to_string_lossy(),
        "generated_at": chrono::Utc::now().to_rfc3339(),
    });
    std::fs::write(
        report_dir.join("summary.json"),
        serde_json::to_string_pretty(&summary)?,
    )?;

    let mut equity_csv = String::from("timestamp,nav\n");
    for (t, v) in equity {
        equity_csv.push_str(&format!("{t},{v:.2}\n"));
    }
    std::fs::write(report_dir.join("equity.csv"), equity_csv)?;
    std::fs::write(report_dir.join("orders.csv"), "ts,symbol,side,qty,price\n")?;
    std::fs::write(report_dir.join("trades.csv"), "ts,symbol,qty,price,pnl\n")?;
    Ok(())
}

fn write_policy_archive(out_dir: &Path) -> Result<()> {
    let file = std::fs::File::create(out_dir.join("ppo_policy.zip"))
        .context("failed to create policy archive")?;
    let mut zip = zip::ZipWriter::new(file);
    let options: zip::write::SimpleFileOptions = Default::default();
    zip.start_file("policy.json", options)?;
    zip.write_all(
        serde_json::to_string_pretty(&json!({
            "family": "smoke",
            "trained_at": chrono::Utc::now().to_rfc3339(),
        }))?
        .as_bytes(),
    )?;
    zip.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn str_args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn args_parse_with_defaults() {
        let args = parse_args(&str_args(&["--config", "/c.yaml", "--out", "/o"])).unwrap();
        assert_eq!(args.kind, "train");
        assert_eq!(args.bars, 32);
        assert_eq!(args.seed, 42);
    }

    #[test]
    fn unknown_args_are_rejected() {
        let err = parse_args(&str_args(&["--config", "/c", "--out", "/o", "--nope", "1"]))
            .unwrap_err();
        assert!(err.to_string().contains("--nope"));
        assert!(parse_args(&str_args(&["--out", "/o"])).is_err());
    }

    #[test]
    fn smoke_run_writes_reports_and_policy() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        let config = dir.path().join("config.snapshot.yaml");
        std::fs::write(&config, "env:\n  symbols: [AAA]\n").unwrap();

        let code = run_smoke(&str_args(&[
            "--kind",
            "train",
            "--config",
            config.to_str().unwrap(),
            "--out",
            out.to_str().unwrap(),
            "--bars",
            "4",
            "--seed",
            "1",
        ]));
        assert_eq!(code, 0);
        assert!(out.join("report/metrics.json").is_file());
        assert!(out.join("report/summary.json").is_file());
        assert!(out.join("report/equity.csv").is_file());
        assert!(out.join("ppo_policy.zip").is_file());

        let metrics: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.join("report/metrics.json")).unwrap())
                .unwrap();
        assert_eq!(metrics["bars"], 4);
        let summary: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.join("report/summary.json")).unwrap())
                .unwrap();
        assert_eq!(summary["symbols"], json!(["AAA"]));
    }

    #[test]
    fn backtest_kind_skips_policy_archive() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        let config = dir.path().join("config.snapshot.yaml");
        std::fs::write(&config, "env: {}\n").unwrap();

        let code = run_smoke(&str_args(&[
            "--kind",
            "backtest",
            "--config",
            config.to_str().unwrap(),
            "--out",
            out.to_str().unwrap(),
            "--bars",
            "3",
        ]));
        assert_eq!(code, 0);
        assert!(!out.join("ppo_policy.zip").exists());
    }

    #[test]
    fn missing_config_fails_nonzero() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let code = run_smoke(&str_args(&[
            "--config",
            "/does/not/exist.yaml",
            "--out",
            out.to_str().unwrap(),
        ]));
        assert_eq!(code, 1);
    }
}
