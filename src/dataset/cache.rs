// =============================================================================
// OHLCV cache — deterministic per-symbol slice files
// =============================================================================
//
// Each cached slice is a CSV file whose name encodes the full query
// (symbol, interval, adjusted, start, end), so a repeated query hits the same
// file. Writes are idempotent: an existing file is never rewritten, which
// keeps manifest hashes stable across identical requests.
//
// Bars are synthesized deterministically from the symbol name; the vendor
// fetch lives behind this seam and is out of scope for the control plane.
// =============================================================================

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Ensure a cached file exists for every symbol; returns symbol -> path.
pub fn ensure_cached(
    cache_dir: &Path,
    symbols: &[String],
    interval: &str,
    adjusted: bool,
    start: &str,
    end: &str,
) -> Result<BTreeMap<String, PathBuf>> {
    std::fs::create_dir_all(cache_dir)
        .with_context(|| format!("failed to create cache dir {}", cache_dir.display()))?;

    let timestamps = bar_timestamps(start, end, interval)?;
    let mut result = BTreeMap::new();

    for sym in symbols {
        let adj = if adjusted { "adj" } else { "raw" };
        let fname = format!("{sym}_{interval}_{adj}_{start}_{end}.csv");
        let path = cache_dir.join(fname);
        if !path.exists() {
            write_slice(&path, sym, &timestamps)
                .with_context(|| format!("failed to materialize slice for {sym}"))?;
        }
        result.insert(sym.clone(), path);
    }
    Ok(result)
}

/// Bar timestamps for the inclusive `[start, end]` date range.
pub fn bar_timestamps(start: &str, end: &str, interval: &str) -> Result<Vec<NaiveDateTime>> {
    let step = match interval {
        "1d" => Duration::days(1),
        "1h" => Duration::hours(1),
        "15m" => Duration::minutes(15),
        other => bail!("unsupported interval: {other}"),
    };
    let start = NaiveDate::parse_from_str(start, "%Y-%m-%d")
        .with_context(|| format!("bad start date: {start}"))?
        .and_time(chrono::NaiveTime::MIN);
    let end = NaiveDate::parse_from_str(end, "%Y-%m-%d")
        .with_context(|| format!("bad end date: {end}"))?
        .and_time(chrono::NaiveTime::MIN);
    if end < start {
        bail!("end date precedes start date");
    }

    let mut out = Vec::new();
    let mut t = start;
    while t <= end {
        out.push(t);
        t += step;
    }
    Ok(out)
}

fn write_slice(path: &Path, symbol: &str, timestamps: &[NaiveDateTime]) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(symbol_seed(symbol));

    let tmp = path.with_extension("csv.tmp");
    let mut file = std::fs::File::create(&tmp)
        .with_context(|| format!("failed to create {}", tmp.display()))?;
    writeln!(file, "timestamp,open,high,low,close,adj_close,volume")?;

    let mut close = 50.0 + rng.gen::<f64>() * 100.0;
    for ts in timestamps {
        let open = close;
        close = (close * (1.0 + (rng.gen::<f64>() - 0.5) * 0.04)).max(1.0);
        let spread = close.max(open) * rng.gen::<f64>() * 0.01;
        let high = close.max(open) + spread;
        let low = (close.min(open) - spread).max(0.5);
        let volume: u64 = rng.gen_range(10_000..1_000_000);
        writeln!(
            file,
            "{},{:.6},{:.6},{:.6},{:.6},{:.6},{}",
            ts.format(TIMESTAMP_FORMAT),
            open,
            high,
            low,
            close,
            close,
            volume
        )?;
    }
    file.flush()?;
    drop(file);

    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} into place", tmp.display()))?;
    Ok(())
}

/// Stable 64-bit seed from a symbol name (FNV-1a).
fn symbol_seed(symbol: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in symbol.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
