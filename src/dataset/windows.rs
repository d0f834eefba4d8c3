// =============================================================================
// Feature windows — (T, lookback, N, F) tensors with a no-leak guarantee
// =============================================================================
//
// Per-symbol frames are union-aligned on their timestamps, features are
// computed from trailing statistics only, and windows of `lookback` bars are
// emitted for every valid end t in [lookback-1, T - embargo_bars). Nothing
// inside a window derives from a bar after the window's end timestamp, and
// the last `embargo_bars` bars never serve as window ends.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Which feature columns to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSet {
    /// Raw open/high/low/close/volume.
    Ohlcv,
    /// OHLCV plus the minimal alias set: log-returns, multi-horizon
    /// log-returns, realized vol, ATR14, band widths, volume z-score and
    /// Amihud illiquidity.
    MinimalCore,
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self::Ohlcv
    }
}

/// Window construction parameters.
#[derive(Debug, Clone)]
pub struct WindowSpec {
    pub feature_set: FeatureSet,
    /// Trailing bars excluded from valid window ends.
    pub embargo_bars: usize,
    /// Per-window z-score over the lookback axis only.
    pub normalize_obs: bool,
}

/// Rectangular window tensor with aligned axis labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureWindows {
    /// Flat row-major data: [windows, lookback, n_symbols, n_features].
    pub data: Vec<f64>,
    pub windows: usize,
    pub lookback: usize,
    pub n_symbols: usize,
    pub n_features: usize,
    /// Window-end timestamps, one per window.
    pub timestamps: Vec<String>,
    pub symbols: Vec<String>,
    pub feature_names: Vec<String>,
}

impl FeatureWindows {
    /// Element accessor: window w, lookback offset l, symbol s, feature f.
    pub fn at(&self, w: usize, l: usize, s: usize, f: usize) -> f64 {
        let idx = ((w * self.lookback + l) * self.n_symbols + s) * self.n_features + f;
        self.data[idx]
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(self).context("failed to encode windows")?;
        std::fs::write(path, bytes)
            .with_context(|| format!("failed to write windows {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read windows {}", path.display()))?;
        bincode::deserialize(&bytes).context("failed to decode windows")
    }
}

// =============================================================================
// Frame loading and alignment
// =============================================================================

/// One symbol's OHLCV series, oldest first.
#[derive(Debug, Clone)]
struct Frame {
    timestamps: Vec<String>,
    open: Vec<f64>,
    high: Vec<f64>,
    low: Vec<f64>,
    close: Vec<f64>,
    volume: Vec<f64>,
}

fn load_frame(path: &Path) -> Result<Frame> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut lines = content.lines();
    let header = lines.next().context("empty OHLCV file")?;
    let cols: Vec<&str> = header.split(',').map(|c| c.trim()).collect();
    let col = |name: &str| -> Result<usize> {
        cols.iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .with_context(|| format!("missing column '{name}' in {}", path.display()))
    };
    let (i_ts, i_o, i_h, i_l, i_c, i_v) = (
        col("timestamp")?,
        col("open")?,
        col("high")?,
        col("low")?,
        col("close")?,
        col("volume")?,
    );

    let mut frame = Frame {
        timestamps: Vec::new(),
        open: Vec::new(),
        high: Vec::new(),
        low: Vec::new(),
        close: Vec::new(),
        volume: Vec::new(),
    };
    for (lineno, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        let get = |i: usize| -> Result<f64> {
            fields
                .get(i)
                .and_then(|s| s.trim().parse().ok())
                .with_context(|| format!("bad numeric field at line {} in {}", lineno + 2, path.display()))
        };
        frame.timestamps.push(fields[i_ts].trim().to_string());
        frame.open.push(get(i_o)?);
        frame.high.push(get(i_h)?);
        frame.low.push(get(i_l)?);
        frame.close.push(get(i_c)?);
        frame.volume.push(get(i_v)?);
    }
    Ok(frame)
}

/// Align a frame onto the union timestamp axis. Gaps are carried forward
/// from the previous bar; gaps before the first bar take the first bar.
fn align(frame: &Frame, axis: &[String]) -> Frame {
    let index: HashMap<&str, usize> = frame
        .timestamps
        .iter()
        .enumerate()
        .map(|(i, t)| (t.as_str(), i))
        .collect();

    let mut out = Frame {
        timestamps: axis.to_vec(),
        open: Vec::with_capacity(axis.len()),
        high: Vec::with_capacity(axis.len()),
        low: Vec::with_capacity(axis.len()),
        close: Vec::with_capacity(axis.len()),
        volume: Vec::with_capacity(axis.len()),
    };
    let mut last = 0usize;
    for ts in axis {
        if let Some(&i) = index.get(ts.as_str()) {
            last = i;
        }
        out.open.push(frame.open[last]);
        out.high.push(frame.high[last]);
        out.low.push(frame.low[last]);
        out.close.push(frame.close[last]);
        out.volume.push(frame.volume[last]);
    }
    out
}

// =============================================================================
// Rolling statistics (all trailing; index i uses bars [i-w+1, i] only)
// =============================================================================

fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

fn rolling_sum(x: &[f64], w: usize) -> Vec<f64> {
    let mut out = vec![0.0; x.len()];
    let mut acc = 0.0;
    for i in 0..x.len() {
        acc += x[i];
        if i >= w {
            acc -= x[i - w];
        }
        if i + 1 >= w {
            out[i] = finite_or_zero(acc);
        }
    }
    out
}

fn rolling_mean(x: &[f64], w: usize) -> Vec<f64> {
    let mut out = rolling_sum(x, w);
    for v in &mut out {
        *v /= w as f64;
    }
    out
}

/// Sample standard deviation over a trailing window.
fn rolling_std(x: &[f64], w: usize) -> Vec<f64> {
    let mut out = vec![0.0; x.len()];
    if w < 2 {
        return out;
    }
    for i in (w - 1)..x.len() {
        let win = &x[i + 1 - w..=i];
        let mean = win.iter().sum::<f64>() / w as f64;
        let var = win.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (w as f64 - 1.0);
        out[i] = finite_or_zero(var.max(0.0).sqrt());
    }
    out
}

fn ema(x: &[f64], span: usize) -> Vec<f64> {
    let mut out = vec![0.0; x.len()];
    if x.is_empty() {
        return out;
    }
    let alpha = 2.0 / (span as f64 + 1.0);
    out[0] = x[0];
    for i in 1..x.len() {
        out[i] = alpha * x[i] + (1.0 - alpha) * out[i - 1];
    }
    out
}

// =============================================================================
// Feature computation
// =============================================================================

const BASE_FEATURES: [&str; 5] = ["open", "high", "low", "close", "volume"];
const MINIMAL_EXTRA: [&str; 10] = [
    "logret",
    "logret5",
    "logret20",
    "vol10",
    "vol20",
    "atr14",
    "bb_width",
    "keltner_width",
    "vol_z20",
    "amihud",
];

pub fn feature_names(set: FeatureSet) -> Vec<String> {
    let mut names: Vec<String> = BASE_FEATURES.iter().map(|s| s.to_string()).collect();
    if set == FeatureSet::MinimalCore {
        names.extend(MINIMAL_EXTRA.iter().map(|s| s.to_string()));
    }
    names
}

/// Compute the per-symbol feature matrix, column-major: features[f][t].
fn compute_features(frame: &Frame, set: FeatureSet) -> Vec<Vec<f64>> {
    let mut cols = vec![
        frame.open.clone(),
        frame.high.clone(),
        frame.low.clone(),
        frame.close.clone(),
        frame.volume.clone(),
    ];
    if set == FeatureSet::Ohlcv {
        return cols;
    }

    let t = frame.close.len();

    // Log price and returns.
    let logp: Vec<f64> = frame.close.iter().map(|c| c.max(1e-9).ln()).collect();
    let mut logret = vec![0.0; t];
    for i in 1..t {
        logret[i] = finite_or_zero(logp[i] - logp[i - 1]);
    }
    let logret5 = rolling_sum(&logret, 5);
    let logret20 = rolling_sum(&logret, 20);
    let vol10 = rolling_std(&logret, 10);
    let vol20 = rolling_std(&logret, 20);

    // ATR14 over the true range; the first bar has no previous close.
    let mut tr = vec![0.0; t];
    for i in 0..t {
        let hl = frame.high[i] - frame.low[i];
        tr[i] = if i == 0 {
            hl
        } else {
            let prev_close = frame.close[i - 1];
            hl.max((frame.high[i] - prev_close).abs())
                .max((frame.low[i] - prev_close).abs())
        };
    }
    let atr14 = rolling_mean(&tr, 14);

    // Bollinger width (20, 2): (upper - lower) / middle.
    let ma20 = rolling_mean(&frame.close, 20);
    let sd20 = rolling_std(&frame.close, 20);
    let bb_width: Vec<f64> = ma20
        .iter()
        .zip(&sd20)
        .map(|(m, s)| if *m != 0.0 { finite_or_zero(4.0 * s / m) } else { 0.0 })
        .collect();

    // Keltner width: (ema20 + 2*atr) - (ema20 - 2*atr) over ema20.
    let ema20 = ema(&frame.close, 20);
    let keltner_width: Vec<f64> = ema20
        .iter()
        .zip(&atr14)
        .map(|(e, a)| if *e != 0.0 { finite_or_zero(4.0 * a / e) } else { 0.0 })
        .collect();

    // 20-bar volume z-score.
    let v_mean = rolling_mean(&frame.volume, 20);
    let v_std = rolling_std(&frame.volume, 20);
    let vol_z20: Vec<f64> = (0..t)
        .map(|i| {
            if i + 1 >= 20 && v_std[i] != 0.0 {
                finite_or_zero((frame.volume[i] - v_mean[i]) / v_std[i])
            } else {
                0.0
            }
        })
        .collect();

    // Amihud illiquidity: |return| / dollar volume.
    let amihud: Vec<f64> = (0..t)
        .map(|i| {
            let dv = frame.close[i].abs() * frame.volume[i].abs();
            if dv != 0.0 {
                finite_or_zero(logret[i].abs() / dv)
            } else {
                0.0
            }
        })
        .collect();

    cols.push(logret);
    cols.push(logret5);
    cols.push(logret20);
    cols.push(vol10);
    cols.push(vol20);
    cols.push(atr14);
    cols.push(bb_width);
    cols.push(keltner_width);
    cols.push(vol_z20);
    cols.push(amihud);
    cols
}

// =============================================================================
// Window assembly
// =============================================================================

/// Build feature windows from cached per-symbol files.
pub fn build_windows(
    parquet_map: &BTreeMap<String, PathBuf>,
    lookback: usize,
    spec: &WindowSpec,
) -> Result<FeatureWindows> {
    if lookback == 0 {
        bail!("lookback must be at least 1");
    }
    if parquet_map.is_empty() {
        bail!("no symbols to build windows for");
    }

    let symbols: Vec<String> = parquet_map.keys().cloned().collect();
    let mut frames = Vec::with_capacity(symbols.len());
    for sym in &symbols {
        frames.push(load_frame(&parquet_map[sym])?);
    }

    // Union timestamp axis; lexical order matches chronological order for
    // the fixed timestamp format.
    let axis: Vec<String> = frames
        .iter()
        .flat_map(|f| f.timestamps.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let t_total = axis.len();

    let names = feature_names(spec.feature_set);
    let n = symbols.len();
    let f = names.len();

    // cube[t][s][f]
    let mut cube = vec![0.0; t_total * n * f];
    for (s, frame) in frames.iter().enumerate() {
        let aligned = align(frame, &axis);
        let cols = compute_features(&aligned, spec.feature_set);
        for (fi, col) in cols.iter().enumerate() {
            for (ti, v) in col.iter().enumerate() {
                cube[(ti * n + s) * f + fi] = *v;
            }
        }
    }

    // Valid window ends: t in [lookback-1, t_total - embargo_bars).
    let end_limit = t_total.saturating_sub(spec.embargo_bars);
    let window_count = end_limit.saturating_sub(lookback - 1);

    let mut data = Vec::with_capacity(window_count * lookback * n * f);
    let mut end_timestamps = Vec::with_capacity(window_count);
    for t_end in (lookback - 1)..end_limit {
        let start = t_end + 1 - lookback;
        let win_begin = data.len();
        for ti in start..=t_end {
            data.extend_from_slice(&cube[ti * n * f..(ti + 1) * n * f]);
        }
        if spec.normalize_obs {
            normalize_window(&mut data[win_begin..], lookback, n * f);
        }
        end_timestamps.push(axis[t_end].clone());
    }

    Ok(FeatureWindows {
        data,
        windows: window_count,
        lookback,
        n_symbols: n,
        n_features: f,
        timestamps: end_timestamps,
        symbols,
        feature_names: names,
    })
}

/// Z-score one window in place over the lookback axis only.
fn normalize_window(win: &mut [f64], lookback: usize, row_len: usize) {
    for col in 0..row_len {
        let mut mean = 0.0;
        for l in 0..lookback {
            mean += win[l * row_len + col];
        }
        mean /= lookback as f64;
        let mut var = 0.0;
        for l in 0..lookback {
            let d = win[l * row_len + col] - mean;
            var += d * d;
        }
        let std = (var / lookback as f64).sqrt() + 1e-8;
        for l in 0..lookback {
            let v = &mut win[l * row_len + col];
            *v = (*v - mean) / std;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Write a synthetic OHLCV CSV with `bars` rows starting 2020-01-01.
    fn write_csv(dir: &Path, name: &str, bars: usize, scale: f64) -> PathBuf {
        let path = dir.join(format!("{name}.csv"));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "timestamp,open,high,low,close,adj_close,volume").unwrap();
        let start = chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        for i in 0..bars {
            let ts = start + chrono::Duration::days(i as i64);
            let close = scale * (100.0 + (i as f64 * 0.7).sin() * 5.0 + i as f64 * 0.1);
            writeln!(
                f,
                "{} 00:00:00,{:.4},{:.4},{:.4},{:.4},{:.4},{}",
                ts.format("%Y-%m-%d"),
                close - 0.5,
                close + 1.0,
                close - 1.0,
                close,
                close,
                10_000 + i * 100
            )
            .unwrap();
        }
        path
    }

    fn spec(set: FeatureSet, embargo: usize, normalize: bool) -> WindowSpec {
        WindowSpec {
            feature_set: set,
            embargo_bars: embargo,
            normalize_obs: normalize,
        }
    }

    #[test]
    fn shapes_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = BTreeMap::new();
        map.insert("AAA".to_string(), write_csv(dir.path(), "AAA", 40, 1.0));
        map.insert("BBB".to_string(), write_csv(dir.path(), "BBB", 40, 2.0));

        let w = build_windows(&map, 8, &spec(FeatureSet::Ohlcv, 3, false)).unwrap();
        // Ends t in [7, 37): 30 windows.
        assert_eq!(w.windows, 30);
        assert_eq!(w.lookback, 8);
        assert_eq!(w.n_symbols, 2);
        assert_eq!(w.n_features, 5);
        assert_eq!(w.data.len(), 30 * 8 * 2 * 5);
        assert_eq!(w.timestamps.len(), 30);
        assert_eq!(w.symbols, vec!["AAA", "BBB"]);
    }

    #[test]
    fn minimal_core_adds_the_alias_features() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = BTreeMap::new();
        map.insert("AAA".to_string(), write_csv(dir.path(), "AAA", 60, 1.0));
        let w = build_windows(&map, 4, &spec(FeatureSet::MinimalCore, 0, false)).unwrap();
        assert_eq!(w.n_features, 15);
        assert_eq!(w.feature_names[5], "logret");
        assert_eq!(w.feature_names[14], "amihud");
        // Every value finite.
        assert!(w.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn embargo_excludes_trailing_bars() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = BTreeMap::new();
        map.insert("AAA".to_string(), write_csv(dir.path(), "AAA", 20, 1.0));
        let with = build_windows(&map, 5, &spec(FeatureSet::Ohlcv, 4, false)).unwrap();
        let without = build_windows(&map, 5, &spec(FeatureSet::Ohlcv, 0, false)).unwrap();
        assert_eq!(without.windows - with.windows, 4);
        // The embargoed run must not end on any of the last 4 timestamps.
        let last_allowed = with.timestamps.last().unwrap();
        assert!(last_allowed < &without.timestamps[without.windows - 4]);
    }

    #[test]
    fn no_leak_from_future_bars() {
        // Windows ending at t must be identical whether or not bars after t
        // exist in the source series.
        let dir = tempfile::tempdir().unwrap();
        let mut long_map = BTreeMap::new();
        long_map.insert("AAA".to_string(), write_csv(dir.path(), "long", 50, 1.0));
        let mut short_map = BTreeMap::new();
        short_map.insert("AAA".to_string(), write_csv(dir.path(), "short", 30, 1.0));

        let long = build_windows(&long_map, 6, &spec(FeatureSet::MinimalCore, 0, false)).unwrap();
        let short = build_windows(&short_map, 6, &spec(FeatureSet::MinimalCore, 0, false)).unwrap();

        assert_eq!(short.windows, 25);
        for w in 0..short.windows {
            for l in 0..6 {
                for f in 0..short.n_features {
                    assert_eq!(
                        short.at(w, l, 0, f),
                        long.at(w, l, 0, f),
                        "leak at window {w} offset {l} feature {f}"
                    );
                }
            }
        }
    }

    #[test]
    fn normalization_is_per_window_over_lookback_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = BTreeMap::new();
        map.insert("AAA".to_string(), write_csv(dir.path(), "AAA", 30, 1.0));
        let w = build_windows(&map, 10, &spec(FeatureSet::Ohlcv, 0, true)).unwrap();

        // Each (window, feature) column has ~zero mean over the lookback axis.
        for wi in 0..w.windows {
            for f in 0..w.n_features {
                let mean: f64 =
                    (0..w.lookback).map(|l| w.at(wi, l, 0, f)).sum::<f64>() / w.lookback as f64;
                assert!(mean.abs() < 1e-6, "window {wi} feature {f} mean {mean}");
            }
        }
    }

    #[test]
    fn union_alignment_carries_gaps_forward() {
        let dir = tempfile::tempdir().unwrap();
        // BBB is missing the last 5 bars that AAA has.
        let mut map = BTreeMap::new();
        map.insert("AAA".to_string(), write_csv(dir.path(), "AAA", 25, 1.0));
        map.insert("BBB".to_string(), write_csv(dir.path(), "BBB", 20, 3.0));

        let w = build_windows(&map, 4, &spec(FeatureSet::Ohlcv, 0, false)).unwrap();
        assert_eq!(w.windows, 22);
        // close of BBB in the final window equals its last real close.
        let close_idx = 3;
        let last_w = w.windows - 1;
        let bbb_close = w.at(last_w, w.lookback - 1, 1, close_idx);
        let bbb_prev = w.at(last_w, w.lookback - 2, 1, close_idx);
        assert_eq!(bbb_close, bbb_prev);
    }

    #[test]
    fn save_load_roundtrips_tensors_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = BTreeMap::new();
        map.insert("AAA".to_string(), write_csv(dir.path(), "AAA", 30, 1.0));
        let w = build_windows(&map, 5, &spec(FeatureSet::MinimalCore, 1, true)).unwrap();

        let path = dir.path().join("windows.bin");
        w.save(&path).unwrap();
        let loaded = FeatureWindows::load(&path).unwrap();
        assert_eq!(loaded, w);
    }
}
