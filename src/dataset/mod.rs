// =============================================================================
// Dataset preparation — content-addressed inputs for worker processes
// =============================================================================
//
// A preparation request materializes cached per-symbol OHLCV slices, builds a
// manifest whose content hash fingerprints the exact slice, assembles
// no-leak feature windows, and persists everything under a hash-addressed
// dataset directory. Any I/O failure aborts the call and removes partial
// output.
// =============================================================================

pub mod cache;
pub mod manifest;
pub mod windows;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::paths::PathConfig;
use manifest::DatasetManifest;
use windows::{FeatureSet, FeatureWindows, WindowSpec};

use crate::requests::validate_date;

fn default_vendor() -> String {
    "synthetic".to_string()
}

fn default_interval() -> String {
    "1d".to_string()
}

fn default_true() -> bool {
    true
}

fn default_lookback() -> usize {
    64
}

/// Dataset preparation request (closed schema, like the job requests).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetRequest {
    pub symbols: Vec<String>,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_true")]
    pub adjusted: bool,
    pub start: String,
    pub end: String,
    #[serde(default = "default_vendor")]
    pub vendor: String,
    #[serde(default)]
    pub feature_set: FeatureSet,
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    #[serde(default)]
    pub embargo_bars: usize,
    #[serde(default)]
    pub normalize_obs: bool,
}

impl DatasetRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.symbols.iter().all(|s| s.trim().is_empty()) {
            return Err("symbols must contain at least one non-empty entry".to_string());
        }
        validate_date("start", &self.start)?;
        validate_date("end", &self.end)?;
        if self.lookback == 0 {
            return Err("lookback must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Result of a successful preparation, returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedDataset {
    pub manifest: DatasetManifest,
    pub dataset_dir: String,
    pub windows: usize,
    pub obs_shape: [usize; 3],
}

/// Run the full preparation pipeline for one request.
pub fn prepare(paths: &PathConfig, req: &DatasetRequest) -> Result<PreparedDataset> {
    let symbols: Vec<String> = req
        .symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    let parquet_map = cache::ensure_cached(
        &paths.data_cache_dir,
        &symbols,
        &req.interval,
        req.adjusted,
        &req.start,
        &req.end,
    )?;

    let manifest = manifest::build_manifest(
        &symbols,
        &req.interval,
        req.adjusted,
        &req.start,
        &req.end,
        &req.vendor,
        &parquet_map,
    )?;

    let spec = WindowSpec {
        feature_set: req.feature_set,
        embargo_bars: req.embargo_bars,
        normalize_obs: req.normalize_obs,
    };
    let windows = windows::build_windows(&parquet_map, req.lookback, &spec)?;

    let dataset_dir = paths
        .project_root
        .join("datasets")
        .join(&manifest.content_hash[..12]);

    if let Err(e) = persist(&dataset_dir, &manifest, &windows) {
        // Partial files are cleaned on failure.
        let _ = std::fs::remove_dir_all(&dataset_dir);
        return Err(e);
    }

    info!(
        content_hash = %manifest.content_hash,
        windows = windows.windows,
        dir = %dataset_dir.display(),
        "dataset prepared"
    );

    Ok(PreparedDataset {
        dataset_dir: dataset_dir.to_string_lossy().into_owned(),
        windows: windows.windows,
        obs_shape: [windows.lookback, windows.n_symbols, windows.n_features],
        manifest,
    })
}

fn persist(dataset_dir: &Path, manifest: &DatasetManifest, windows: &FeatureWindows) -> Result<()> {
    std::fs::create_dir_all(dataset_dir)
        .with_context(|| format!("failed to create {}", dataset_dir.display()))?;

    manifest.save(&dataset_dir.join("manifest.json"))?;
    windows.save(&dataset_dir.join("windows.bin"))?;

    let meta = serde_json::json!({
        "timestamps": windows.timestamps,
        "symbols": windows.symbols,
        "feature_names": windows.feature_names,
    });
    std::fs::write(
        dataset_dir.join("windows.meta.json"),
        serde_json::to_string_pretty(&meta)?,
    )
    .context("failed to write windows metadata")?;

    let schema = serde_json::json!({
        "dtype": "f64",
        "obs_shape": [windows.lookback, windows.n_symbols, windows.n_features],
        "windows": windows.windows,
    });
    std::fs::write(
        dataset_dir.join("obs_schema.json"),
        serde_json::to_string_pretty(&schema)?,
    )
    .context("failed to write observation schema")?;

    Ok(())
}

/// Re-open a persisted dataset and verify its content hash still matches the
/// on-disk cache files. A mismatch means the cached inputs drifted since the
/// dataset was prepared.
pub fn verify_manifest(dataset_dir: &Path) -> Result<DatasetManifest> {
    let stored = DatasetManifest::load(&dataset_dir.join("manifest.json"))?;
    let recomputed = manifest::build_manifest(
        &stored.symbols,
        &stored.interval,
        stored.adjusted,
        &stored.start,
        &stored.end,
        &stored.vendor,
        &stored
            .parquet_map
            .iter()
            .map(|(k, v)| (k.clone(), PathBuf::from(v)))
            .collect(),
    )?;
    if recomputed.content_hash != stored.content_hash {
        warn!(
            stored = %stored.content_hash,
            recomputed = %recomputed.content_hash,
            "dataset manifest drift detected"
        );
        bail!(
            "dataset drift: stored hash {} != recomputed {}",
            stored.content_hash,
            recomputed.content_hash
        );
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(symbols: &[&str]) -> DatasetRequest {
        DatasetRequest {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            interval: "1d".to_string(),
            adjusted: true,
            start: "2020-01-01".to_string(),
            end: "2020-06-30".to_string(),
            vendor: "synthetic".to_string(),
            feature_set: FeatureSet::Ohlcv,
            lookback: 8,
            embargo_bars: 2,
            normalize_obs: false,
        }
    }

    #[test]
    fn prepare_persists_all_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = PathConfig::new(tmp.path().to_path_buf(), None).unwrap();
        let prepared = prepare(&paths, &request(&["AAA", "BBB"])).unwrap();

        let dir = Path::new(&prepared.dataset_dir);
        assert!(dir.join("manifest.json").is_file());
        assert!(dir.join("windows.bin").is_file());
        assert!(dir.join("windows.meta.json").is_file());
        assert!(dir.join("obs_schema.json").is_file());
        assert_eq!(prepared.obs_shape, [8, 2, 5]);
        assert!(prepared.windows > 0);
    }

    #[test]
    fn prepare_is_reproducible() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = PathConfig::new(tmp.path().to_path_buf(), None).unwrap();
        let a = prepare(&paths, &request(&["AAA"])).unwrap();
        let b = prepare(&paths, &request(&["AAA"])).unwrap();
        assert_eq!(a.manifest.content_hash, b.manifest.content_hash);
        assert_eq!(a.dataset_dir, b.dataset_dir);
    }

    #[test]
    fn verify_detects_cache_drift() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = PathConfig::new(tmp.path().to_path_buf(), None).unwrap();
        let prepared = prepare(&paths, &request(&["AAA"])).unwrap();
        let dir = PathBuf::from(&prepared.dataset_dir);

        assert!(verify_manifest(&dir).is_ok());

        // Grow one cached file; the recomputed hash must change.
        let cached = prepared.manifest.parquet_map.values().next().unwrap();
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(cached).unwrap();
        writeln!(f, "tampered").unwrap();
        drop(f);

        let err = verify_manifest(&dir).unwrap_err();
        assert!(err.to_string().contains("drift"));
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let mut req = request(&[""]);
        assert!(req.validate().is_err());
        req = request(&["AAA"]);
        req.start = "01-01-2020".to_string();
        assert!(req.validate().is_err());
        req = request(&["AAA"]);
        req.lookback = 0;
        assert!(req.validate().is_err());
    }
}
