// =============================================================================
// Dataset Manifest — content-addressed description of an input slice
// =============================================================================
//
// The content hash fingerprints the exact data slice used: the query fields
// plus each cached file's path, byte size and modification time. Two
// identical queries over unchanged cached files produce identical hashes;
// touching any file changes the hash. The hash deliberately covers file
// metadata rather than file bytes, matching how the slices are cached
// (immutable once written).
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content-addressed manifest for one dataset slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub symbols: Vec<String>,
    pub interval: String,
    pub adjusted: bool,
    pub start: String,
    pub end: String,
    pub vendor: String,
    /// symbol -> cached file path.
    pub parquet_map: BTreeMap<String, String>,
    pub content_hash: String,
}

/// Hash payload: the manifest query fields plus per-file stat tuples.
/// Field order is fixed by this struct, so the canonical JSON is stable.
#[derive(Serialize)]
struct HashPayload<'a> {
    symbols: &'a [String],
    interval: &'a str,
    adjusted: bool,
    start: &'a str,
    end: &'a str,
    vendor: &'a str,
    parquet_map: &'a BTreeMap<String, String>,
    files: Vec<String>,
}

/// Build a manifest with a deterministic `content_hash` over the query and
/// the on-disk files.
pub fn build_manifest(
    symbols: &[String],
    interval: &str,
    adjusted: bool,
    start: &str,
    end: &str,
    vendor: &str,
    parquet_map: &BTreeMap<String, PathBuf>,
) -> Result<DatasetManifest> {
    let path_map: BTreeMap<String, String> = parquet_map
        .iter()
        .map(|(k, v)| (k.clone(), v.to_string_lossy().into_owned()))
        .collect();

    let mut files = Vec::with_capacity(symbols.len());
    for sym in symbols {
        let path = parquet_map
            .get(sym)
            .with_context(|| format!("no cached file for symbol {sym}"))?;
        let meta = std::fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let mtime_secs = meta
            .modified()
            .ok()
            .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        files.push(format!("{}:{}:{}", path.display(), meta.len(), mtime_secs));
    }

    let payload = HashPayload {
        symbols,
        interval,
        adjusted,
        start,
        end,
        vendor,
        parquet_map: &path_map,
        files,
    };
    let canonical = serde_json::to_string(&payload).context("failed to serialise hash payload")?;
    let content_hash = hex::encode(Sha256::digest(canonical.as_bytes()));

    Ok(DatasetManifest {
        symbols: symbols.to_vec(),
        interval: interval.to_string(),
        adjusted,
        start: start.to_string(),
        end: end.to_string(),
        vendor: vendor.to_string(),
        parquet_map: path_map,
        content_hash,
    })
}

impl DatasetManifest {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialise manifest")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write manifest {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse manifest {}", path.display()))
    }
}
