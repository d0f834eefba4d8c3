// =============================================================================
// Path & Artifact Layout — allow-listed output roots and artifact mapping
// =============================================================================
//
// Every run materializes as a directory tree under one of a fixed set of
// output roots. Client-supplied paths are resolved absolutely and must fall
// inside the allow-list; everything else is rejected before any directory is
// created. The artifact set per run is closed — only the names below are
// ever served.
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Immutable path configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct PathConfig {
    /// Repository / deployment root. `PROJECT_ROOT` env var or cwd.
    pub project_root: PathBuf,
    /// Default parent for run output directories.
    pub runs_dir: PathBuf,
    /// Cache directory for per-symbol OHLCV slices.
    pub data_cache_dir: PathBuf,
    /// Roots under which client-supplied out_dirs are accepted.
    pub allowed_output_roots: Vec<PathBuf>,
}

impl PathConfig {
    /// Build from the environment: `PROJECT_ROOT` (default: cwd) and the
    /// optional extra allow-list entry `STOCKBOT_EXTRA_OUT_ROOT`.
    pub fn from_env() -> Result<Self> {
        let project_root = match std::env::var("PROJECT_ROOT") {
            Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
            _ => std::env::current_dir().context("failed to resolve current dir")?,
        };
        let extra = std::env::var("STOCKBOT_EXTRA_OUT_ROOT")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        Self::new(project_root, extra)
    }

    /// Build rooted at `project_root`, with an optional extra output root.
    pub fn new(project_root: PathBuf, extra_out_root: Option<PathBuf>) -> Result<Self> {
        let runs_dir = project_root.join("runs");
        std::fs::create_dir_all(&runs_dir)
            .with_context(|| format!("failed to create runs dir {}", runs_dir.display()))?;

        let data_cache_dir = project_root.join("data_cache");

        let mut allowed_output_roots = vec![runs_dir.clone()];
        if let Some(extra) = extra_out_root {
            allowed_output_roots.push(absolutize(&extra));
        }

        Ok(Self {
            project_root,
            runs_dir,
            data_cache_dir,
            allowed_output_roots,
        })
    }

    /// Resolve the output directory for a run and create it eagerly.
    ///
    /// A client-supplied `requested` path must resolve under one of the
    /// allowed roots; otherwise a sanitized `out_tag` (or "run") is placed
    /// under the default runs dir.
    pub fn resolve_out_dir(&self, requested: Option<&str>, out_tag: Option<&str>) -> Result<PathBuf> {
        let final_dir = if let Some(req) = requested.filter(|r| !r.trim().is_empty()) {
            let base = absolutize(Path::new(req));
            self.validate_out_base(&base)?;
            match out_tag {
                Some(tag) => base.join(sanitize_tag(tag)),
                None => base,
            }
        } else {
            let tag = sanitize_tag(out_tag.unwrap_or("run"));
            self.runs_dir.join(tag)
        };

        std::fs::create_dir_all(&final_dir)
            .with_context(|| format!("failed to create out dir {}", final_dir.display()))?;
        Ok(final_dir)
    }

    /// Reject any base path that escapes the allow-list.
    pub fn validate_out_base(&self, base: &Path) -> Result<()> {
        for root in &self.allowed_output_roots {
            if is_under(base, root) {
                return Ok(());
            }
        }
        let roots = self
            .allowed_output_roots
            .iter()
            .map(|r| r.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        bail!("out_dir not allowed: {}. Allowed roots: {}", base.display(), roots);
    }
}

/// Keep alphanumerics plus `._-`; everything else becomes `_`.
pub fn sanitize_tag(tag: &str) -> String {
    tag.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Whether `p` is lexically contained in `root` after normalization.
pub fn is_under(p: &Path, root: &Path) -> bool {
    let p = absolutize(p);
    let root = absolutize(root);
    p.starts_with(&root)
}

/// Resolve to an absolute path and collapse `.`/`..` components without
/// touching the filesystem (the target may not exist yet).
fn absolutize(p: &Path) -> PathBuf {
    let joined = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(p)
    };
    let mut out = PathBuf::new();
    for comp in joined.components() {
        match comp {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Map artifact names to their canonical paths under an out dir.
///
/// This is the closed set of externally visible artifacts; any other name
/// is unknown to the boundary.
pub fn artifact_map(out_dir: &Path) -> BTreeMap<&'static str, PathBuf> {
    let report = out_dir.join("report");
    let mut map = BTreeMap::new();
    map.insert("metrics", report.join("metrics.json"));
    map.insert("equity", report.join("equity.csv"));
    map.insert("orders", report.join("orders.csv"));
    map.insert("trades", report.join("trades.csv"));
    map.insert("summary", report.join("summary.json"));
    map.insert("config", out_dir.join("config.snapshot.yaml"));
    map.insert("model", out_dir.join("ppo_policy.zip"));
    map.insert("job_log", out_dir.join("job.log"));
    map
}

/// Per-run telemetry file paths inside an out dir.
pub fn telemetry_paths(out_dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
    (
        out_dir.join("live_telemetry.jsonl"),
        out_dir.join("live_events.jsonl"),
        out_dir.join("live_rollups.jsonl"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> (tempfile::TempDir, PathConfig) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PathConfig::new(dir.path().to_path_buf(), None).unwrap();
        (dir, cfg)
    }

    #[test]
    fn sanitize_keeps_safe_chars() {
        assert_eq!(sanitize_tag("exp-01_a.b"), "exp-01_a.b");
        assert_eq!(sanitize_tag("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_tag("a b/c"), "a_b_c");
    }

    #[test]
    fn default_out_dir_uses_tag_under_runs() {
        let (_tmp, cfg) = config();
        let out = cfg.resolve_out_dir(None, Some("exp1")).unwrap();
        assert_eq!(out, cfg.runs_dir.join("exp1"));
        assert!(out.is_dir());
    }

    #[test]
    fn requested_dir_inside_allowlist_is_accepted() {
        let (_tmp, cfg) = config();
        let req = cfg.runs_dir.join("custom");
        let out = cfg
            .resolve_out_dir(Some(req.to_str().unwrap()), Some("tag"))
            .unwrap();
        assert_eq!(out, req.join("tag"));
        assert!(out.is_dir());
    }

    #[test]
    fn requested_dir_outside_allowlist_is_rejected() {
        let (_tmp, cfg) = config();
        let err = cfg.resolve_out_dir(Some("/etc/helios"), None).unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn dotdot_escape_is_rejected() {
        let (_tmp, cfg) = config();
        let sneaky = cfg.runs_dir.join("..").join("..").join("outside");
        let err = cfg
            .resolve_out_dir(Some(sneaky.to_str().unwrap()), None)
            .unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn extra_root_extends_allowlist() {
        let tmp = tempfile::tempdir().unwrap();
        let extra = tempfile::tempdir().unwrap();
        let cfg =
            PathConfig::new(tmp.path().to_path_buf(), Some(extra.path().to_path_buf())).unwrap();
        let req = extra.path().join("out");
        assert!(cfg.resolve_out_dir(Some(req.to_str().unwrap()), None).is_ok());
    }

    #[test]
    fn artifact_map_is_the_closed_set() {
        let (_tmp, cfg) = config();
        let map = artifact_map(&cfg.runs_dir.join("x"));
        let names: Vec<&str> = map.keys().copied().collect();
        assert_eq!(
            names,
            vec!["config", "equity", "job_log", "metrics", "model", "orders", "summary", "trades"]
        );
        assert!(map["metrics"].ends_with("report/metrics.json"));
        assert!(map["model"].ends_with("ppo_policy.zip"));
    }
}
