// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

/// Extensions the Watcher treats as cache content. Anything else is ignored.
pub const CACHE_EXTENSIONS: &[&str] = &[
    ".bphys", ".vdb", ".uni", ".gz", ".png", ".exr", ".abc", ".obj", ".ply",
];

/// Ordered frame-number patterns, tried in order; first match wins. Grounded on
/// `examples/original_source/programs/pipeline.py`'s `FRAME_PATTERNS`.
static FRAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"_(\d{4,6})_\d+\.bphys$").unwrap(),
        Regex::new(r"_(\d{4,6})\.bphys$").unwrap(),
        Regex::new(r"_(\d{4,6})\.vdb$").unwrap(),
        Regex::new(r"data_(\d{4,6})\.vdb$").unwrap(),
        Regex::new(r"_(\d+)\.\w+$").unwrap(),
    ]
});

/// A single file produced by the simulation engine in the cache directory.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub frame: Option<u64>,
}

impl Artifact {
    pub fn from_path(path: PathBuf, size: u64, modified: Option<SystemTime>) -> Self {
        let frame = extract_frame_number(&path);
        Self {
            path,
            size,
            modified,
            frame,
        }
    }
}

/// Returns whether `path`'s extension is recognized cache content, matching
/// `CACHE_EXTENSIONS` case-insensitively (the file suffix, including the dot).
pub fn is_recognized_extension(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let dotted = format!(".{}", ext.to_ascii_lowercase());
    CACHE_EXTENSIONS.contains(&dotted.as_str())
}

/// Extracts a frame number from a filename by trying each pattern in
/// `FRAME_PATTERNS` in order. Returns `None` if nothing matches (e.g. dictionary
/// or metadata files).
pub fn extract_frame_number(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    for pattern in FRAME_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(name) {
            if let Some(digits) = caps.get(1) {
                if let Ok(n) = digits.as_str().parse::<u64>() {
                    return Some(n);
                }
            }
        }
    }
    None
}

/// One entry in the simulation driver's cache manifest. The core reads the
/// manifest only to validate the run completed; it is never the source of
/// truth for what gets uploaded (that's the Watcher's job).
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub relative_path: String,
    pub size: u64,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheManifest {
    pub status: String,
    #[serde(default)]
    pub artifacts: Vec<ManifestEntry>,
}

const SUCCESSFUL_STATUSES: &[&str] = &["complete", "completed", "success", "ok"];

/// Reads and parses `manifest.json` if present in `cache_dir`. Diagnostic only:
/// a missing or unparsable manifest, or one reporting a non-success status, is
/// logged and never treated as a pipeline failure.
pub fn validate_cache_manifest(cache_dir: &Path) -> Option<CacheManifest> {
    let path = cache_dir.join("manifest.json");
    if !path.exists() {
        return None;
    }
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read cache manifest");
            return None;
        }
    };
    let manifest: CacheManifest = match serde_json::from_str(&text) {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not parse cache manifest");
            return None;
        }
    };
    if !SUCCESSFUL_STATUSES.contains(&manifest.status.to_ascii_lowercase().as_str()) {
        warn!(status = %manifest.status, "cache manifest reports a non-success status");
    }
    Some(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_configured_extensions() {
        for ext in CACHE_EXTENSIONS {
            let p = PathBuf::from(format!("foo_0001{ext}"));
            assert!(is_recognized_extension(&p), "{ext} should be recognized");
        }
        assert!(!is_recognized_extension(&Path::new("manifest.json")));
    }

    #[test]
    fn extracts_bphys_frame_with_trailing_index() {
        let p = Path::new("/cache/fluid_sim_001234_5.bphys");
        assert_eq!(extract_frame_number(p), Some(1234));
    }

    #[test]
    fn extracts_bphys_frame_plain() {
        let p = Path::new("/cache/fluid_sim_005678.bphys");
        assert_eq!(extract_frame_number(p), Some(5678));
    }

    #[test]
    fn extracts_vdb_frame() {
        let p = Path::new("/cache/smoke_000042.vdb");
        assert_eq!(extract_frame_number(p), Some(42));
    }

    #[test]
    fn extracts_vdb_data_prefixed_frame() {
        let p = Path::new("/cache/data_000099.vdb");
        assert_eq!(extract_frame_number(p), Some(99));
    }

    #[test]
    fn falls_back_to_generic_numeric_suffix() {
        let p = Path::new("/cache/render_7.png");
        assert_eq!(extract_frame_number(p), Some(7));
    }

    #[test]
    fn returns_none_when_no_pattern_matches() {
        let p = Path::new("/cache/zstd_dictionary.dict");
        assert_eq!(extract_frame_number(p), None);
    }

    #[test]
    fn foo_0001_bphys_matches_spec_example() {
        assert_eq!(
            extract_frame_number(Path::new("foo_0001.bphys")),
            Some(1)
        );
    }

    #[test]
    fn missing_manifest_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_cache_manifest(dir.path()).is_none());
    }

    #[test]
    fn parses_well_formed_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("manifest.json"),
            r#"{"status":"complete","artifacts":[{"relative_path":"foo_0001.bphys","size":100,"timestamp":1.0}]}"#,
        )
        .unwrap();
        let manifest = validate_cache_manifest(dir.path()).unwrap();
        assert_eq!(manifest.status, "complete");
        assert_eq!(manifest.artifacts.len(), 1);
    }

    #[test]
    fn tolerates_malformed_manifest_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.json"), "{not json").unwrap();
        assert!(validate_cache_manifest(dir.path()).is_none());
    }
}
