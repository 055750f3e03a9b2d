// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! zstd dictionary lifecycle plus the tar+zstd batch archive format.
//!
//! Ported from `examples/original_source/programs/compression.py`'s
//! `ZstdDictManager`, `compress_batch` and `decompress_batch`.

use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{DictionaryError, RestoreError};

/// Owns the trained (or loaded) zstd dictionary and hands out configured
/// compressors/decompressors. `None` until `train`/`load_from_bytes` succeeds;
/// every batch compressed before that point uses plain zstd at `zstd_level`.
pub struct DictionaryManager {
    dict_bytes: Option<Vec<u8>>,
    level: i32,
}

impl DictionaryManager {
    pub fn new(level: i32) -> Self {
        Self {
            dict_bytes: None,
            level,
        }
    }

    pub fn is_trained(&self) -> bool {
        self.dict_bytes.is_some()
    }

    pub fn dict_bytes(&self) -> Option<&[u8]> {
        self.dict_bytes.as_deref()
    }

    /// Trains a dictionary from sample file contents. Mirrors the Python
    /// original: samples below `min_samples` (after filtering unreadable and
    /// empty files) is not an error, just a declined training attempt.
    pub fn train(
        &mut self,
        sample_paths: &[PathBuf],
        dict_size: usize,
        min_samples: usize,
    ) -> Result<bool, DictionaryError> {
        if sample_paths.len() < min_samples {
            warn!(
                have = sample_paths.len(),
                need = min_samples,
                "not enough samples to train dictionary"
            );
            return Ok(false);
        }

        let mut samples = Vec::with_capacity(sample_paths.len());
        for path in sample_paths {
            match std::fs::read(path) {
                Ok(data) if !data.is_empty() => samples.push(data),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "could not read sample"),
            }
        }

        if samples.len() < min_samples {
            return Ok(false);
        }

        let dict = zstd::dict::from_samples(&samples, dict_size)
            .map_err(|e| DictionaryError::Training(e.to_string()))?;
        info!(bytes = dict.len(), samples = samples.len(), "trained zstd dictionary");
        self.dict_bytes = Some(dict);
        Ok(true)
    }

    pub fn load_from_bytes(&mut self, data: Vec<u8>) {
        info!(bytes = data.len(), "loaded zstd dictionary");
        self.dict_bytes = Some(data);
    }

    pub fn load_from_file(&mut self, path: &Path) -> Result<bool, DictionaryError> {
        if !path.exists() {
            return Ok(false);
        }
        let data = std::fs::read(path)?;
        self.load_from_bytes(data);
        Ok(true)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<bool, DictionaryError> {
        let Some(data) = &self.dict_bytes else {
            return Ok(false);
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;
        info!(path = %path.display(), "saved zstd dictionary");
        Ok(true)
    }

    fn compressor(&self) -> std::io::Result<zstd::bulk::Compressor<'_>> {
        match &self.dict_bytes {
            Some(dict) => zstd::bulk::Compressor::with_dictionary(self.level, dict),
            None => zstd::bulk::Compressor::new(self.level),
        }
    }

    fn decompressor(&self) -> std::io::Result<zstd::bulk::Decompressor<'_>> {
        match &self.dict_bytes {
            Some(dict) => zstd::bulk::Decompressor::with_dictionary(dict),
            None => zstd::bulk::Decompressor::new(),
        }
    }
}

/// Builds an in-memory tar of `files` (relative to `cache_dir`) and compresses
/// it, using the dictionary if one is trained. Returns `(compressed, raw_size)`.
/// Files that vanished between scheduling and archiving are skipped, matching
/// the Python original's tolerance for racing deletes.
pub fn compress_batch(
    files: &[PathBuf],
    cache_dir: &Path,
    dict: Option<&DictionaryManager>,
    fallback_level: i32,
) -> std::io::Result<(Vec<u8>, u64)> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut raw_size = 0u64;

    for f in files {
        if !f.exists() {
            continue;
        }
        let arcname = match f.strip_prefix(cache_dir) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => {
                warn!(path = %f.display(), "file outside cache_dir, skipping from batch");
                continue;
            }
        };
        match builder.append_path_with_name(f, &arcname) {
            Ok(()) => {
                if let Ok(meta) = f.metadata() {
                    raw_size += meta.len();
                }
            }
            Err(e) => warn!(path = %f.display(), error = %e, "could not add file to tar"),
        }
    }

    let tar_bytes = builder.into_inner()?;

    let compressed = match dict {
        Some(d) if d.is_trained() => d
            .compressor()?
            .compress(&tar_bytes)
            .map_err(std::io::Error::other)?,
        _ => zstd::bulk::Compressor::new(fallback_level)?
            .compress(&tar_bytes)
            .map_err(std::io::Error::other)?,
    };

    let ratio = if compressed.is_empty() {
        1.0
    } else {
        raw_size as f64 / compressed.len() as f64
    };
    debug!(raw_size, compressed = compressed.len(), ratio, "batch compressed");

    Ok((compressed, raw_size))
}

/// Decompresses and extracts a `tar.zst` archive into `output_dir`, refusing
/// any member whose name escapes `output_dir` (absolute paths or `..`
/// components). Used by resume to restore previously secured batches.
pub fn decompress_batch(
    data: &[u8],
    output_dir: &Path,
    dict: Option<&DictionaryManager>,
) -> Result<Vec<PathBuf>, RestoreError> {
    let tar_bytes = match dict {
        Some(d) if d.is_trained() => d
            .decompressor()
            .map_err(RestoreError::Archive)?
            .decompress(data, 512 * 1024 * 1024)
            .map_err(RestoreError::Archive)?,
        _ => {
            let mut out = Vec::new();
            zstd::stream::read::Decoder::new(data)
                .map_err(RestoreError::Archive)?
                .read_to_end(&mut out)
                .map_err(RestoreError::Archive)?;
            out
        }
    };

    let mut archive = tar::Archive::new(tar_bytes.as_slice());
    let mut extracted = Vec::new();

    for entry in archive.entries().map_err(RestoreError::Archive)? {
        let mut entry = entry.map_err(RestoreError::Archive)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path().map_err(RestoreError::Archive)?.into_owned();
        if name.is_absolute() || name.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            let err = RestoreError::PathTraversal(name.display().to_string());
            warn!(error = %err, "refusing archive member, skipping the rest of this member only");
            continue;
        }
        let dest = output_dir.join(&name);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(RestoreError::Archive)?;
        }
        entry.unpack(&dest).map_err(RestoreError::Archive)?;
        extracted.push(dest);
    }

    info!(count = extracted.len(), dir = %output_dir.display(), "batch decompressed");
    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn untrained_manager_reports_not_trained() {
        let mgr = DictionaryManager::new(3);
        assert!(!mgr.is_trained());
    }

    #[test]
    fn declines_training_below_minimum_samples() {
        let dir = tempdir().unwrap();
        let mut mgr = DictionaryManager::new(3);
        let mut paths = Vec::new();
        for i in 0..3 {
            let p = dir.path().join(format!("s{i}.bin"));
            std::fs::write(&p, b"sample data").unwrap();
            paths.push(p);
        }
        let trained = mgr.train(&paths, 1024, 10).unwrap();
        assert!(!trained);
        assert!(!mgr.is_trained());
    }

    #[test]
    fn trains_when_enough_samples_present() {
        let dir = tempdir().unwrap();
        let mut mgr = DictionaryManager::new(3);
        let mut paths = Vec::new();
        for i in 0..12 {
            let p = dir.path().join(format!("s{i}.bin"));
            std::fs::write(&p, format!("repeated pattern sample {i}").repeat(20)).unwrap();
            paths.push(p);
        }
        let trained = mgr.train(&paths, 8192, 10).unwrap();
        assert!(trained);
        assert!(mgr.is_trained());
    }

    #[test]
    fn save_and_reload_round_trips_dictionary_bytes() {
        let dir = tempdir().unwrap();
        let mut mgr = DictionaryManager::new(3);
        mgr.load_from_bytes(vec![1, 2, 3, 4, 5]);
        let path = dir.path().join("dict.bin");
        assert!(mgr.save_to_file(&path).unwrap());

        let mut mgr2 = DictionaryManager::new(3);
        assert!(mgr2.load_from_file(&path).unwrap());
        assert_eq!(mgr2.dict_bytes(), Some(&[1u8, 2, 3, 4, 5][..]));
    }

    #[test]
    fn compress_then_decompress_round_trip_without_dictionary() {
        let cache = tempdir().unwrap();
        let out = tempdir().unwrap();
        let f1 = cache.path().join("foo_0001.bphys");
        std::fs::write(&f1, b"frame one contents").unwrap();

        let (compressed, raw_size) =
            compress_batch(&[f1.clone()], cache.path(), None, 3).unwrap();
        assert!(raw_size > 0);

        let extracted = decompress_batch(&compressed, out.path(), None).unwrap();
        assert_eq!(extracted.len(), 1);
        assert_eq!(std::fs::read(&extracted[0]).unwrap(), b"frame one contents");
    }

    #[test]
    fn path_traversal_member_is_skipped_but_siblings_still_extract() {
        // A tar with one legitimate member and one `..`-escaping member: only
        // the bad member is refused, the good one is still extracted.
        let mut builder = tar::Builder::new(Vec::new());

        let good = b"frame contents";
        let mut good_header = tar::Header::new_gnu();
        good_header.set_size(good.len() as u64);
        good_header.set_cksum();
        builder.append_data(&mut good_header, "foo_0001.bphys", &good[..]).unwrap();

        let evil = b"evil";
        let mut evil_header = tar::Header::new_gnu();
        evil_header.set_size(evil.len() as u64);
        evil_header.set_cksum();
        builder.append_data(&mut evil_header, "../escape.txt", &evil[..]).unwrap();

        let tar_bytes = builder.into_inner().unwrap();
        let compressed = zstd::bulk::Compressor::new(3).unwrap().compress(&tar_bytes).unwrap();

        let out = tempdir().unwrap();
        let extracted = decompress_batch(&compressed, out.path(), None).unwrap();
        assert_eq!(extracted.len(), 1);
        assert_eq!(std::fs::read(&extracted[0]).unwrap(), b"frame contents");
        assert!(!out.path().join("escape.txt").exists());
        assert!(!out.parent().unwrap().join("escape.txt").exists());
    }
}
