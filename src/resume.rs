// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reconstructs local state from a coordinator-supplied manifest so that no
//! secured frame is recomputed and no transferable work is lost across a VM
//! handoff.
//!
//! Ported from `examples/original_source/programs/resume.py`'s `ResumeManager`.

use std::collections::BTreeSet;
use std::path::Path;

use aws_sdk_s3::Client as S3Client;
use tracing::{error, info, warn};

use crate::control::CacheBatchDescriptor;
use crate::dictionary::{decompress_batch, DictionaryManager};

pub struct ResumeManager {
    client: S3Client,
    bucket: String,
}

impl ResumeManager {
    pub fn new(client: S3Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// GETs the dictionary object, persists it to `output_path`, and returns
    /// its bytes. `None` if the key is absent or the fetch fails — dictionary
    /// restore is best-effort, not required for correctness.
    pub async fn download_dictionary(&self, dict_key: &str, output_path: &Path) -> Option<Vec<u8>> {
        let resp = match self.client.get_object().bucket(&self.bucket).key(dict_key).send().await {
            Ok(r) => r,
            Err(e) => {
                info!(key = dict_key, error = %e, "no zstd dictionary available for resume");
                return None;
            }
        };
        let data = match resp.body.collect().await {
            Ok(agg) => agg.to_vec(),
            Err(e) => {
                error!(error = %e, "failed to read dictionary body");
                return None;
            }
        };
        if let Some(parent) = output_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(error = %e, "failed to create dictionary directory");
                return None;
            }
        }
        if let Err(e) = tokio::fs::write(output_path, &data).await {
            error!(error = %e, "failed to persist downloaded dictionary");
            return None;
        }
        info!(bytes = data.len(), "dictionary downloaded for resume");
        Some(data)
    }

    /// Downloads and decompresses each batch descriptor into `cache_dir`,
    /// accumulating restored frame numbers from the object's `frames`
    /// metadata. A single batch's failure is logged and skipped; it never
    /// aborts the rest of the resume.
    pub async fn download_batches(
        &self,
        batches: &[CacheBatchDescriptor],
        cache_dir: &Path,
        dict: Option<&DictionaryManager>,
    ) -> BTreeSet<u64> {
        let mut restored = BTreeSet::new();
        if let Err(e) = tokio::fs::create_dir_all(cache_dir).await {
            error!(error = %e, "failed to create cache dir for resume");
            return restored;
        }

        for descriptor in batches {
            match self.restore_one(descriptor, cache_dir, dict).await {
                Ok(frames) => restored.extend(frames),
                Err(e) => error!(key = %descriptor.key, error = %e, "failed to restore batch during resume"),
            }
        }

        info!(
            restored_frames = restored.len(),
            batches = batches.len(),
            "resume complete"
        );
        restored
    }

    async fn restore_one(
        &self,
        descriptor: &CacheBatchDescriptor,
        cache_dir: &Path,
        dict: Option<&DictionaryManager>,
    ) -> anyhow::Result<Vec<u64>> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&descriptor.key)
            .send()
            .await?;

        let metadata = resp.metadata().cloned();
        let body = resp.body.collect().await?.to_vec();
        info!(key = %descriptor.key, bytes = body.len(), "batch downloaded for resume");

        let extracted = decompress_batch(&body, cache_dir, dict)?;
        info!(count = extracted.len(), key = %descriptor.key, "batch extracted");

        let frames = metadata
            .and_then(|m| m.get("frames").cloned())
            .map(|csv| {
                csv.split(',')
                    .filter_map(|s| s.trim().parse::<u64>().ok())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if frames.is_empty() {
            warn!(key = %descriptor.key, "batch metadata carried no parseable frame list");
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_csv_parsing_tolerates_malformed_entries() {
        let csv = "1, 2,x,, 4";
        let frames: Vec<u64> = csv
            .split(',')
            .filter_map(|s| s.trim().parse::<u64>().ok())
            .collect();
        assert_eq!(frames, vec![1, 2, 4]);
    }
}
