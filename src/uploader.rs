// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durably transfers spill files to the object store, confirms landing, and
//! reports secured status.
//!
//! Ported from `examples/original_source/programs/pipeline.py`'s
//! `BatchUploader`. The "Fix Storj 411" comment on the original's `_upload_batch`
//! is the load-bearing detail this module exists to preserve: every PUT carries
//! an exact `Content-Length` and never streams a multipart body.

use std::path::PathBuf;
use std::time::Instant;

use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use crate::compressor::SpilledBatch;
use crate::control::ControlChannelHandle;
use crate::error::UploadError;
use crate::ledger::Ledger;

#[derive(Debug, Clone)]
pub struct S3Credentials {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub cache_prefix: String,
}

/// Builds an `aws-sdk-s3` client with path-style addressing and 5 adaptive
/// retries, matching the Python original's `boto3` `BotoConfig`. No
/// application-level retry loop sits on top (§4.3/§9).
pub fn build_client(creds: &S3Credentials) -> S3Client {
    let aws_creds = Credentials::new(
        &creds.access_key_id,
        &creds.secret_access_key,
        None,
        None,
        "control-channel",
    );
    let retry_config = aws_config::retry::RetryConfig::adaptive().with_max_attempts(5);
    let config = aws_sdk_s3::Config::builder()
        .endpoint_url(&creds.endpoint)
        .region(Region::new(creds.region.clone()))
        .credentials_provider(aws_creds)
        .force_path_style(true)
        .retry_config(retry_config)
        .behavior_version(aws_config::BehaviorVersion::latest())
        .build();
    S3Client::from_conf(config)
}

pub struct Uploader {
    client: S3Client,
    bucket: String,
    cache_prefix: String,
    ledger: Ledger,
    control: Option<ControlChannelHandle>,
    inbound: UnboundedReceiver<SpilledBatch>,
}

impl Uploader {
    pub fn new(
        client: S3Client,
        bucket: String,
        cache_prefix: String,
        ledger: Ledger,
        control: Option<ControlChannelHandle>,
        inbound: UnboundedReceiver<SpilledBatch>,
    ) -> Self {
        Self {
            client,
            bucket,
            cache_prefix,
            ledger,
            control,
            inbound,
        }
    }

    pub async fn run(mut self) {
        while let Some(batch) = self.inbound.recv().await {
            self.upload_batch(batch).await;
        }
        info!("uploader exiting, inbound channel closed");
    }

    async fn upload_batch(&self, batch: SpilledBatch) {
        let key = format!("{}batch_{:04}.tar.zst", self.cache_prefix, batch.batch_id);
        let data = match tokio::fs::read(&batch.path).await {
            Ok(d) => d,
            Err(e) => {
                error!(batch_id = batch.batch_id, error = %e, "could not read spill file");
                self.ledger.register_batch_failed(batch.batch_id);
                return;
            }
        };

        let frames_csv = batch.frames.iter().map(u64::to_string).collect::<Vec<_>>().join(",");
        let start = Instant::now();

        let put_result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data.clone()))
            .content_length(data.len() as i64)
            .content_type("application/octet-stream")
            .metadata("batch_id", batch.batch_id.to_string())
            .metadata("frames", frames_csv)
            .metadata("frame_count", batch.frames.len().to_string())
            .send()
            .await;

        if let Err(e) = put_result {
            let err = UploadError::Put { key: key.clone(), source: e.into() };
            error!(batch_id = batch.batch_id, error = %err, "batch upload failed");
            self.ledger.register_batch_failed(batch.batch_id);
            return;
        }

        let duration = start.elapsed();
        self.ledger.register_secured(batch.batch_id, key.clone(), duration);
        self.ledger.observe_upload_duration("batch", duration);

        let etag = match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(head) => head.e_tag().map(|s| s.trim_matches('"').to_string()),
            Err(e) => {
                warn!(batch_id = batch.batch_id, error = %UploadError::Head { key: key.clone(), source: e.into() }, "HEAD failed after successful PUT");
                None
            }
        };

        if let Some(control) = &self.control {
            control.notify_secured(
                batch.frames,
                batch.batch_id,
                key,
                self.ledger.upload_speed_bps(),
                Some(data.len() as u64),
                etag,
            );
        }

        if let Err(e) = tokio::fs::remove_file(&batch.path).await {
            warn!(path = %batch.path.display(), error = %e, "could not delete spill file after upload");
        }
    }

}

/// Uploads the trained dictionary under `<cache_prefix>dictionary.zstd`, once,
/// at pipeline finalize. A free function rather than an `Uploader` method
/// because `Uploader::run` consumes `self` for the duration of the pipeline;
/// finalize calls this with a cloned `S3Client` (cheap: `Client` is an `Arc`
/// handle internally) instead.
pub async fn upload_dictionary(
    client: &S3Client,
    bucket: &str,
    cache_prefix: &str,
    dict_bytes: &[u8],
    ledger: &Ledger,
    control: Option<&ControlChannelHandle>,
) -> Result<(), UploadError> {
    let key = format!("{cache_prefix}dictionary.zstd");
    let start = Instant::now();
    client
        .put_object()
        .bucket(bucket)
        .key(&key)
        .body(ByteStream::from(dict_bytes.to_vec()))
        .content_length(dict_bytes.len() as i64)
        .content_type("application/octet-stream")
        .metadata("type", "zstd-dictionary")
        .send()
        .await
        .map_err(|e| UploadError::Put { key: key.clone(), source: e.into() })?;
    ledger.observe_upload_duration("dictionary", start.elapsed());

    if let Some(control) = control {
        control.notify_secured(vec![], 0, key, ledger.upload_speed_bps(), None, None);
    }
    Ok(())
}

pub fn spill_file_path(spill_dir: &std::path::Path, batch_id: u64) -> PathBuf {
    spill_dir.join(format!("batch_{batch_id:04}.tar.zst"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spill_file_path_uses_zero_padded_batch_id() {
        let dir = std::path::Path::new("/work/batches");
        assert_eq!(
            spill_file_path(dir, 7),
            PathBuf::from("/work/batches/batch_0007.tar.zst")
        );
    }
}
