// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! One-shot fetch of the simulation source blob named by a `BLEND_FILE_URL`
//! control-channel message.
//!
//! Ported from `examples/original_source/programs/vm_main.py`'s
//! `_download_url` / `handle_blend_file_url`.

use bytes::Bytes;

const DOWNLOAD_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum BlobFetchError {
    #[error("fetching source blob: {0}")]
    Request(#[from] reqwest::Error),
}

pub async fn fetch_source_blob(url: &str) -> Result<Bytes, BlobFetchError> {
    let client = reqwest::Client::builder().timeout(DOWNLOAD_TIMEOUT).build()?;
    let resp = client.get(url).send().await?.error_for_status()?;
    resp.bytes().await.map_err(BlobFetchError::Request)
}

pub async fn save_source_blob(path: &std::path::Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await
}
