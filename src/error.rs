// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Top-level error surfaced at the binary boundary. Per-batch and per-artifact
/// errors never reach here; they are absorbed by the component that owns them.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration invalid: {0}")]
    Config(String),

    #[error("no S3 credentials received before pipeline start")]
    MissingCredentials,

    #[error("control channel authentication failed: {0}")]
    AuthFailed(String),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Dictionary(#[from] DictionaryError),

    #[error(transparent)]
    Control(#[from] ControlChannelError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("S3 PUT failed for key {key}: {source}")]
    Put {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("S3 HEAD failed for key {key}: {source}")]
    Head {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to read spill file {path}: {source}")]
    ReadSpill {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum DictionaryError {
    #[error("zstd training failed: {0}")]
    Training(String),

    #[error("dictionary I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ControlChannelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("reconnect attempts exhausted ({0})")]
    ReconnectExhausted(u32),
}

/// Errors specific to restoring an archive during resume. Never fatal to the run;
/// the caller logs and continues with the next batch descriptor.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("path traversal refused for archive member {0:?}")]
    PathTraversal(String),

    #[error("archive error: {0}")]
    Archive(#[from] std::io::Error),

    #[error("object fetch failed: {0}")]
    Fetch(anyhow::Error),
}
