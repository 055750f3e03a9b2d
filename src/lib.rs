// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Streams a simulation engine's on-disk cache to S3-compatible object
//! storage as it is produced, so a coordinator can reschedule the VM
//! producing it with minimal lost work.
//!
//! The runnable entrypoint lives in `src/bin/worker.rs`; this crate exposes
//! the five core components (Watcher, Compressor, Uploader, DictionaryManager,
//! Ledger) plus the control-channel client and resume protocol as a library so
//! they can be tested and composed independently of the binary.

pub mod artifact;
pub mod blob;
pub mod compressor;
pub mod config;
pub mod control;
pub mod dictionary;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod pipeline;
pub mod resume;
pub mod uploader;
pub mod watcher;

pub use error::{PipelineError, PipelineResult};
