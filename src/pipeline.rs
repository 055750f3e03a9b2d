// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wires the Watcher, Compressor, Uploader and progress-flush task together,
//! and implements the bounded-timeout, idempotent shutdown sequence from
//! spec §5.
//!
//! Ported from `examples/original_source/programs/pipeline.py`'s `Pipeline`
//! and `vm_main.py`'s `shutdown`, adapted to tokio tasks instead of threads.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aws_sdk_s3::Client as S3Client;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::compressor::{load_or_init_dictionary, Compressor, SpilledBatch};
use crate::config::Config;
use crate::control::ControlChannelHandle;
use crate::dictionary::DictionaryManager;
use crate::ledger::Ledger;
use crate::uploader::{self, Uploader};
use crate::watcher::Watcher;

const FINALIZE_DRAIN_TIMEOUT: Duration = Duration::from_secs(120);
const WATCHER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const COMPRESSOR_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOADER_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Spawns each task with a `tracing` span carrying its name, mirroring the
/// teacher's `spawn_logged_monitored_task!` without depending on the
/// internal `mysten-metrics` crate that macro normally pulls in.
fn spawn_named<F>(name: &'static str, fut: F) -> JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(async move {
        let span = tracing::info_span!("worker", name);
        let _enter = span.enter();
        fut.await
    })
}

pub struct Pipeline {
    ledger: Ledger,
    dict: Arc<Mutex<DictionaryManager>>,
    control: Option<ControlChannelHandle>,
    s3_client: S3Client,
    bucket: String,
    cache_prefix: String,

    watcher_task: JoinHandle<std::io::Result<()>>,
    compressor_task: JoinHandle<std::io::Result<()>>,
    uploader_task: JoinHandle<()>,
    progress_task: JoinHandle<()>,
}

impl Pipeline {
    /// Builds and starts all four tasks. `already_secured` and `total_frames`
    /// come from resume (empty/§6 default when there is none).
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        config: &Config,
        total_frames: u64,
        already_secured: HashSet<u64>,
        dict_bytes: Option<Vec<u8>>,
        s3_client: S3Client,
        bucket: String,
        cache_prefix: String,
        control: Option<ControlChannelHandle>,
        metrics: Arc<crate::metrics::Metrics>,
    ) -> Self {
        let secured_set = already_secured.iter().copied().collect();
        let ledger = Ledger::new(total_frames, secured_set, metrics);

        let mut dict_manager = load_or_init_dictionary(config.zstd_level, &config.dict_file);
        if let Some(bytes) = dict_bytes {
            dict_manager.load_from_bytes(bytes);
        }
        if dict_manager.is_trained() {
            ledger.mark_dictionary_trained();
        }
        let dict = Arc::new(Mutex::new(dict_manager));

        let (frame_tx, frame_rx) = tokio::sync::mpsc::unbounded_channel::<PathBuf>();
        let (batch_tx, batch_rx) = tokio::sync::mpsc::unbounded_channel::<SpilledBatch>();

        let watcher = Watcher::new(
            config.cache_dir.clone(),
            ledger.clone(),
            control.clone(),
            already_secured,
            frame_tx,
        );
        let compressor = Compressor::new(config, ledger.clone(), control.clone(), dict.clone(), frame_rx, batch_tx);
        let current_batch_size = compressor.shared_batch_size();
        let uploader = Uploader::new(
            s3_client.clone(),
            bucket.clone(),
            cache_prefix.clone(),
            ledger.clone(),
            control.clone(),
            batch_rx,
        );

        let watcher_task = spawn_named("watcher", watcher.run());
        let compressor_task = spawn_named("compressor", compressor.run());
        let uploader_task = spawn_named("uploader", async move {
            uploader.run().await;
        });

        let progress_ledger = ledger.clone();
        let progress_control = control.clone();
        let progress_interval = config.progress_report_interval;
        let progress_task = spawn_named("progress", async move {
            let mut ticker = tokio::time::interval(progress_interval);
            loop {
                ticker.tick().await;
                if let Some(control) = &progress_control {
                    let snapshot = progress_ledger.status_snapshot();
                    let batch_size = current_batch_size.load(std::sync::atomic::Ordering::Relaxed);
                    control.notify_progress(snapshot, batch_size);
                }
            }
        });

        Pipeline {
            ledger,
            dict,
            control,
            s3_client,
            bucket,
            cache_prefix,
            watcher_task,
            compressor_task,
            uploader_task,
            progress_task,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Stops accepting new work, waits for the batch queue to drain (up to
    /// 120s), uploads the dictionary if trained, then joins every task with
    /// its own bounded timeout. Idempotent: safe to call once; subsequent
    /// polling of already-finished handles is a no-op.
    pub async fn finalize(self) {
        info!("finalizing pipeline");

        self.watcher_task.abort();
        let _ = tokio::time::timeout(WATCHER_JOIN_TIMEOUT, self.watcher_task).await;

        match tokio::time::timeout(FINALIZE_DRAIN_TIMEOUT, self.compressor_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "compressor exited with an error"),
            Ok(Err(e)) => warn!(error = %e, "compressor task panicked"),
            Err(_) => warn!("timed out waiting for compressor to flush within 120s"),
        }

        let dict_bytes = {
            let guard = self.dict.lock();
            if guard.is_trained() {
                guard.dict_bytes().map(|b| b.to_vec())
            } else {
                None
            }
        };
        if let Some(bytes) = dict_bytes {
            if let Err(e) = uploader::upload_dictionary(
                &self.s3_client,
                &self.bucket,
                &self.cache_prefix,
                &bytes,
                &self.ledger,
                self.control.as_ref(),
            )
            .await
            {
                warn!(error = %e, "failed to upload trained dictionary");
            }
        }

        match tokio::time::timeout(UPLOADER_JOIN_TIMEOUT, self.uploader_task).await {
            Ok(_) => {}
            Err(_) => warn!("timed out waiting for uploader to drain within 30s"),
        }

        self.progress_task.abort();

        if let Some(control) = &self.control {
            control.send_ready_to_terminate();
        }

        info!(
            secured_percent = self.ledger.secured_percent(),
            "pipeline finalized"
        );
    }
}

/// Computes the process exit code from final ledger state, per §7: 0 = all
/// secured, 1 = interrupted/failed-dominant, 2 = partial success with
/// `--strict` off. With `--strict` on, any shortfall is promoted to 1.
pub fn exit_code(secured_percent: f64, strict: bool) -> i32 {
    if secured_percent >= 100.0 {
        0
    } else if strict {
        1
    } else if secured_percent <= 0.0 {
        1
    } else {
        2
    }
}

/// Tracks consecutive shutdown signals for the triple-signal escalation in
/// §5/S5: the first two signals start/confirm graceful shutdown; the third
/// forces immediate process exit.
#[derive(Clone)]
pub struct ShutdownCounter {
    count: Arc<std::sync::atomic::AtomicU32>,
}

impl Default for ShutdownCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCounter {
    pub fn new() -> Self {
        Self {
            count: Arc::new(std::sync::atomic::AtomicU32::new(0)),
        }
    }

    /// Returns `true` if this signal should force an immediate exit (the
    /// third and any subsequent signal).
    pub fn signal(&self) -> bool {
        let n = self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        if n >= 3 {
            warn!(count = n, "repeated shutdown signal, forcing immediate exit");
            true
        } else {
            info!(count = n, "shutdown signal received, finalizing gracefully");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_zero_when_fully_secured() {
        assert_eq!(exit_code(100.0, false), 0);
    }

    #[test]
    fn exit_code_one_when_nothing_secured() {
        assert_eq!(exit_code(0.0, false), 1);
    }

    #[test]
    fn exit_code_two_on_partial_success_without_strict() {
        assert_eq!(exit_code(55.0, false), 2);
    }

    #[test]
    fn exit_code_one_on_partial_success_with_strict() {
        assert_eq!(exit_code(55.0, true), 1);
    }

    #[test]
    fn shutdown_counter_escalates_on_third_signal() {
        let counter = ShutdownCounter::new();
        assert!(!counter.signal());
        assert!(!counter.signal());
        assert!(counter.signal());
        assert!(counter.signal());
    }
}
