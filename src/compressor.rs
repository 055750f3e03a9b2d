// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Accumulates watched artifacts into adaptively sized batches, compresses
//! each with the shared dictionary, and spills the result to disk for the
//! Uploader.
//!
//! Ported from `examples/original_source/programs/pipeline.py`'s
//! `BatchCompressor`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{error, info};

use crate::artifact::extract_frame_number;
use crate::config::Config;
use crate::control::ControlChannelHandle;
use crate::dictionary::{compress_batch, DictionaryManager};
use crate::ledger::Ledger;

pub struct SpilledBatch {
    pub batch_id: u64,
    pub path: PathBuf,
    pub frames: Vec<u64>,
}

const MAX_TRAINING_SAMPLES: usize = 30;

pub struct Compressor {
    cache_dir: PathBuf,
    spill_dir: PathBuf,
    dict_file: PathBuf,
    zstd_level: i32,
    dict_size: usize,
    min_training_samples: usize,
    batch_interval: std::time::Duration,
    target_upload_time: std::time::Duration,
    min_batch_size: usize,
    max_batch_size: usize,

    ledger: Ledger,
    control: Option<ControlChannelHandle>,
    dict: Arc<Mutex<DictionaryManager>>,

    pending_files: Vec<PathBuf>,
    pending_frames: Vec<u64>,
    training_samples: Vec<PathBuf>,
    dict_trained: bool,
    batch_size: usize,
    shared_batch_size: Arc<AtomicUsize>,

    inbound: UnboundedReceiver<PathBuf>,
    outbound: UnboundedSender<SpilledBatch>,
}

impl Compressor {
    pub fn new(
        config: &Config,
        ledger: Ledger,
        control: Option<ControlChannelHandle>,
        dict: Arc<Mutex<DictionaryManager>>,
        inbound: UnboundedReceiver<PathBuf>,
        outbound: UnboundedSender<SpilledBatch>,
    ) -> Self {
        Self {
            cache_dir: config.cache_dir.clone(),
            spill_dir: config.spill_dir(),
            dict_file: config.dict_file.clone(),
            zstd_level: config.zstd_level,
            dict_size: config.zstd_dict_size,
            min_training_samples: config.zstd_min_training_samples,
            batch_interval: config.batch_interval,
            target_upload_time: config.target_upload_time,
            min_batch_size: config.min_batch_size,
            max_batch_size: config.max_batch_size,
            ledger,
            control,
            dict,
            pending_files: Vec::new(),
            pending_frames: Vec::new(),
            training_samples: Vec::new(),
            dict_trained: false,
            batch_size: config.default_batch_size,
            shared_batch_size: Arc::new(AtomicUsize::new(config.default_batch_size)),
            inbound,
            outbound,
        }
    }

    /// A live view of the current adaptive batch size, for the progress-flush
    /// task's `currentBatchSize` field. Call before `run()` consumes `self`.
    pub fn shared_batch_size(&self) -> Arc<AtomicUsize> {
        self.shared_batch_size.clone()
    }

    /// Drains the inbound queue roughly every `batch_interval`, flushing a
    /// batch once `pending_files` reaches `batch_size`. Flushes any remainder
    /// once the inbound channel closes (shutdown).
    pub async fn run(mut self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.spill_dir)?;
        loop {
            match tokio::time::timeout(self.batch_interval, self.inbound.recv()).await {
                Ok(Some(path)) => {
                    self.add_file(path);
                    while let Ok(path) = self.inbound.try_recv() {
                        self.add_file(path);
                    }
                }
                Ok(None) => break,
                Err(_elapsed) => {}
            }

            if self.pending_files.len() >= self.batch_size {
                self.compress_and_spill()?;
            }
        }

        if !self.pending_files.is_empty() {
            self.compress_and_spill()?;
        }
        info!("compressor flushed final batch and exited");
        Ok(())
    }

    /// Equivalent of the Python original's `flush()`, callable by the shutdown
    /// path independently of the run loop observing channel closure.
    pub fn flush_pending(&mut self) -> std::io::Result<()> {
        if !self.pending_files.is_empty() {
            self.compress_and_spill()?;
        }
        Ok(())
    }

    fn add_file(&mut self, path: PathBuf) {
        if let Some(frame) = extract_frame_number(&path) {
            self.pending_frames.push(frame);
        }
        if !self.dict_trained && self.training_samples.len() < MAX_TRAINING_SAMPLES {
            self.training_samples.push(path.clone());
        }
        self.pending_files.push(path);
    }

    fn maybe_train_dictionary(&mut self) {
        if self.dict_trained || self.training_samples.len() < self.min_training_samples {
            return;
        }
        let mut dict = self.dict.lock();
        match dict.train(&self.training_samples, self.dict_size, self.min_training_samples) {
            Ok(true) => {
                if let Err(e) = dict.save_to_file(&self.dict_file) {
                    error!(error = %e, "failed to persist trained dictionary");
                }
                self.dict_trained = true;
                self.ledger.mark_dictionary_trained();
            }
            Ok(false) => {}
            Err(e) => error!(error = %e, "dictionary training failed"),
        }
    }

    fn compress_and_spill(&mut self) -> std::io::Result<()> {
        if self.pending_files.is_empty() {
            return Ok(());
        }

        self.maybe_train_dictionary();

        let files = std::mem::take(&mut self.pending_files);
        let frames = std::mem::take(&mut self.pending_frames);

        let batch_id = self.ledger.create_batch(frames.clone());

        let dict_guard = self.dict.lock();
        let dict_ref: Option<&DictionaryManager> = if dict_guard.is_trained() { Some(&dict_guard) } else { None };
        let result = compress_batch(&files, &self.cache_dir, dict_ref, self.zstd_level);
        drop(dict_guard);

        let (compressed, raw_size) = match result {
            Ok(v) => v,
            Err(e) => {
                error!(batch_id, error = %e, "batch compression failed, marking batch failed");
                self.ledger.register_batch_failed(batch_id);
                return Ok(());
            }
        };

        self.ledger.register_compressed(batch_id, compressed.len() as u64, raw_size);

        let spill_path = self.spill_dir.join(format!("batch_{batch_id:04}.tar.zst"));
        std::fs::write(&spill_path, &compressed)?;

        if let Some(control) = &self.control {
            control.notify_compressed(frames.clone(), batch_id, compressed.len() as u64, raw_size);
        }

        let _ = self.outbound.send(SpilledBatch { batch_id, path: spill_path, frames });

        self.update_batch_size();
        Ok(())
    }

    /// `target_size = upload_speed_bps * TARGET_UPLOAD_TIME / bytes_per_frame_compressed`,
    /// clamped to `[MIN_BATCH_SIZE, MAX_BATCH_SIZE]`. No-op absent confirmed batches.
    fn update_batch_size(&mut self) {
        let speed = self.ledger.upload_speed_bps();
        let ratio = self.ledger.compression_ratio();
        if speed <= 0.0 || ratio <= 0.0 {
            return;
        }
        let confirmed = self.ledger.confirmed_batches();
        if confirmed.is_empty() {
            return;
        }
        let avg_raw: f64 = confirmed
            .iter()
            .map(|b| b.raw_size as f64 / (b.frames.len().max(1) as f64))
            .sum::<f64>()
            / confirmed.len() as f64;
        if avg_raw <= 0.0 {
            return;
        }
        let compressed_per_frame = avg_raw / ratio;
        let target = (speed * self.target_upload_time.as_secs_f64()) / compressed_per_frame;
        self.batch_size = (target as usize).clamp(self.min_batch_size, self.max_batch_size);
        self.shared_batch_size.store(self.batch_size, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

pub fn load_or_init_dictionary(level: i32, dict_file: &Path) -> DictionaryManager {
    let mut dict = DictionaryManager::new(level);
    match dict.load_from_file(dict_file) {
        Ok(true) => info!(path = %dict_file.display(), "loaded existing dictionary from disk"),
        Ok(false) => {}
        Err(e) => error!(error = %e, "failed to load existing dictionary"),
    }
    dict
}
