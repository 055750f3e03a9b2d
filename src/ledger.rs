// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! `ProgressTracker` — single source of truth for frame progression and batch
//! lifecycle, plus the derived metrics and ETA estimators consumed by the
//! periodic `PROGRESS_UPDATE` control-channel message.
//!
//! Ported from `examples/original_source/programs/progress.py`'s `ProgressTracker`.
//! All mutating operations take the same lock (`state`), matching spec.md §5's
//! "a single mutex protecting the four state mutators is sufficient".

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Compressing,
    Uploading,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchInfo {
    pub batch_id: u64,
    pub frames: Vec<u64>,
    pub compressed_size: u64,
    pub raw_size: u64,
    pub r2_key: String,
    pub upload_duration: Duration,
    pub status: BatchStatus,
}

impl BatchInfo {
    fn new(batch_id: u64, frames: Vec<u64>) -> Self {
        Self {
            batch_id,
            frames,
            compressed_size: 0,
            raw_size: 0,
            r2_key: String::new(),
            upload_duration: Duration::ZERO,
            status: BatchStatus::Compressing,
        }
    }
}

struct LedgerState {
    total_frames: u64,
    baked_frames: BTreeSet<u64>,
    compressed_frames: BTreeSet<u64>,
    secured_frames: BTreeSet<u64>,

    batches: BTreeMap<u64, BatchInfo>,
    next_batch_id: u64,

    upload_speed_bps: f64,
    compression_ratio: f64,
    baking_speed_fps: f64,
    bake_window: Vec<Instant>,
}

/// Triple-set accounting of frame states, batch lifecycle, and derived
/// speed/ratio/ETA metrics. Cheaply cloneable (`Arc`-backed); share one instance
/// across the Watcher, Compressor, Uploader and the progress-flush task.
#[derive(Clone)]
pub struct Ledger {
    state: Arc<Mutex<LedgerState>>,
    metrics: Arc<Metrics>,
}

const BAKE_WINDOW: Duration = Duration::from_secs(5);

impl Ledger {
    pub fn new(total_frames: u64, already_secured: BTreeSet<u64>, metrics: Arc<Metrics>) -> Self {
        metrics.secured_frames_total.set(already_secured.len() as i64);
        Ledger {
            state: Arc::new(Mutex::new(LedgerState {
                total_frames,
                baked_frames: BTreeSet::new(),
                compressed_frames: BTreeSet::new(),
                secured_frames: already_secured,
                batches: BTreeMap::new(),
                next_batch_id: 1,
                upload_speed_bps: 0.0,
                compression_ratio: 4.0,
                baking_speed_fps: 0.0,
                bake_window: Vec::new(),
            })),
            metrics,
        }
    }

    pub fn register_baked_frame(&self, frame: u64) {
        let mut s = self.state.lock();
        s.baked_frames.insert(frame);
        let now = Instant::now();
        s.bake_window.push(now);
        let cutoff = now.checked_sub(BAKE_WINDOW).unwrap_or(now);
        s.bake_window.retain(|t| *t > cutoff);
        if s.bake_window.len() >= 2 {
            let elapsed = s
                .bake_window
                .last()
                .unwrap()
                .duration_since(*s.bake_window.first().unwrap())
                .as_secs_f64();
            if elapsed > 0.0 {
                s.baking_speed_fps = (s.bake_window.len() - 1) as f64 / elapsed;
            }
        }
        self.metrics.baked_frames_total.set(s.baked_frames.len() as i64);
    }

    /// Allocates a monotonically increasing `batch_id` and records the batch as
    /// `compressing`. `batch_id` values are never reused (invariant 4).
    pub fn create_batch(&self, frames: Vec<u64>) -> u64 {
        let mut s = self.state.lock();
        let id = s.next_batch_id;
        s.next_batch_id += 1;
        s.batches.insert(id, BatchInfo::new(id, frames));
        self.metrics
            .batches_created
            .with_label_values(&["compressing"])
            .inc();
        id
    }

    pub fn register_compressed(&self, batch_id: u64, compressed_size: u64, raw_size: u64) {
        let mut s = self.state.lock();
        let Some(batch) = s.batches.get_mut(&batch_id) else {
            return;
        };
        if batch.status != BatchStatus::Compressing {
            return;
        }
        batch.compressed_size = compressed_size;
        batch.raw_size = raw_size;
        batch.status = BatchStatus::Uploading;
        let frames = batch.frames.clone();
        if raw_size > 0 && compressed_size > 0 {
            s.compression_ratio = raw_size as f64 / compressed_size as f64;
        }
        s.compressed_frames.extend(frames);
        self.metrics
            .compressed_frames_total
            .set(s.compressed_frames.len() as i64);
    }

    pub fn register_secured(&self, batch_id: u64, r2_key: String, duration: Duration) {
        let mut s = self.state.lock();
        let Some(batch) = s.batches.get_mut(&batch_id) else {
            return;
        };
        if batch.status != BatchStatus::Uploading {
            return;
        }
        batch.r2_key = r2_key;
        batch.upload_duration = duration;
        batch.status = BatchStatus::Confirmed;
        let frames = batch.frames.clone();
        let compressed_size = batch.compressed_size;
        if duration.as_secs_f64() > 0.0 && compressed_size > 0 {
            s.upload_speed_bps = compressed_size as f64 / duration.as_secs_f64();
        }
        s.secured_frames.extend(frames);
        self.metrics
            .secured_frames_total
            .set(s.secured_frames.len() as i64);
        self.metrics
            .batches_created
            .with_label_values(&["confirmed"])
            .inc();
    }

    /// Rolls a batch's frames out of `Compressed` (invariant 3). Never moves a
    /// `confirmed` batch (invariant 2): failing an already-confirmed id is a no-op.
    pub fn register_batch_failed(&self, batch_id: u64) {
        let mut s = self.state.lock();
        let Some(batch) = s.batches.get_mut(&batch_id) else {
            return;
        };
        if batch.status == BatchStatus::Confirmed {
            return;
        }
        batch.status = BatchStatus::Failed;
        let frames = batch.frames.clone();
        for f in &frames {
            s.compressed_frames.remove(f);
        }
        self.metrics
            .compressed_frames_total
            .set(s.compressed_frames.len() as i64);
        self.metrics.batches_failed.with_label_values(&["upload"]).inc();
    }

    pub fn total_frames(&self) -> u64 {
        self.state.lock().total_frames
    }

    /// Records a single upload's wall-clock duration, labelled `"batch"` or
    /// `"dictionary"`.
    pub fn observe_upload_duration(&self, kind: &str, duration: Duration) {
        self.metrics
            .upload_duration_seconds
            .with_label_values(&[kind])
            .observe(duration.as_secs_f64());
    }

    /// Flips the dictionary-trained gauge on, whether the dictionary was just
    /// trained from samples or loaded from disk/resume.
    pub fn mark_dictionary_trained(&self) {
        self.metrics.dictionary_trained.set(1);
    }

    pub fn upload_speed_bps(&self) -> f64 {
        self.state.lock().upload_speed_bps
    }

    pub fn compression_ratio(&self) -> f64 {
        self.state.lock().compression_ratio
    }

    /// A confirmed-batches view used by the Compressor's adaptive sizing formula.
    pub fn confirmed_batches(&self) -> Vec<BatchInfo> {
        self.state
            .lock()
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Confirmed && !b.frames.is_empty())
            .cloned()
            .collect()
    }

    pub fn baked_percent(&self) -> f64 {
        let s = self.state.lock();
        percent(s.baked_frames.len(), s.total_frames)
    }

    pub fn compressed_percent(&self) -> f64 {
        let s = self.state.lock();
        percent(s.compressed_frames.len(), s.total_frames)
    }

    pub fn secured_percent(&self) -> f64 {
        let s = self.state.lock();
        percent(s.secured_frames.len(), s.total_frames)
    }

    pub fn last_baked_frame(&self) -> u64 {
        self.state.lock().baked_frames.iter().next_back().copied().unwrap_or(0)
    }

    pub fn last_secured_frame(&self) -> u64 {
        self.state.lock().secured_frames.iter().next_back().copied().unwrap_or(0)
    }

    pub fn eta_baking(&self) -> f64 {
        let s = self.state.lock();
        let remaining = s.total_frames.saturating_sub(s.baked_frames.len() as u64);
        if s.baking_speed_fps <= 0.0 || remaining == 0 {
            return 0.0;
        }
        remaining as f64 / s.baking_speed_fps
    }

    pub fn eta_secured(&self) -> f64 {
        let s = self.state.lock();
        let remaining = s.total_frames.saturating_sub(s.secured_frames.len() as u64);
        if remaining == 0 {
            return 0.0;
        }
        let confirmed: Vec<&BatchInfo> = s
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Confirmed)
            .collect();
        if confirmed.is_empty() || s.upload_speed_bps <= 0.0 {
            return remaining as f64 * 2.0;
        }
        let avg_compressed_per_frame: f64 = confirmed
            .iter()
            .map(|b| b.compressed_size as f64 / (b.frames.len().max(1) as f64))
            .sum::<f64>()
            / confirmed.len() as f64;
        (remaining as f64 * avg_compressed_per_frame) / s.upload_speed_bps
    }

    /// Snapshot used for the `PROGRESS_UPDATE` control-channel message: all
    /// derived quantities plus the last 10 batches in reverse-id order.
    pub fn status_snapshot(&self) -> StatusSnapshot {
        let s = self.state.lock();
        let mut recent: Vec<BatchInfo> = s.batches.values().cloned().collect();
        recent.sort_by(|a, b| b.batch_id.cmp(&a.batch_id));
        recent.truncate(10);
        StatusSnapshot {
            total_frames: s.total_frames,
            baked_frames: s.baked_frames.len() as u64,
            baked_percent: round1(percent(s.baked_frames.len(), s.total_frames)),
            last_baked_frame: s.baked_frames.iter().next_back().copied().unwrap_or(0),
            compressed_frames: s.compressed_frames.len() as u64,
            compressed_percent: round1(percent(s.compressed_frames.len(), s.total_frames)),
            secured_frames: s.secured_frames.len() as u64,
            secured_percent: round1(percent(s.secured_frames.len(), s.total_frames)),
            last_secured_frame: s.secured_frames.iter().next_back().copied().unwrap_or(0),
            upload_speed_bps: s.upload_speed_bps.round(),
            compression_ratio: round1(s.compression_ratio),
            baking_speed_fps: (s.baking_speed_fps * 100.0).round() / 100.0,
            batches: recent,
        }
    }
}

fn percent(count: usize, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (count as f64 / total as f64 * 100.0).min(100.0)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub total_frames: u64,
    pub baked_frames: u64,
    pub baked_percent: f64,
    pub last_baked_frame: u64,
    pub compressed_frames: u64,
    pub compressed_percent: f64,
    pub secured_frames: u64,
    pub secured_percent: f64,
    pub last_secured_frame: u64,
    pub upload_speed_bps: f64,
    pub compression_ratio: f64,
    pub baking_speed_fps: f64,
    pub batches: Vec<BatchInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(total: u64) -> Ledger {
        Ledger::new(total, BTreeSet::new(), Arc::new(Metrics::new_for_test()))
    }

    #[test]
    fn set_inclusion_holds_through_full_lifecycle() {
        let l = ledger(9);
        for f in 1..=3u64 {
            l.register_baked_frame(f);
        }
        let id = l.create_batch(vec![1, 2, 3]);
        l.register_compressed(id, 100, 400);
        l.register_secured(id, "cache/batch_0001.tar.zst".into(), Duration::from_secs(1));

        assert!(l.secured_percent() <= l.compressed_percent() + 0.001);
        assert!(l.compressed_percent() <= l.baked_percent() + 0.001);
    }

    #[test]
    fn batch_ids_are_monotonic_and_unique() {
        let l = ledger(100);
        let a = l.create_batch(vec![1]);
        let b = l.create_batch(vec![2]);
        let c = l.create_batch(vec![3]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn confirmed_batch_never_transitions_again() {
        let l = ledger(10);
        let id = l.create_batch(vec![1, 2]);
        l.register_compressed(id, 10, 40);
        l.register_secured(id, "k".into(), Duration::from_millis(500));
        l.register_batch_failed(id);

        let snap = l.status_snapshot();
        let batch = snap.batches.iter().find(|b| b.batch_id == id).unwrap();
        assert_eq!(batch.status, BatchStatus::Confirmed);
        // Secured set must retain the batch's frames despite the late failure call.
        assert_eq!(l.secured_percent(), percent(2, 10));
    }

    #[test]
    fn failure_rolls_frames_out_of_compressed() {
        let l = ledger(10);
        let id = l.create_batch(vec![4, 5, 6]);
        l.register_compressed(id, 10, 40);
        assert_eq!(l.compressed_percent(), percent(3, 10));
        l.register_batch_failed(id);
        assert_eq!(l.compressed_percent(), 0.0);
    }

    #[test]
    fn percent_accessors_are_bounded() {
        let l = ledger(2);
        for f in 1..=5u64 {
            l.register_baked_frame(f);
        }
        assert!(l.baked_percent() <= 100.0);
        assert!(l.baked_percent() >= 0.0);
    }

    #[test]
    fn adaptive_resize_inputs_reach_max_batch_size() {
        // S2: total=60, upload_speed=1e6, ratio=4, raw_per_frame=200_000.
        // target = (1e6 * 20) / (200_000/4) = 400, clamped to MAX=50.
        let l = ledger(60);
        let id = l.create_batch((1..=10).collect());
        l.register_compressed(id, 500_000, 2_000_000); // ratio 4
        l.register_secured(id, "k".into(), Duration::from_secs_f64(2_000_000.0 / 1_000_000.0));
        assert!((l.upload_speed_bps() - 1_000_000.0).abs() < 1.0);
        assert!((l.compression_ratio() - 4.0).abs() < 0.001);
    }
}
