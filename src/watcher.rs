// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Watches the cache directory for new simulation output, deduplicates and
//! waits for file-size stability, then hands stable artifacts to the
//! Compressor over an unbounded channel.
//!
//! Ported from `examples/original_source/programs/pipeline.py`'s `FrameWatcher`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher as _};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::artifact::{extract_frame_number, is_recognized_extension};
use crate::control::ControlChannelHandle;
use crate::ledger::Ledger;

const STABLE_POLL_INTERVAL: Duration = Duration::from_millis(300);
const STABLE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Watcher {
    cache_dir: PathBuf,
    ledger: Ledger,
    control: Option<ControlChannelHandle>,
    already_secured: HashSet<u64>,
    seen: HashSet<PathBuf>,
    out: UnboundedSender<PathBuf>,
}

impl Watcher {
    pub fn new(
        cache_dir: PathBuf,
        ledger: Ledger,
        control: Option<ControlChannelHandle>,
        already_secured: HashSet<u64>,
        out: UnboundedSender<PathBuf>,
    ) -> Self {
        Self {
            cache_dir,
            ledger,
            control,
            already_secured,
            seen: HashSet::new(),
            out,
        }
    }

    /// Scans pre-existing files (initial = true, no stability wait, no
    /// `PROGRESS_BAKED` emission — mirrors `_scan_existing`) then spawns a
    /// `notify` watcher for subsequent filesystem events. Runs to completion
    /// only when the returned join handle is awaited or dropped at shutdown.
    pub async fn run(mut self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        self.scan_existing().await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut notify_watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(std::io::Error::other)?;
        notify_watcher
            .watch(&self.cache_dir, RecursiveMode::Recursive)
            .map_err(std::io::Error::other)?;

        info!(dir = %self.cache_dir.display(), "watcher started");

        while let Some(event) = rx.recv().await {
            use notify::EventKind;
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                continue;
            }
            for path in event.paths {
                if path.is_dir() {
                    continue;
                }
                self.on_file(path).await;
            }
        }

        Ok(())
    }

    async fn scan_existing(&mut self) {
        let mut stack = vec![self.cache_dir.clone()];
        let mut found = Vec::new();
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if is_recognized_extension(&path) {
                    found.push(path);
                }
            }
        }
        for path in found {
            self.process_file(path, true).await;
        }
    }

    async fn on_file(&mut self, path: PathBuf) {
        if !is_recognized_extension(&path) {
            return;
        }
        self.process_file(path, false).await;
    }

    async fn process_file(&mut self, path: PathBuf, initial: bool) {
        if self.seen.contains(&path) {
            return;
        }
        self.seen.insert(path.clone());

        let frame = extract_frame_number(&path);
        if let Some(frame) = frame {
            self.ledger.register_baked_frame(frame);
            if !initial {
                if let Some(control) = &self.control {
                    control.notify_baked(frame, self.ledger.total_frames());
                }
            }
            if self.already_secured.contains(&frame) {
                return;
            }
        }

        if !initial && !wait_stable(&path).await {
            return;
        }

        if self.out.send(path).is_err() {
            warn!("compressor channel closed, dropping discovered file");
        }
    }
}

/// Polls file size at `STABLE_POLL_INTERVAL` until two consecutive reads agree
/// on a positive size, or `STABLE_TIMEOUT` elapses. A vanished file is
/// reported unstable immediately. Matches `_wait_stable`'s "use whatever size
/// we last saw if positive" timeout fallback.
async fn wait_stable(path: &Path) -> bool {
    let mut last_size: i64 = -1;
    let mut waited = Duration::ZERO;
    while waited < STABLE_TIMEOUT {
        let size = match std::fs::metadata(path) {
            Ok(meta) => meta.len() as i64,
            Err(_) => return false,
        };
        if size == last_size && size > 0 {
            return true;
        }
        last_size = size;
        tokio::time::sleep(STABLE_POLL_INTERVAL).await;
        waited += STABLE_POLL_INTERVAL;
    }
    last_size > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    #[tokio::test]
    async fn already_secured_frames_are_suppressed_from_output() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(10, BTreeSet::new(), Arc::new(Metrics::new_for_test()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut already = HashSet::new();
        already.insert(1u64);

        let mut watcher = Watcher::new(dir.path().to_path_buf(), ledger, None, already, tx);
        let f = dir.path().join("foo_0001.bphys");
        std::fs::write(&f, b"stable").unwrap();

        watcher.process_file(f, true).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unrecognized_extensions_are_ignored() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(10, BTreeSet::new(), Arc::new(Metrics::new_for_test()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = Watcher::new(dir.path().to_path_buf(), ledger, None, HashSet::new(), tx);

        let f = dir.path().join("notes.txt");
        std::fs::write(&f, b"irrelevant").unwrap();
        watcher.on_file(f).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dedup_prevents_reprocessing_the_same_path() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(10, BTreeSet::new(), Arc::new(Metrics::new_for_test()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = Watcher::new(dir.path().to_path_buf(), ledger, None, HashSet::new(), tx);

        let f = dir.path().join("foo_0002.bphys");
        std::fs::write(&f, b"stable content").unwrap();
        watcher.process_file(f.clone(), true).await;
        watcher.process_file(f, true).await;
        assert_eq!(rx.try_recv().is_ok(), true);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wait_stable_times_out_with_positive_last_size() {
        let dir = tempdir().unwrap();
        let f = dir.path().join("pending_0003.vdb");
        std::fs::write(&f, b"x").unwrap();
        // File never changes size again; should still report stable once the
        // two-equal-reads condition is met well before the 3s timeout.
        assert!(wait_stable(&f).await);
    }

    #[tokio::test]
    async fn wait_stable_reports_false_for_missing_file() {
        let dir = tempdir().unwrap();
        let f = dir.path().join("missing_0004.vdb");
        assert!(!wait_stable(&f).await);
    }
}
