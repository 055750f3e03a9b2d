// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Property-style checks for the Ledger invariants that hold across arbitrary
//! sequences of batch lifecycle transitions, complementing the fixed-scenario
//! checks in `scenarios.rs`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cache_streamer::ledger::{BatchStatus, Ledger};
use cache_streamer::metrics::Metrics;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn fresh_ledger(total: u64) -> Ledger {
    Ledger::new(total, BTreeSet::new(), Arc::new(Metrics::new_for_test()))
}

/// Invariant 1 (set inclusion) and invariant 8 (bounded percentages) hold
/// after every step of a randomized sequence of batch creations, successes
/// and failures.
#[test]
fn set_inclusion_and_bounded_percent_hold_across_random_sequences() {
    for seed in 0u64..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let total_frames = 100u64;
        let ledger = fresh_ledger(total_frames);
        let mut next_frame = 1u64;

        for _ in 0..30 {
            if next_frame > total_frames {
                break;
            }
            let batch_len: u64 = rng.gen_range(1..=5u64).min(total_frames - next_frame + 1);
            let frames: Vec<u64> = (next_frame..next_frame + batch_len).collect();
            next_frame += batch_len;

            for frame in &frames {
                ledger.register_baked_frame(*frame);
            }

            let id = ledger.create_batch(frames);
            ledger.register_compressed(id, 100, 400);

            if rng.gen_bool(0.25) {
                ledger.register_batch_failed(id);
            } else {
                ledger.register_secured(id, format!("cache/batch_{id:04}.tar.zst"), Duration::from_millis(50));
            }

            assert!(
                ledger.secured_percent() <= ledger.compressed_percent() + 0.001,
                "seed {seed}: Secured must stay within Compressed"
            );
            assert!(
                ledger.compressed_percent() <= ledger.baked_percent() + 0.001,
                "seed {seed}: Compressed must stay within Baked"
            );
            for percent in [ledger.baked_percent(), ledger.compressed_percent(), ledger.secured_percent()] {
                assert!((0.0..=100.0).contains(&percent), "seed {seed}: percent out of bounds: {percent}");
            }
        }
    }
}

/// Invariant 2 (monotonic, unique batch ids) across a longer random run.
#[test]
fn batch_ids_stay_monotonic_and_unique_across_many_creations() {
    let ledger = fresh_ledger(10_000);
    let mut last = 0u64;
    let mut seen = BTreeSet::new();
    for i in 0..500u64 {
        let id = ledger.create_batch(vec![i]);
        assert!(id > last, "batch id {id} did not increase past {last}");
        assert!(seen.insert(id), "batch id {id} was reused");
        last = id;
    }
}

/// Invariant 3 (terminal confirmation): once confirmed, further
/// `register_batch_failed` or `register_compressed` calls never move a batch
/// out of `confirmed`, whatever the call order or repetition.
#[test]
fn confirmed_batches_are_terminal_under_repeated_late_calls() {
    let ledger = fresh_ledger(10);
    let id = ledger.create_batch(vec![1, 2, 3]);
    ledger.register_compressed(id, 10, 40);
    ledger.register_secured(id, "cache/batch_0001.tar.zst".into(), Duration::from_millis(10));

    for _ in 0..5 {
        ledger.register_batch_failed(id);
        ledger.register_compressed(id, 999, 999);
        let snapshot = ledger.status_snapshot();
        let batch = snapshot.batches.iter().find(|b| b.batch_id == id).unwrap();
        assert_eq!(batch.status, BatchStatus::Confirmed);
    }
    assert_eq!(ledger.secured_percent(), 30.0);
}

/// Invariant 4 (failure rollback): a failed batch's frames are absent from
/// Compressed immediately afterward, for every batch in a randomized set of
/// concurrent in-flight batches.
#[test]
fn failure_rollback_removes_exactly_the_failed_batchs_frames() {
    let ledger = fresh_ledger(30);
    let ids: Vec<u64> = (0..3)
        .map(|i| {
            let frames: Vec<u64> = ((i * 10 + 1)..=(i * 10 + 10)).collect();
            let id = ledger.create_batch(frames);
            ledger.register_compressed(id, 100, 400);
            id
        })
        .collect();

    assert_eq!(ledger.compressed_percent(), 100.0);

    ledger.register_batch_failed(ids[1]);
    let snapshot = ledger.status_snapshot();
    let failed_frames: BTreeSet<u64> = snapshot
        .batches
        .iter()
        .find(|b| b.batch_id == ids[1])
        .unwrap()
        .frames
        .iter()
        .copied()
        .collect();
    assert_eq!(failed_frames, (11..=20).collect::<BTreeSet<_>>());
    assert!(
        (ledger.compressed_percent() - 200.0 / 3.0).abs() < 0.01,
        "only the failed batch's 10 frames should drop out of Compressed, got {}",
        ledger.compressed_percent()
    );
}
