// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_with_registry, HistogramVec, IntCounterVec, IntGauge, Registry,
};

/// Metrics shared by all pipeline components, grounded on `consensus-core`'s
/// `Context { metrics: Arc<Metrics> }` pattern: one struct, constructed once,
/// threaded through by `Arc` rather than touched through globals.
pub struct Metrics {
    pub batches_created: IntCounterVec,
    pub batches_failed: IntCounterVec,
    pub baked_frames_total: IntGauge,
    pub compressed_frames_total: IntGauge,
    pub secured_frames_total: IntGauge,
    pub upload_duration_seconds: HistogramVec,
    pub dictionary_trained: IntGauge,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            batches_created: register_int_counter_vec_with_registry!(
                "cache_streamer_batches_created_total",
                "Batches created by the compressor, labelled by terminal status once known",
                &["status"],
                registry,
            )
            .unwrap(),
            batches_failed: register_int_counter_vec_with_registry!(
                "cache_streamer_batches_failed_total",
                "Batches that transitioned to failed, labelled by stage",
                &["stage"],
                registry,
            )
            .unwrap(),
            baked_frames_total: register_int_gauge_with_registry!(
                "cache_streamer_baked_frames",
                "Number of frames observed stable on disk",
                registry,
            )
            .unwrap(),
            compressed_frames_total: register_int_gauge_with_registry!(
                "cache_streamer_compressed_frames",
                "Number of frames included in a completed compression",
                registry,
            )
            .unwrap(),
            secured_frames_total: register_int_gauge_with_registry!(
                "cache_streamer_secured_frames",
                "Number of frames confirmed uploaded",
                registry,
            )
            .unwrap(),
            upload_duration_seconds: register_histogram_vec_with_registry!(
                "cache_streamer_upload_duration_seconds",
                "Wall-clock duration of a single batch PUT",
                &["kind"],
                registry,
            )
            .unwrap(),
            dictionary_trained: register_int_gauge_with_registry!(
                "cache_streamer_dictionary_trained",
                "1 once the zstd dictionary has been trained or loaded",
                registry,
            )
            .unwrap(),
        }
    }

    /// A `Metrics` instance backed by a private registry, for tests and for binaries
    /// that do not (yet) expose a `/metrics` endpoint.
    pub fn new_for_test() -> Self {
        Self::new(&Registry::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_registers_without_panic() {
        let _metrics = Metrics::new_for_test();
    }
}
