// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! VM worker process entrypoint: bootstraps configuration and logging,
//! authenticates the control channel, runs resume, then drives the pipeline
//! to completion or shutdown.
//!
//! Ported from `examples/original_source/programs/vm_main.py`'s `main`.

use std::collections::HashSet;
use std::sync::Arc;

use cache_streamer::artifact::validate_cache_manifest;
use cache_streamer::blob::{fetch_source_blob, save_source_blob};
use cache_streamer::config::{CliArgs, Config};
use cache_streamer::control::{ControlChannelHandle, InboundMessage, WsControlChannel};
use cache_streamer::dictionary::DictionaryManager;
use cache_streamer::metrics::Metrics;
use cache_streamer::pipeline::{self, Pipeline, ShutdownCounter};
use cache_streamer::resume::ResumeManager;
use cache_streamer::uploader::{build_client, S3Credentials};
use clap::Parser;
use prometheus::Registry;
use tokio::sync::Notify;
use tracing::{error, info, warn};

const DEFAULT_TOTAL_FRAMES: u64 = 250;
const START_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("cache-streamer VM worker starting");

    let config = match Config::from_env(args) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration invalid, exiting");
            std::process::exit(1);
        }
    };

    if let Err(e) = config.ensure_dirs() {
        error!(error = %e, "could not prepare working directories, exiting");
        std::process::exit(1);
    }

    let metrics = Arc::new(Metrics::new(&Registry::new()));

    let shutdown = ShutdownCounter::new();
    let shutdown_notify = Arc::new(Notify::new());
    spawn_signal_handlers(shutdown.clone(), shutdown_notify.clone());

    let control_channel = WsControlChannel::new(&config);
    let (control_handle, mut inbound_rx, control_join) = control_channel.spawn();

    let mut s3_credentials: Option<S3Credentials> = None;
    let mut resume_info: Option<InboundMessage> = None;
    let mut pipeline: Option<Pipeline> = None;

    loop {
        tokio::select! {
            msg = inbound_rx.recv() => {
                match msg {
                    Some(InboundMessage::S3Credentials { endpoint, bucket, region, access_key_id, secret_access_key, cache_prefix }) => {
                        info!(cache_prefix = %cache_prefix, "received S3 credentials");
                        s3_credentials = Some(S3Credentials { endpoint, bucket, region, access_key_id, secret_access_key, cache_prefix });
                    }
                    Some(msg @ InboundMessage::ResumeInfo { .. }) => {
                        info!("received resume info");
                        resume_info = Some(msg);
                    }
                    Some(InboundMessage::BlendFileUrl { url }) => {
                        info!(url = %url, "downloading source blob");
                        match fetch_source_blob(&url).await {
                            Ok(data) => {
                                if let Err(e) = save_source_blob(&config.blend_file, &data).await {
                                    error!(error = %e, "failed to persist source blob");
                                } else if pipeline.is_none() {
                                    tokio::time::sleep(START_DELAY).await;
                                    pipeline = start_pipeline(&config, &s3_credentials, &resume_info, control_handle.clone(), metrics.clone()).await;
                                }
                            }
                            Err(e) => error!(error = %e, "failed to download source blob"),
                        }
                    }
                    Some(InboundMessage::Terminate { reason }) => {
                        warn!(reason = %reason, "coordinator requested termination");
                        break;
                    }
                    None => {
                        warn!("control channel closed permanently");
                        break;
                    }
                }
            }
            _ = shutdown_notify.notified() => {
                warn!("shutdown signal received, starting graceful finalize");
                break;
            }
        }
    }

    let Some(pipeline) = pipeline else {
        warn!("shutting down before the pipeline ever started");
        control_join.abort();
        std::process::exit(1);
    };

    if let Some(manifest) = validate_cache_manifest(&config.cache_dir) {
        info!(status = %manifest.status, artifacts = manifest.artifacts.len(), "read cache manifest at shutdown");
    }

    let secured_percent = pipeline.ledger().secured_percent();
    pipeline.finalize().await;
    control_join.abort();

    let code = pipeline::exit_code(secured_percent, config.strict);
    info!(exit_code = code, "cache-streamer VM worker exiting");
    std::process::exit(code);
}

async fn start_pipeline(
    config: &Config,
    s3_credentials: &Option<S3Credentials>,
    resume_info: &Option<InboundMessage>,
    control_handle: ControlChannelHandle,
    metrics: Arc<Metrics>,
) -> Option<Pipeline> {
    let Some(creds) = s3_credentials.clone() else {
        error!("no S3 credentials received, cannot start pipeline");
        return None;
    };

    let mut total_frames = DEFAULT_TOTAL_FRAMES;
    let mut already_secured: HashSet<u64> = HashSet::new();
    let mut dict_bytes = None;

    if let Some(InboundMessage::ResumeInfo { secured_frames, total_frames: t, cache_batches, zstd_dictionary_key }) = resume_info {
        already_secured = secured_frames.iter().copied().collect();
        total_frames = *t;

        if !cache_batches.is_empty() || zstd_dictionary_key.is_some() {
            info!(batches = cache_batches.len(), "resuming from prior cache state");
            let client = build_client(&creds);
            let resume_mgr = ResumeManager::new(client, creds.bucket.clone());

            if let Some(key) = zstd_dictionary_key {
                dict_bytes = resume_mgr.download_dictionary(key, &config.dict_file).await;
            }

            if !cache_batches.is_empty() {
                let dict_for_restore = dict_bytes.as_ref().map(|bytes| {
                    let mut d = DictionaryManager::new(config.zstd_level);
                    d.load_from_bytes(bytes.clone());
                    d
                });
                let restored = resume_mgr
                    .download_batches(cache_batches, &config.cache_dir, dict_for_restore.as_ref())
                    .await;
                already_secured.extend(restored);
            }
        }
    }

    info!(total_frames, secured = already_secured.len(), "starting pipeline");
    let client = build_client(&creds);
    Some(Pipeline::start(
        config,
        total_frames,
        already_secured,
        dict_bytes,
        client,
        creds.bucket,
        creds.cache_prefix,
        Some(control_handle),
        metrics,
    ))
}

/// The first signal wakes the main message loop into its graceful finalize
/// path (mirroring `vm_main.py`'s `shutdown()`, invoked immediately on the
/// first SIGINT/SIGTERM via `loop.add_signal_handler`); the third and any
/// later signal forces an immediate exit regardless of finalize progress.
fn spawn_signal_handlers(shutdown: ShutdownCounter, notify: Arc<Notify>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        tokio::spawn(async move {
            let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
            let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
            loop {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
                if shutdown.signal() {
                    std::process::exit(130);
                }
                notify.notify_one();
            }
        });
    }
}
