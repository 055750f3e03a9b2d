// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Control-channel protocol and transport.
//!
//! Ported from `examples/original_source/programs/ws_client.py`'s `WSClient`.
//! Workers never touch the socket: they hold a cheaply-cloneable
//! [`ControlChannelHandle`] and call its `notify_*`/`send_*` methods, which push
//! onto an unbounded channel drained by the single task that owns the
//! connection (§9's "thread-safe submit primitive", replacing the source's
//! `asyncio.run_coroutine_threadsafe`).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ControlChannelError;
use crate::ledger::StatusSnapshot;

const PROTOCOL_VERSION: u32 = 2;
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum InboundMessage {
    S3Credentials {
        endpoint: String,
        bucket: String,
        region: String,
        access_key_id: String,
        secret_access_key: String,
        cache_prefix: String,
    },
    ResumeInfo {
        secured_frames: Vec<u64>,
        total_frames: u64,
        cache_batches: Vec<CacheBatchDescriptor>,
        zstd_dictionary_key: Option<String>,
    },
    BlendFileUrl {
        url: String,
    },
    Terminate {
        reason: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheBatchDescriptor {
    pub key: String,
}

#[derive(Debug, Clone)]
enum OutboundMessage {
    Auth { password: String },
    Alive,
    ProgressBaked { frame: u64, total: u64 },
    ProgressCompressed {
        frames: Vec<u64>,
        batch_id: u64,
        compressed_size: u64,
        raw_size: u64,
    },
    ProgressSecured {
        frames: Vec<u64>,
        batch_id: u64,
        r2_key: String,
        upload_speed_bps: f64,
        size: Option<u64>,
        etag: Option<String>,
    },
    ProgressUpdate {
        snapshot: Box<StatusSnapshot>,
        current_batch_size: usize,
    },
    ReadyToTerminate,
}

impl OutboundMessage {
    fn to_json(&self) -> serde_json::Value {
        let now_ms = now_millis();
        match self {
            OutboundMessage::Auth { password } => json!({
                "type": "AUTH",
                "password": password,
                "timestamp": now_ms,
                "protocolVersion": PROTOCOL_VERSION,
            }),
            OutboundMessage::Alive => json!({ "type": "ALIVE" }),
            OutboundMessage::ProgressBaked { frame, total } => json!({
                "type": "PROGRESS_BAKED",
                "frame": frame,
                "total": total,
                "timestamp": now_ms,
            }),
            OutboundMessage::ProgressCompressed { frames, batch_id, compressed_size, raw_size } => json!({
                "type": "PROGRESS_COMPRESSED",
                "frames": frames,
                "batchId": batch_id,
                "compressedSize": compressed_size,
                "rawSize": raw_size,
                "timestamp": now_ms,
            }),
            OutboundMessage::ProgressSecured { frames, batch_id, r2_key, upload_speed_bps, size, etag } => {
                let mut v = json!({
                    "type": "PROGRESS_SECURED",
                    "frames": frames,
                    "batchId": batch_id,
                    "r2Key": r2_key,
                    "uploadSpeedBps": upload_speed_bps.round() as i64,
                    "timestamp": now_ms,
                });
                if let Some(size) = size {
                    v["size"] = json!(size);
                }
                if let Some(etag) = etag {
                    v["etag"] = json!(etag);
                }
                v
            }
            OutboundMessage::ProgressUpdate { snapshot, current_batch_size } => json!({
                "type": "PROGRESS_UPDATE",
                "uploadPercent": snapshot.secured_percent as i64,
                "diskBytes": 0,
                "diskFiles": snapshot.baked_frames,
                "uploadedBytes": 0,
                "uploadedFiles": snapshot.secured_frames,
                "errors": 0,
                "rateBytesPerSec": snapshot.upload_speed_bps as i64,
                "currentBatchSize": current_batch_size,
                "progress": snapshot,
            }),
            OutboundMessage::ReadyToTerminate => json!({ "type": "READY_TO_TERMINATE" }),
        }
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Cheaply cloneable submit handle. Messages are dropped (not queued) while
/// disconnected, matching §7: "outbound progress events... are dropped if
/// unconnected; they are informational, the ledger retains authoritative state."
#[derive(Clone)]
pub struct ControlChannelHandle {
    tx: UnboundedSender<OutboundMessage>,
    connected: Arc<AtomicBool>,
    server_time_delta_ms: Arc<AtomicI64>,
}

impl ControlChannelHandle {
    fn push(&self, msg: OutboundMessage) {
        if self.connected.load(Ordering::Relaxed) {
            let _ = self.tx.send(msg);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// `serverTime - local_time` in milliseconds, computed once on the most
    /// recent `AUTH_SUCCESS`. Zero until the first successful authentication.
    pub fn server_time_delta_ms(&self) -> i64 {
        self.server_time_delta_ms.load(Ordering::Relaxed)
    }

    pub fn notify_baked(&self, frame: u64, total: u64) {
        self.push(OutboundMessage::ProgressBaked { frame, total });
    }

    pub fn notify_compressed(&self, frames: Vec<u64>, batch_id: u64, compressed_size: u64, raw_size: u64) {
        self.push(OutboundMessage::ProgressCompressed { frames, batch_id, compressed_size, raw_size });
    }

    pub fn notify_secured(
        &self,
        frames: Vec<u64>,
        batch_id: u64,
        r2_key: String,
        upload_speed_bps: f64,
        size: Option<u64>,
        etag: Option<String>,
    ) {
        self.push(OutboundMessage::ProgressSecured {
            frames,
            batch_id,
            r2_key,
            upload_speed_bps,
            size,
            etag,
        });
    }

    pub fn notify_progress(&self, snapshot: StatusSnapshot, current_batch_size: usize) {
        self.push(OutboundMessage::ProgressUpdate {
            snapshot: Box::new(snapshot),
            current_batch_size,
        });
    }

    pub fn send_ready_to_terminate(&self) {
        self.push(OutboundMessage::ReadyToTerminate);
    }
}

/// Owns the websocket connection, authentication handshake, heartbeat and
/// reconnect loop. `run` resolves only when `max_reconnect_attempts` is
/// exhausted or the process asks it to stop via the outbound channel closing.
pub struct WsControlChannel {
    url: String,
    password: String,
    heartbeat_interval: Duration,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
}

impl WsControlChannel {
    pub fn new(config: &Config) -> Self {
        Self {
            url: config.ws_url.clone(),
            password: config.vm_password.clone(),
            heartbeat_interval: config.heartbeat_interval,
            reconnect_delay: config.reconnect_delay,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }

    /// Wires up the submit handle, the heartbeat task, and the connection task,
    /// and returns `(handle, inbound_rx, join_handle)`. The caller (pipeline
    /// wiring) awaits or aborts `join_handle` at shutdown.
    pub fn spawn(self) -> (ControlChannelHandle, UnboundedReceiver<InboundMessage>, tokio::task::JoinHandle<ControlChannelError>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let server_time_delta_ms = Arc::new(AtomicI64::new(0));

        let heartbeat_tx = out_tx.clone();
        let heartbeat_connected = connected.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if heartbeat_connected.load(Ordering::Relaxed) {
                    let _ = heartbeat_tx.send(OutboundMessage::Alive);
                }
            }
        });

        let run_connected = connected.clone();
        let run_delta = server_time_delta_ms.clone();
        let join = tokio::spawn(self.run(run_connected, run_delta, in_tx, out_rx));

        (
            ControlChannelHandle { tx: out_tx, connected, server_time_delta_ms },
            in_rx,
            join,
        )
    }

    /// Runs the reconnect loop until `max_reconnect_attempts` consecutive
    /// failures occur. `connected` is the same flag embedded in the
    /// [`ControlChannelHandle`] returned by [`WsControlChannel::spawn`].
    async fn run(
        self,
        connected: Arc<AtomicBool>,
        server_time_delta_ms: Arc<AtomicI64>,
        inbound_tx: UnboundedSender<InboundMessage>,
        mut outbound_rx: UnboundedReceiver<OutboundMessage>,
    ) -> ControlChannelError {
        let mut attempt = 0u32;
        loop {
            info!(url = %self.url, "connecting to control channel");
            match self
                .connect_once(&connected, &server_time_delta_ms, &inbound_tx, &mut outbound_rx)
                .await
            {
                Ok(()) => {
                    // Clean TERMINATE-driven close; caller decides whether to stop.
                    return ControlChannelError::Protocol("terminated by coordinator".into());
                }
                Err(e) => {
                    warn!(error = %e, "control channel connection lost");
                }
            }
            connected.store(false, Ordering::Relaxed);
            attempt += 1;
            if attempt >= self.max_reconnect_attempts {
                return ControlChannelError::ReconnectExhausted(attempt);
            }
            let delay = self.reconnect_delay.saturating_mul(attempt).min(Duration::from_secs(30));
            info!(attempt, delay_secs = delay.as_secs(), "reconnecting to control channel");
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_once(
        &self,
        connected: &Arc<AtomicBool>,
        server_time_delta_ms: &Arc<AtomicI64>,
        inbound_tx: &UnboundedSender<InboundMessage>,
        outbound_rx: &mut UnboundedReceiver<OutboundMessage>,
    ) -> Result<(), ControlChannelError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| ControlChannelError::Transport(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        write
            .send(Message::Text(
                OutboundMessage::Auth { password: self.password.clone() }.to_json().to_string(),
            ))
            .await
            .map_err(|e| ControlChannelError::Transport(e.to_string()))?;

        let auth_response = tokio::time::timeout(AUTH_TIMEOUT, read.next())
            .await
            .map_err(|_| ControlChannelError::Protocol("timed out waiting for AUTH_SUCCESS".into()))?
            .ok_or_else(|| ControlChannelError::Transport("connection closed during auth".into()))?
            .map_err(|e| ControlChannelError::Transport(e.to_string()))?;

        let text = match auth_response {
            Message::Text(t) => t,
            _ => return Err(ControlChannelError::Protocol("non-text auth response".into())),
        };
        let parsed: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| ControlChannelError::Protocol(e.to_string()))?;
        match parsed.get("type").and_then(|v| v.as_str()) {
            Some("AUTH_SUCCESS") => {
                let token = parsed.get("token").and_then(|v| v.as_str()).unwrap_or_default();
                let protocol_version = parsed.get("protocolVersion").and_then(|v| v.as_u64());
                let server_time = parsed.get("serverTime").and_then(|v| v.as_i64()).unwrap_or(0);
                if server_time > 0 {
                    server_time_delta_ms.store(server_time - now_millis(), Ordering::Relaxed);
                }
                info!(
                    token_prefix = &token[..token.len().min(8)],
                    protocol_version,
                    "control channel authenticated"
                );
                connected.store(true, Ordering::Relaxed);
            }
            Some("AUTH_FAILED") => {
                let reason = parsed.get("reason").and_then(|v| v.as_str()).unwrap_or("unknown");
                return Err(ControlChannelError::Protocol(format!("auth failed: {reason}")));
            }
            other => {
                return Err(ControlChannelError::Protocol(format!("unexpected auth response: {other:?}")));
            }
        }

        loop {
            tokio::select! {
                incoming = read.next() => {
                    let Some(msg) = incoming else { return Ok(()); };
                    let msg = msg.map_err(|e| ControlChannelError::Transport(e.to_string()))?;
                    let Message::Text(text) = msg else { continue; };
                    match parse_inbound(&text) {
                        Ok(Some(InboundMessage::Terminate { reason })) => {
                            warn!(reason, "received TERMINATE from coordinator");
                            let _ = inbound_tx.send(InboundMessage::Terminate { reason });
                            return Ok(());
                        }
                        Ok(Some(m)) => {
                            let _ = inbound_tx.send(m);
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "failed to parse control channel message"),
                    }
                }
                outgoing = outbound_rx.recv() => {
                    let Some(msg) = outgoing else { return Ok(()); };
                    if write.send(Message::Text(msg.to_json().to_string())).await.is_err() {
                        return Err(ControlChannelError::Transport("send failed".into()));
                    }
                }
            }
        }
    }
}

fn parse_inbound(text: &str) -> Result<Option<InboundMessage>, serde_json::Error> {
    let v: serde_json::Value = serde_json::from_str(text)?;
    let msg_type = v.get("type").and_then(|t| t.as_str()).unwrap_or_default();
    Ok(match msg_type {
        "S3_CREDENTIALS" => Some(InboundMessage::S3Credentials {
            endpoint: field_str(&v, "endpoint"),
            bucket: field_str(&v, "bucket"),
            region: v.get("region").and_then(|x| x.as_str()).unwrap_or("us-east-1").to_string(),
            access_key_id: field_str(&v, "accessKeyId"),
            secret_access_key: field_str(&v, "secretAccessKey"),
            cache_prefix: v.get("cachePrefix").and_then(|x| x.as_str()).unwrap_or("cache/").to_string(),
        }),
        "RESUME_INFO" => Some(InboundMessage::ResumeInfo {
            secured_frames: v
                .get("securedFrames")
                .and_then(|x| x.as_array())
                .map(|a| a.iter().filter_map(|e| e.as_u64()).collect())
                .unwrap_or_default(),
            total_frames: v.get("totalFrames").and_then(|x| x.as_u64()).unwrap_or(0),
            cache_batches: v
                .get("cacheBatches")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default(),
            zstd_dictionary_key: v
                .get("zstdDictionaryKey")
                .and_then(|x| x.as_str())
                .map(|s| s.to_string()),
        }),
        "BLEND_FILE_URL" => Some(InboundMessage::BlendFileUrl { url: field_str(&v, "url") }),
        "TERMINATE" => Some(InboundMessage::Terminate {
            reason: v.get("reason").and_then(|x| x.as_str()).unwrap_or("").to_string(),
        }),
        _ => None,
    })
}

fn field_str(v: &serde_json::Value, key: &str) -> String {
    v.get(key).and_then(|x| x.as_str()).unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_s3_credentials() {
        let text = r#"{"type":"S3_CREDENTIALS","endpoint":"https://x","bucket":"b","accessKeyId":"ak","secretAccessKey":"sk","cachePrefix":"cache/"}"#;
        let msg = parse_inbound(text).unwrap().unwrap();
        match msg {
            InboundMessage::S3Credentials { endpoint, bucket, .. } => {
                assert_eq!(endpoint, "https://x");
                assert_eq!(bucket, "b");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_resume_info_with_batches() {
        let text = r#"{"type":"RESUME_INFO","securedFrames":[1,2,3],"totalFrames":9,"cacheBatches":[{"key":"cache/batch_0001.tar.zst"}],"zstdDictionaryKey":"cache/dictionary.zstd"}"#;
        let msg = parse_inbound(text).unwrap().unwrap();
        match msg {
            InboundMessage::ResumeInfo { secured_frames, cache_batches, zstd_dictionary_key, .. } => {
                assert_eq!(secured_frames, vec![1, 2, 3]);
                assert_eq!(cache_batches.len(), 1);
                assert_eq!(zstd_dictionary_key.as_deref(), Some("cache/dictionary.zstd"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_message_types_are_ignored() {
        let text = r#"{"type":"SOMETHING_ELSE"}"#;
        assert!(parse_inbound(text).unwrap().is_none());
    }

    #[test]
    fn disconnected_handle_drops_outbound_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ControlChannelHandle {
            tx,
            connected: Arc::new(AtomicBool::new(false)),
            server_time_delta_ms: Arc::new(AtomicI64::new(0)),
        };
        handle.notify_baked(1, 10);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn connected_handle_forwards_outbound_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ControlChannelHandle {
            tx,
            connected: Arc::new(AtomicBool::new(true)),
            server_time_delta_ms: Arc::new(AtomicI64::new(0)),
        };
        handle.notify_baked(1, 10);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn auth_success_computes_server_time_delta() {
        let now = now_millis();
        let text = format!(
            r#"{{"type":"AUTH_SUCCESS","token":"abcdefghijk","serverTime":{},"protocolVersion":2}}"#,
            now + 5_000
        );
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        let server_time = parsed.get("serverTime").and_then(|v| v.as_i64()).unwrap_or(0);
        assert!(server_time - now_millis() >= 4_900);
    }
}
