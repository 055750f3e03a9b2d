// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{PipelineError, PipelineResult};

/// Runtime configuration for the worker.
///
/// Built once at startup from environment variables and the handful of CLI
/// overrides in [`CliArgs`], then passed by value to every component that needs
/// it. There is no process-wide mutable configuration singleton (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct Config {
    pub ws_url: String,
    pub vm_password: String,

    pub cache_dir: PathBuf,
    pub work_dir: PathBuf,
    pub dict_file: PathBuf,
    pub blend_file: PathBuf,

    pub heartbeat_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,

    pub target_upload_time: Duration,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub default_batch_size: usize,
    pub batch_interval: Duration,

    pub zstd_level: i32,
    pub zstd_dict_size: usize,
    pub zstd_min_training_samples: usize,

    pub progress_report_interval: Duration,

    /// Exit with code 1 rather than 2 on partial success (see §7 exit codes).
    pub strict: bool,
}

#[derive(Debug, Parser)]
#[command(name = "cache-streamer", about = "Streams a simulation cache to object storage")]
pub struct CliArgs {
    /// Override the cache directory the Watcher observes.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Override the working directory for spill files and the trained dictionary.
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Treat partial success (some frames unsecured at shutdown) as a hard failure.
    #[arg(long)]
    pub strict: bool,
}

fn env_duration_secs(name: &str, default: f64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(default);
    Duration::from_secs_f64(secs.max(0.0))
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(default)
}

impl Config {
    /// Reads configuration from the environment, applying CLI overrides on top.
    /// Mirrors `examples/original_source/programs/config.py`'s `Config` class.
    pub fn from_env(args: CliArgs) -> PipelineResult<Self> {
        let ws_url =
            std::env::var("WS_URL").unwrap_or_else(|_| "wss://your-worker.pages.dev/ws/vm".into());
        let vm_password = std::env::var("VM_PASSWORD")
            .map_err(|_| PipelineError::Config("VM_PASSWORD is not set".into()))?;

        let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let work_dir = args
            .work_dir
            .or_else(|| std::env::var("WORK_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| base_dir.join("work"));
        let cache_dir = args
            .cache_dir
            .or_else(|| std::env::var("CACHE_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| work_dir.join("cache"));
        let dict_file = work_dir.join("zstd_dictionary.dict");
        let blend_file = work_dir.join("current.blend");

        let cpu_budget = std::env::var("BAKE_THREADS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
                    .saturating_sub(2)
                    .max(1)
            });
        let _ = cpu_budget; // consumed only by the out-of-scope engine-configuration auxiliary.

        Ok(Config {
            ws_url,
            vm_password,
            cache_dir,
            work_dir,
            dict_file,
            blend_file,
            heartbeat_interval: env_duration_secs("HEARTBEAT_INTERVAL", 3.0),
            max_reconnect_attempts: env_usize("MAX_RECONNECT_ATTEMPTS", 10) as u32,
            reconnect_delay: env_duration_secs("RECONNECT_DELAY", 5.0),
            target_upload_time: env_duration_secs("TARGET_UPLOAD_TIME", 20.0),
            min_batch_size: env_usize("MIN_BATCH_SIZE", 5),
            max_batch_size: env_usize("MAX_BATCH_SIZE", 50),
            default_batch_size: env_usize("DEFAULT_BATCH_SIZE", 10),
            batch_interval: env_duration_secs("BATCH_INTERVAL", 2.0),
            zstd_level: env_usize("ZSTD_LEVEL", 3) as i32,
            zstd_dict_size: env_usize("ZSTD_DICT_SIZE", 256 * 1024),
            zstd_min_training_samples: env_usize("ZSTD_MIN_TRAINING_SAMPLES", 10),
            progress_report_interval: env_duration_secs("PROGRESS_REPORT_INTERVAL", 2.0),
            strict: args.strict,
        })
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.work_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::create_dir_all(self.work_dir.join("batches"))?;
        Ok(())
    }

    pub fn spill_dir(&self) -> PathBuf {
        self.work_dir.join("batches")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_password_is_config_error() {
        std::env::remove_var("VM_PASSWORD");
        let args = CliArgs {
            cache_dir: None,
            work_dir: None,
            strict: false,
        };
        let err = Config::from_env(args).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn defaults_match_spec() {
        std::env::set_var("VM_PASSWORD", "secret");
        for var in [
            "TARGET_UPLOAD_TIME",
            "MIN_BATCH_SIZE",
            "MAX_BATCH_SIZE",
            "DEFAULT_BATCH_SIZE",
            "ZSTD_MIN_TRAINING_SAMPLES",
        ] {
            std::env::remove_var(var);
        }
        let args = CliArgs {
            cache_dir: None,
            work_dir: None,
            strict: false,
        };
        let cfg = Config::from_env(args).unwrap();
        assert_eq!(cfg.min_batch_size, 5);
        assert_eq!(cfg.max_batch_size, 50);
        assert_eq!(cfg.default_batch_size, 10);
        assert_eq!(cfg.zstd_min_training_samples, 10);
        assert_eq!(cfg.target_upload_time, Duration::from_secs(20));
        std::env::remove_var("VM_PASSWORD");
    }
}
