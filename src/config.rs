use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CAMERA_NAME: &str = "vigil";
const DEFAULT_RECORDINGS_ROOT: &str = "recordings";
const DEFAULT_DAY_FORMAT: &str = "%Y-%m-%d";
const DEFAULT_TIME_FORMAT: &str = "%H.%M.%S";
const DEFAULT_CONTAINER: &str = "h264";
const DEFAULT_PREROLL_SECS: u64 = 8;
const DEFAULT_QUIET_PERIOD_SECS: u64 = 8;
const DEFAULT_MAX_EVENT_SECS: u64 = 600;
const DEFAULT_WARMUP_SECS: u64 = 3;
const DEFAULT_RETENTION_SECS: u64 = 60 * 60 * 24 * 7;
const DEFAULT_BUFFER_CAPACITY_BYTES: usize = 32 * 1024 * 1024;
const DEFAULT_BULK_READ_THRESHOLD: u64 = 1_000_000;
const DEFAULT_TICK_MS: u64 = 100;
const DEFAULT_MOTION_POLL_MS: u64 = 1_000;
const DEFAULT_IDLE_READ_MS: u64 = 500;
const DEFAULT_BUSY_READ_MS: u64 = 200;
const DEFAULT_REMOTE_CHUNK_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_REMOTE_WORKERS: usize = 2;
const DEFAULT_REMOTE_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_REMOTE_RETRY_BACKOFF_MS: u64 = 500;
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct VigilConfigFile {
    camera_name: Option<String>,
    recordings_root: Option<PathBuf>,
    day_format: Option<String>,
    time_format: Option<String>,
    container: Option<String>,
    preroll_secs: Option<u64>,
    quiet_period_secs: Option<u64>,
    max_event_secs: Option<u64>,
    warmup_secs: Option<u64>,
    retention_secs: Option<u64>,
    buffer: Option<BufferConfigFile>,
    intervals: Option<IntervalsConfigFile>,
    remote: Option<RemoteConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct BufferConfigFile {
    capacity_bytes: Option<usize>,
    bulk_read_threshold: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct IntervalsConfigFile {
    tick_ms: Option<u64>,
    motion_poll_ms: Option<u64>,
    idle_read_ms: Option<u64>,
    busy_read_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RemoteConfigFile {
    url: Option<String>,
    token: Option<String>,
    chunk_size_bytes: Option<usize>,
    workers: Option<usize>,
    max_file_chunks: Option<u64>,
    retry_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
    timeout_secs: Option<u64>,
    public_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct VigilConfig {
    pub camera_name: String,
    pub recordings_root: PathBuf,
    /// Directory-name format for recording days (e.g. `%Y-%m-%d`).
    pub day_format: String,
    /// Directory-name format for recording times (e.g. `%H.%M.%S`).
    pub time_format: String,
    /// Extension of the saved video artifact.
    pub container: String,
    pub preroll: Duration,
    pub quiet_period: Duration,
    pub max_event_duration: Duration,
    pub warmup: Duration,
    pub retention: Duration,
    pub buffer: BufferSettings,
    pub intervals: IntervalSettings,
    /// Remote destination; `None` records to disk only.
    pub remote: Option<RemoteSettings>,
}

#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub capacity_bytes: usize,
    /// Reads estimated above this size snapshot the whole ring instead of
    /// copying a targeted range, to bound lock-hold time.
    pub bulk_read_threshold: u64,
}

#[derive(Debug, Clone)]
pub struct IntervalSettings {
    /// Orchestrator polling tick.
    pub tick: Duration,
    /// Minimum spacing between trigger polls while a window is open.
    pub motion_poll: Duration,
    /// Session sleep after an empty read.
    pub idle_read: Duration,
    /// Session sleep after a read that found data.
    pub busy_read: Duration,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub url: String,
    pub token: String,
    pub chunk_size: usize,
    pub workers: usize,
    pub max_file_chunks: Option<u64>,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub timeout: Duration,
    /// When set, video uploads are encrypted against this public key.
    pub public_key_path: Option<PathBuf>,
}

impl VigilConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VIGIL_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: VigilConfigFile) -> Self {
        let buffer = file.buffer.unwrap_or_default();
        let intervals = file.intervals.unwrap_or_default();
        Self {
            camera_name: file
                .camera_name
                .unwrap_or_else(|| DEFAULT_CAMERA_NAME.to_string()),
            recordings_root: file
                .recordings_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORDINGS_ROOT)),
            day_format: file
                .day_format
                .unwrap_or_else(|| DEFAULT_DAY_FORMAT.to_string()),
            time_format: file
                .time_format
                .unwrap_or_else(|| DEFAULT_TIME_FORMAT.to_string()),
            container: file
                .container
                .unwrap_or_else(|| DEFAULT_CONTAINER.to_string()),
            preroll: Duration::from_secs(file.preroll_secs.unwrap_or(DEFAULT_PREROLL_SECS)),
            quiet_period: Duration::from_secs(
                file.quiet_period_secs.unwrap_or(DEFAULT_QUIET_PERIOD_SECS),
            ),
            max_event_duration: Duration::from_secs(
                file.max_event_secs.unwrap_or(DEFAULT_MAX_EVENT_SECS),
            ),
            warmup: Duration::from_secs(file.warmup_secs.unwrap_or(DEFAULT_WARMUP_SECS)),
            retention: Duration::from_secs(file.retention_secs.unwrap_or(DEFAULT_RETENTION_SECS)),
            buffer: BufferSettings {
                capacity_bytes: buffer
                    .capacity_bytes
                    .unwrap_or(DEFAULT_BUFFER_CAPACITY_BYTES),
                bulk_read_threshold: buffer
                    .bulk_read_threshold
                    .unwrap_or(DEFAULT_BULK_READ_THRESHOLD),
            },
            intervals: IntervalSettings {
                tick: Duration::from_millis(intervals.tick_ms.unwrap_or(DEFAULT_TICK_MS)),
                motion_poll: Duration::from_millis(
                    intervals.motion_poll_ms.unwrap_or(DEFAULT_MOTION_POLL_MS),
                ),
                idle_read: Duration::from_millis(
                    intervals.idle_read_ms.unwrap_or(DEFAULT_IDLE_READ_MS),
                ),
                busy_read: Duration::from_millis(
                    intervals.busy_read_ms.unwrap_or(DEFAULT_BUSY_READ_MS),
                ),
            },
            remote: file.remote.and_then(|remote| {
                let url = remote.url?;
                Some(RemoteSettings {
                    url,
                    token: remote.token.unwrap_or_default(),
                    chunk_size: remote
                        .chunk_size_bytes
                        .unwrap_or(DEFAULT_REMOTE_CHUNK_BYTES),
                    workers: remote.workers.unwrap_or(DEFAULT_REMOTE_WORKERS),
                    max_file_chunks: remote.max_file_chunks,
                    retry_attempts: remote
                        .retry_attempts
                        .unwrap_or(DEFAULT_REMOTE_RETRY_ATTEMPTS),
                    retry_backoff: Duration::from_millis(
                        remote
                            .retry_backoff_ms
                            .unwrap_or(DEFAULT_REMOTE_RETRY_BACKOFF_MS),
                    ),
                    timeout: Duration::from_secs(
                        remote.timeout_secs.unwrap_or(DEFAULT_REMOTE_TIMEOUT_SECS),
                    ),
                    public_key_path: remote.public_key_path,
                })
            }),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(name) = std::env::var("VIGIL_CAMERA_NAME") {
            if !name.trim().is_empty() {
                self.camera_name = name;
            }
        }
        if let Ok(root) = std::env::var("VIGIL_RECORDINGS_ROOT") {
            if !root.trim().is_empty() {
                self.recordings_root = PathBuf::from(root);
            }
        }
        if let Ok(url) = std::env::var("VIGIL_REMOTE_URL") {
            if !url.trim().is_empty() {
                match self.remote.as_mut() {
                    Some(remote) => remote.url = url,
                    None => self.remote = Some(RemoteSettings::with_defaults(url)),
                }
            }
        }
        if let Ok(token) = std::env::var("VIGIL_REMOTE_TOKEN") {
            if let Some(remote) = self.remote.as_mut() {
                remote.token = token;
            }
        }
        if let Ok(retention) = std::env::var("VIGIL_RETENTION_SECS") {
            let seconds: u64 = retention.parse().map_err(|_| {
                anyhow!("VIGIL_RETENTION_SECS must be an integer number of seconds")
            })?;
            self.retention = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        crate::validate_camera_name(&self.camera_name)?;
        self.camera_name = self.camera_name.to_lowercase();

        if self.day_format.trim().is_empty() || self.time_format.trim().is_empty() {
            return Err(anyhow!("day/time directory formats must not be empty"));
        }
        if self.container.trim().is_empty() {
            return Err(anyhow!("video container extension must not be empty"));
        }
        if self.quiet_period.is_zero() {
            return Err(anyhow!("quiet period must be greater than zero"));
        }
        if self.max_event_duration.is_zero() {
            return Err(anyhow!("max event duration must be greater than zero"));
        }
        if self.retention.is_zero() {
            return Err(anyhow!("retention must be greater than zero"));
        }
        if self.buffer.capacity_bytes == 0 {
            return Err(anyhow!("frame buffer capacity must be greater than zero"));
        }
        if let Some(remote) = &self.remote {
            if remote.chunk_size == 0 {
                return Err(anyhow!("remote chunk size must be greater than zero"));
            }
            if remote.workers == 0 {
                return Err(anyhow!("remote writer needs at least one worker"));
            }
            if remote.retry_attempts == 0 {
                return Err(anyhow!("remote retry attempts must be greater than zero"));
            }
            if remote.max_file_chunks == Some(0) {
                return Err(anyhow!("remote max file chunks must be greater than zero"));
            }
        }
        Ok(())
    }
}

impl RemoteSettings {
    fn with_defaults(url: String) -> Self {
        Self {
            url,
            token: String::new(),
            chunk_size: DEFAULT_REMOTE_CHUNK_BYTES,
            workers: DEFAULT_REMOTE_WORKERS,
            max_file_chunks: None,
            retry_attempts: DEFAULT_REMOTE_RETRY_ATTEMPTS,
            retry_backoff: Duration::from_millis(DEFAULT_REMOTE_RETRY_BACKOFF_MS),
            timeout: Duration::from_secs(DEFAULT_REMOTE_TIMEOUT_SECS),
            public_key_path: None,
        }
    }
}

fn read_config_file(path: &Path) -> Result<VigilConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
