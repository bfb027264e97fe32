//! Vigil - unattended motion-triggered recorder.
//!
//! A live video source is continuously buffered in memory; when a trigger
//! fires, the buffered video (plus a still frame) is delivered durably,
//! exactly once and without loss, to one or more independent destinations
//! while the source keeps recording uninterrupted.
//!
//! # Delivery guarantees
//!
//! 1. **No loss, no duplication**: a durable sink receives every byte of
//!    its stream, in order, exactly once, then exactly one final append.
//! 2. **Sequential chunks**: one remote logical file's chunks reach the
//!    store in sequence; parallel uploads exist only across files.
//! 3. **Containment**: a failing session, worker, or destination never
//!    takes down its siblings, the orchestrator, or the process.
//! 4. **The ring outlives its readers**: sessions never close or truncate
//!    the capture buffer, and concurrent readers do not interfere.
//!
//! # Module structure
//!
//! - `buffer`: frame-indexed circular buffer and read cursors
//! - `session`: stream sessions draining a source into sinks
//! - `writer`: sink trait, disk sink, transient live-view sink
//! - `remote`: chunked-upload store, uploader workers, encryption envelope
//! - `orchestrator`: the recording state machine
//! - `capture` / `trigger`: external device boundaries
//! - `storage`: recordings directory layout and retention
//! - `config`: JSON config with env overrides

use anyhow::{anyhow, Result};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod buffer;
pub mod capture;
pub mod config;
pub mod orchestrator;
pub mod remote;
pub mod session;
pub mod storage;
pub mod trigger;
pub mod writer;

pub use buffer::{compute_start_cursor, FrameIndexedBuffer, FrameRecord, ReadCursor};
pub use capture::{CaptureDevice, SyntheticCamera, SyntheticCameraConfig, SyntheticStillCapture};
pub use config::{RemoteSettings, VigilConfig};
pub use orchestrator::{
    Destination, MonitorControl, OrchestratorHandle, RecordingOrchestrator, RecordingWindow,
};
pub use remote::crypto::{
    generate_keypair, FileDecryptor, FileEncryptor, RecipientPublicKey, RecipientSecretKey,
};
pub use remote::uploader::{ChunkedRemoteWriter, RemoteWriterConfig};
pub use remote::{open_store, HttpRemoteStore, MemoryRemoteStore, RemoteStore, RemoteStoreError};
pub use session::{ByteSource, FiniteSource, LiveSource, SessionOptions, StreamSession};
pub use storage::RecordingKey;
pub use trigger::{SharedTrigger, SharedTriggerHandle, StubTrigger, TriggerSample, TriggerSource};
pub use writer::{ByteSink, DiskSink, Durability, LatestCell, LatestSink};

/// Microseconds since the Unix epoch; the timestamp unit used for frame
/// metadata throughout the pipeline.
pub fn now_micros() -> Result<u64> {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH)?;
    Ok(elapsed.as_micros() as u64)
}

/// Camera names become path components on disk and in the remote store, so
/// they are restricted to a positive allowlist.
///
/// Allowed: "porch", "front_door", "cam-2". Disallowed: anything with
/// whitespace, slashes, or punctuation outside `[_-]`.
pub fn validate_camera_name(name: &str) -> Result<()> {
    // Compile once for hot paths.
    static CAMERA_NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re =
        CAMERA_NAME_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").unwrap());

    let name = name.to_lowercase();
    if !re.is_match(&name) {
        return Err(anyhow!(
            "camera name must match ^[a-z0-9][a-z0-9_-]{{0,63}}$"
        ));
    }
    Ok(())
}
