//! Capture device boundary.
//!
//! The pipeline does not drive the camera: resolution, exposure, and codec
//! settings belong to the device. What it consumes is (a) the frame ring
//! the device's producer fills, and (b) a way to grab a still image. This
//! module defines that boundary and a synthetic device that stands in for
//! real hardware in the daemon's `stub://` mode and in tests.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::buffer::FrameIndexedBuffer;

/// Still-capture operation offered by the device.
pub trait CaptureDevice: Send {
    fn capture_still(&mut self) -> Result<Vec<u8>>;
}

#[derive(Clone, Debug)]
pub struct SyntheticCameraConfig {
    pub fps: u32,
    /// Encoded size of each synthetic frame.
    pub frame_bytes: usize,
    /// Every nth frame is a sync point (a real encoder's keyframe cadence).
    pub sync_interval: u64,
}

impl Default for SyntheticCameraConfig {
    fn default() -> Self {
        Self {
            fps: 10,
            frame_bytes: 4 * 1024,
            sync_interval: 10,
        }
    }
}

/// Synthetic capture device: a producer thread that appends deterministic
/// frames into the ring at the configured rate, playing the role the
/// hardware encoder plays in production.
pub struct SyntheticCamera {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SyntheticCamera {
    pub fn start(buffer: Arc<FrameIndexedBuffer>, config: SyntheticCameraConfig) -> Result<Self> {
        if config.fps == 0 {
            return Err(anyhow!("synthetic camera fps must be > 0"));
        }
        if config.frame_bytes == 0 {
            return Err(anyhow!("synthetic camera frame size must be > 0"));
        }
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let join = std::thread::spawn(move || {
            run_producer(buffer, config, &thread_stop);
        });
        Ok(Self {
            stop,
            join: Some(join),
        })
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("synthetic camera thread panicked");
            }
        }
    }
}

impl Drop for SyntheticCamera {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Still-capture half of the synthetic device. Cheap to hand to the
/// orchestrator while the producer handle stays with its owner.
#[derive(Clone, Copy, Default)]
pub struct SyntheticStillCapture;

impl SyntheticCamera {
    pub fn still_capture(&self) -> SyntheticStillCapture {
        SyntheticStillCapture
    }
}

impl CaptureDevice for SyntheticStillCapture {
    fn capture_still(&mut self) -> Result<Vec<u8>> {
        Ok(synthetic_jpeg())
    }
}

fn run_producer(buffer: Arc<FrameIndexedBuffer>, config: SyntheticCameraConfig, stop: &AtomicBool) {
    let interval = Duration::from_millis((1000 / config.fps).max(1) as u64);
    let mut frame_count = 0u64;
    while !stop.load(Ordering::SeqCst) {
        let payload = synthetic_frame(frame_count, config.frame_bytes);
        let is_sync = frame_count % config.sync_interval.max(1) == 0;
        let timestamp = crate::now_micros().unwrap_or(0);
        if let Err(err) = buffer.append_frame(&payload, timestamp, is_sync) {
            log::error!("synthetic camera failed to append frame: {err}");
            return;
        }
        frame_count += 1;
        std::thread::sleep(interval);
    }
    log::debug!("synthetic camera stopped after {} frames", frame_count);
}

fn synthetic_frame(index: u64, frame_bytes: usize) -> Vec<u8> {
    // Byte pattern keyed by the frame index, so tests can tell frames
    // apart in the delivered stream.
    (0..frame_bytes)
        .map(|i| (index as usize).wrapping_add(i) as u8)
        .collect()
}

fn synthetic_jpeg() -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8];
    bytes.extend_from_slice(b"synthetic still frame");
    bytes.extend_from_slice(&[0xFF, 0xD9]);
    bytes
}
