//! Recording orchestrator: the state machine that turns trigger signals
//! into recording windows.
//!
//! States: `Idle` (not watching) -> `Armed` (watching, no active window)
//! -> `Triggered` (a recording window is open) -> back to `Armed`.
//! Arming waits out a warm-up period and re-baselines the trigger before
//! any signal is trusted. While a window is open, further trigger activity
//! extends the window; a second window is never opened alongside it. The
//! window closes on the quiet-period timeout or the max-event deadline,
//! whichever comes first, and every session the window started is stopped
//! and joined before a new trigger is accepted.
//!
//! Any error inside one cycle is logged and the loop continues from the
//! top; recording resources are released on the error path as well.

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::buffer::{compute_start_cursor, FrameIndexedBuffer};
use crate::capture::CaptureDevice;
use crate::config::{IntervalSettings, RemoteSettings};
use crate::remote::crypto::RecipientPublicKey;
use crate::remote::uploader::{ChunkedRemoteWriter, RemoteWriterConfig};
use crate::remote::RemoteStore;
use crate::session::{ByteSource, FiniteSource, LiveSource, SessionOptions, StreamSession};
use crate::storage::RecordingKey;
use crate::trigger::{TriggerSample, TriggerSource};
use crate::writer::{ByteSink, DiskSink};

/// Shared switches flipped by the operator's command surface. Monitoring
/// can be enabled or disabled at any time; a record request opens a window
/// (or extends the current one) without waiting for motion.
#[derive(Clone)]
pub struct MonitorControl {
    should_monitor: Arc<AtomicBool>,
    should_record: Arc<AtomicBool>,
}

impl MonitorControl {
    pub fn new(monitoring: bool) -> Self {
        Self {
            should_monitor: Arc::new(AtomicBool::new(monitoring)),
            should_record: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_monitoring(&self, enabled: bool) {
        self.should_monitor.store(enabled, Ordering::SeqCst);
    }

    pub fn monitoring(&self) -> bool {
        self.should_monitor.load(Ordering::SeqCst)
    }

    pub fn request_recording(&self) {
        self.should_record.store(true, Ordering::SeqCst);
    }

    fn take_record_request(&self) -> bool {
        self.should_record.swap(false, Ordering::SeqCst)
    }
}

impl Default for MonitorControl {
    fn default() -> Self {
        Self::new(false)
    }
}

/// One registered destination for recordings. Each recording fans out to
/// every destination independently; a destination that fails to set up
/// does not stop its siblings.
pub enum Destination {
    Disk {
        root: PathBuf,
    },
    Remote {
        store: Arc<dyn RemoteStore>,
        settings: RemoteSettings,
        recipient: Option<RecipientPublicKey>,
    },
}

impl Destination {
    fn describe(&self) -> String {
        match self {
            Destination::Disk { root } => format!("disk:{}", root.display()),
            Destination::Remote { settings, .. } => format!("remote:{}", settings.url),
        }
    }

    /// Build the sink for one artifact of one recording. Video artifacts
    /// get the remote destination's encryption and file splitting; still
    /// frames upload plain and unsplit.
    fn create_sink(
        &self,
        camera_name: &str,
        key: &RecordingKey,
        artifact: &str,
        video: bool,
    ) -> Result<Box<dyn ByteSink>> {
        match self {
            Destination::Disk { root } => {
                let sink = DiskSink::create(&key.artifact_path(root, artifact))?;
                Ok(Box::new(sink))
            }
            Destination::Remote {
                store,
                settings,
                recipient,
            } => {
                let config = RemoteWriterConfig {
                    chunk_size: settings.chunk_size,
                    workers: settings.workers,
                    max_file_chunks: if video { settings.max_file_chunks } else { None },
                    retry_attempts: settings.retry_attempts,
                    retry_backoff: settings.retry_backoff,
                };
                let writer = ChunkedRemoteWriter::new(
                    store.clone(),
                    &key.remote_artifact_path(camera_name, artifact),
                    if video { recipient.clone() } else { None },
                    config,
                )?;
                Ok(Box::new(writer))
            }
        }
    }
}

/// Active recording window. Owned exclusively by the orchestrator;
/// `refresh` only ever moves `last_activity` forward.
#[derive(Clone, Copy, Debug)]
pub struct RecordingWindow {
    opened_at: Instant,
    last_activity: Instant,
    quiet_period: Duration,
    max_duration: Duration,
}

impl RecordingWindow {
    pub fn open(quiet_period: Duration, max_duration: Duration) -> Self {
        let now = Instant::now();
        Self {
            opened_at: now,
            last_activity: now,
            quiet_period,
            max_duration,
        }
    }

    /// Extend the window: activity was observed.
    pub fn refresh(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Open until the quiet period elapses without activity or the event
    /// hits its maximum duration, whichever comes first.
    pub fn is_open(&self) -> bool {
        self.last_activity.elapsed() <= self.quiet_period
            && self.opened_at.elapsed() <= self.max_duration
    }

    pub fn elapsed(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

#[derive(Debug)]
enum MonitorState {
    Idle,
    Armed,
    /// A trigger fired; carries the sample that opened the window.
    Triggered(TriggerSample),
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub camera_name: String,
    pub day_format: String,
    pub time_format: String,
    /// Video artifact extension.
    pub container: String,
    pub preroll: Duration,
    pub quiet_period: Duration,
    pub max_event_duration: Duration,
    pub warmup: Duration,
    pub intervals: IntervalSettings,
    pub bulk_read_threshold: u64,
}

pub struct RecordingOrchestrator {
    config: OrchestratorConfig,
    buffer: Arc<FrameIndexedBuffer>,
    camera: Box<dyn CaptureDevice>,
    trigger: Box<dyn TriggerSource>,
    destinations: Vec<Destination>,
    control: MonitorControl,
}

/// Handle for the orchestrator's polling thread.
pub struct OrchestratorHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl OrchestratorHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("orchestrator thread panicked"))?;
        }
        Ok(())
    }
}

impl RecordingOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        buffer: Arc<FrameIndexedBuffer>,
        camera: Box<dyn CaptureDevice>,
        trigger: Box<dyn TriggerSource>,
        destinations: Vec<Destination>,
        control: MonitorControl,
    ) -> Result<Self> {
        crate::validate_camera_name(&config.camera_name)?;
        if destinations.is_empty() {
            return Err(anyhow!("orchestrator needs at least one destination"));
        }
        Ok(Self {
            config,
            buffer,
            camera,
            trigger,
            destinations,
            control,
        })
    }

    /// Start the polling loop on its own thread.
    pub fn spawn(mut self) -> OrchestratorHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();
        let join = std::thread::spawn(move || {
            self.run(&thread_shutdown);
        });
        OrchestratorHandle {
            shutdown,
            join: Some(join),
        }
    }

    fn run(&mut self, shutdown: &AtomicBool) {
        log::info!(
            "monitor loop starting for camera {} ({} destinations)",
            self.config.camera_name,
            self.destinations.len()
        );
        let mut state = MonitorState::Idle;
        while !shutdown.load(Ordering::SeqCst) {
            state = self.step(state, shutdown);
        }
        log::info!("monitor loop stopped");
    }

    fn step(&mut self, state: MonitorState, shutdown: &AtomicBool) -> MonitorState {
        match state {
            MonitorState::Idle => {
                if self.control.monitoring() {
                    self.warm_up(shutdown);
                    self.trigger.rearm();
                    log::info!("monitoring armed");
                    MonitorState::Armed
                } else {
                    std::thread::sleep(self.config.intervals.tick);
                    MonitorState::Idle
                }
            }
            MonitorState::Armed => {
                if !self.control.monitoring() {
                    log::info!("monitoring disabled");
                    return MonitorState::Idle;
                }
                std::thread::sleep(self.config.intervals.tick);
                let record_requested = self.control.take_record_request();
                let sample = match self.trigger.poll() {
                    Ok(sample) => sample,
                    Err(err) => {
                        log::warn!("trigger poll failed: {err:#}");
                        TriggerSample::default()
                    }
                };
                if sample.motion || record_requested {
                    MonitorState::Triggered(sample)
                } else {
                    MonitorState::Armed
                }
            }
            MonitorState::Triggered(sample) => {
                if let Err(err) = self.run_recording_window(sample, shutdown) {
                    log::error!("recording cycle failed, continuing to monitor: {err:#}");
                }
                MonitorState::Armed
            }
        }
    }

    fn warm_up(&self, shutdown: &AtomicBool) {
        // Give the external detector time to establish its baseline before
        // any trigger signal is trusted.
        let deadline = Instant::now() + self.config.warmup;
        while Instant::now() < deadline && !shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(self.config.intervals.tick);
        }
    }

    /// Open a window, fan out the still and video sessions, hold the
    /// window until it closes, then stop and join everything that was
    /// started. Cleanup runs on the error path too.
    fn run_recording_window(
        &mut self,
        first_sample: TriggerSample,
        shutdown: &AtomicBool,
    ) -> Result<()> {
        let key = RecordingKey::from_timestamp(
            Local::now(),
            &self.config.day_format,
            &self.config.time_format,
        );
        log::info!("recording triggered: {}/{}", key.day, key.time);

        let mut sessions: Vec<StreamSession> = Vec::new();
        let result = self.drive_window(&key, first_sample, &mut sessions, shutdown);

        for session in &sessions {
            session.stop();
        }
        for session in sessions.drain(..) {
            session.join();
        }
        // A record request that arrived mid-window is satisfied by this
        // window, not a new one.
        let _ = self.control.take_record_request();

        match &result {
            Ok(()) => log::info!("recording window {}/{} closed", key.day, key.time),
            Err(_) => log::warn!("recording window {}/{} abandoned", key.day, key.time),
        }
        result
    }

    fn drive_window(
        &mut self,
        key: &RecordingKey,
        first_sample: TriggerSample,
        sessions: &mut Vec<StreamSession>,
        shutdown: &AtomicBool,
    ) -> Result<()> {
        let still = match first_sample.still {
            Some(bytes) => bytes,
            None => self
                .camera
                .capture_still()
                .context("capture trigger still")?,
        };

        let jpeg_sinks = self.create_sinks(key, "trigger.jpg", false);
        if !jpeg_sinks.is_empty() {
            sessions.push(StreamSession::spawn(
                &format!("{}/{}/trigger.jpg", key.day, key.time),
                ByteSource::Finite(FiniteSource::new(still)),
                jpeg_sinks,
                self.session_options(true),
            ));
        }

        let video_artifact = format!("video.{}", self.config.container);
        let video_sinks = self.create_sinks(key, &video_artifact, true);
        if !video_sinks.is_empty() {
            let start_time = crate::now_micros()?
                .saturating_sub(self.config.preroll.as_micros() as u64);
            let cursor = {
                let view = self.buffer.locked_view()?;
                compute_start_cursor(&view, start_time)
            };
            sessions.push(StreamSession::spawn(
                &format!("{}/{}/{}", key.day, key.time, video_artifact),
                ByteSource::Live(LiveSource::new(
                    self.buffer.clone(),
                    cursor,
                    self.config.bulk_read_threshold,
                )),
                video_sinks,
                self.session_options(false),
            ));
        }
        if sessions.is_empty() {
            return Err(anyhow!("no destination accepted this recording"));
        }

        let mut window =
            RecordingWindow::open(self.config.quiet_period, self.config.max_event_duration);
        let mut last_poll: Option<Instant> = None;
        while !shutdown.load(Ordering::SeqCst) && self.control.monitoring() && window.is_open() {
            std::thread::sleep(self.config.intervals.tick);
            let due = last_poll.map_or(true, |at| at.elapsed() >= self.config.intervals.motion_poll);
            if !due {
                continue;
            }
            last_poll = Some(Instant::now());
            if self.control.take_record_request() {
                window.refresh();
            }
            match self.trigger.poll() {
                Ok(sample) if sample.motion => {
                    log::debug!("more activity; extending window");
                    window.refresh();
                }
                Ok(_) => {}
                Err(err) => log::warn!("trigger poll failed during window: {err:#}"),
            }
        }
        log::info!(
            "recording window held for {:.1}s",
            window.elapsed().as_secs_f32()
        );
        Ok(())
    }

    fn session_options(&self, stop_when_empty: bool) -> SessionOptions {
        SessionOptions {
            stop_when_empty,
            idle_interval: self.config.intervals.idle_read,
            busy_interval: self.config.intervals.busy_read,
        }
    }

    fn create_sinks(
        &self,
        key: &RecordingKey,
        artifact: &str,
        video: bool,
    ) -> Vec<Box<dyn ByteSink>> {
        let mut sinks = Vec::new();
        for destination in &self.destinations {
            match destination.create_sink(&self.config.camera_name, key, artifact, video) {
                Ok(sink) => sinks.push(sink),
                Err(err) => log::error!(
                    "destination {} unavailable for {}: {:#}",
                    destination.describe(),
                    artifact,
                    err
                ),
            }
        }
        sinks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_closes_after_quiet_period() {
        let window = RecordingWindow::open(Duration::from_millis(40), Duration::from_secs(10));
        assert!(window.is_open());
        std::thread::sleep(Duration::from_millis(70));
        assert!(!window.is_open());
    }

    #[test]
    fn refresh_extends_the_window() {
        let mut window = RecordingWindow::open(Duration::from_millis(60), Duration::from_secs(10));
        std::thread::sleep(Duration::from_millis(40));
        window.refresh();
        std::thread::sleep(Duration::from_millis(40));
        assert!(window.is_open());
    }

    #[test]
    fn max_duration_closes_the_window_despite_activity() {
        let mut window =
            RecordingWindow::open(Duration::from_secs(10), Duration::from_millis(50));
        for _ in 0..8 {
            std::thread::sleep(Duration::from_millis(10));
            window.refresh();
        }
        assert!(!window.is_open());
    }

    #[test]
    fn record_requests_are_consumed_once() {
        let control = MonitorControl::new(true);
        control.request_recording();
        assert!(control.take_record_request());
        assert!(!control.take_record_request());
    }
}
